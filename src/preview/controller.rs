//! Live parameter preview.
//!
//! Keeps the current model's tracking and rig parameters up to date from
//! host events.
//!
//! | Trigger | Action |
//! |---------|--------|
//! | `Established` | save the token |
//! | `Available` | subscribe to frames and model changes, fetch the current model |
//! | any other state | forget the current model |
//! | model changed | refetch both tables |
//! | frame | update values of the current model |
//!
//! # Example
//!
//! ```no_run
//! use nlplugin::{FileTokenStore, ParameterPreview, Plugin};
//!
//! # async fn example() -> nlplugin::Result<()> {
//! let plugin = Plugin::new("Parameters Preview")?;
//! let preview = ParameterPreview::attach(plugin, FileTokenStore::new("token.txt"))?;
//!
//! preview.toggle("ws://localhost:22022/")?;
//!
//! let mut updates = preview.subscribe();
//! while updates.changed().await.is_ok() {
//!     let snapshot = preview.snapshot();
//!     println!("{}\n{}", snapshot.model_id, snapshot.live);
//! }
//! # Ok(())
//! # }
//! ```

// ============================================================================
// Imports
// ============================================================================

use std::sync::{Arc, Weak};

use parking_lot::RwLock;
use serde_json::{Value, json, to_value};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::client::{Plugin, State};
use crate::error::Result;
use crate::protocol::Envelope;
use crate::protocol::parameters::{
    CubismParameters, CurrentModel, EnableNotification, FrameUpdate, GET_CUBISM_PARAMETERS,
    GET_CURRENT_MODEL_ID, GET_LIVE_PARAMETERS, LiveParameters, ModelQuery,
    NOTIFY_CURRENT_MODEL_CHANGED, NOTIFY_FRAME_UPDATED,
};

use super::store::TokenStore;
use super::table::ParameterTable;

// ============================================================================
// PreviewSnapshot
// ============================================================================

/// What the preview currently shows.
#[derive(Debug, Clone, Default)]
pub struct PreviewSnapshot {
    /// Current model; empty when none.
    pub model_id: String,
    /// Tracking parameters.
    pub live: ParameterTable,
    /// Model parameters.
    pub cubism: ParameterTable,
}

// ============================================================================
// ParameterPreview
// ============================================================================

/// Drives a [`Plugin`] to mirror the host's parameters.
///
/// Attaching takes over the plugin's state callback.
#[derive(Clone)]
pub struct ParameterPreview {
    inner: Arc<PreviewInner>,
}

struct PreviewInner {
    plugin: Plugin,
    store: Box<dyn TokenStore>,
    view: RwLock<PreviewSnapshot>,
    /// Bumped on every view change.
    revision: watch::Sender<u64>,
}

impl ParameterPreview {
    /// Restores the saved token and wires the preview to `plugin`.
    ///
    /// # Errors
    ///
    /// Returns an error if the saved token cannot be loaded.
    pub fn attach<S>(plugin: Plugin, store: S) -> Result<Self>
    where
        S: TokenStore + 'static,
    {
        if let Some(token) = store.load()? {
            debug!("Restored saved token");
            plugin.set_token(token);
        }

        let (revision, _) = watch::channel(0);
        let inner = Arc::new(PreviewInner {
            plugin: plugin.clone(),
            store: Box::new(store),
            view: RwLock::new(PreviewSnapshot::default()),
            revision,
        });

        // Weak handles: the plugin must not keep the preview alive
        let weak = Arc::downgrade(&inner);
        plugin.set_on_state_changed(move |state| {
            if let Some(inner) = weak.upgrade() {
                inner.on_state_changed(state);
            }
        });

        let weak = Arc::downgrade(&inner);
        plugin.add_event_listener(NOTIFY_FRAME_UPDATED, move |event| {
            if let Some(inner) = weak.upgrade() {
                inner.on_frame(event);
            }
        });

        let weak = Arc::downgrade(&inner);
        plugin.add_event_listener(NOTIFY_CURRENT_MODEL_CHANGED, move |event| {
            match event.data_as::<CurrentModel>() {
                Ok(model) => PreviewInner::set_current_model(&weak, model.model_id),
                Err(e) => warn!(error = %e, "Bad model change event"),
            }
        });

        Ok(Self { inner })
    }

    /// Starts the plugin when closed, stops it otherwise.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidAddress`](crate::Error::InvalidAddress) if
    /// starting with a bad address.
    pub fn toggle(&self, address: &str) -> Result<()> {
        let plugin = &self.inner.plugin;
        if plugin.state() == State::Closed {
            plugin.start(address)
        } else {
            plugin.stop();
            Ok(())
        }
    }

    /// The driven plugin.
    #[inline]
    #[must_use]
    pub fn plugin(&self) -> &Plugin {
        &self.inner.plugin
    }

    /// Copy of the current view.
    #[must_use]
    pub fn snapshot(&self) -> PreviewSnapshot {
        self.inner.view.read().clone()
    }

    /// Current model id; empty when none.
    #[must_use]
    pub fn model_id(&self) -> String {
        self.inner.view.read().model_id.clone()
    }

    /// Notifies on every view change.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.inner.revision.subscribe()
    }
}

// ============================================================================
// PreviewInner
// ============================================================================

impl PreviewInner {
    fn on_state_changed(self: &Arc<Self>, state: State) {
        match state {
            State::Established => self.save_token(),
            State::Available => {
                let inner = Arc::downgrade(self);
                tokio::spawn(Self::subscribe_and_fetch(inner));
                return;
            }
            _ => {}
        }
        self.update(|view| view.model_id.clear());
    }

    fn save_token(&self) {
        let Some(token) = self.plugin.token() else {
            return;
        };
        if let Err(e) = self.store.save(&token) {
            warn!(error = %e, "Failed to save token");
        }
    }

    /// Enables notifications and loads the current model.
    async fn subscribe_and_fetch(inner: Weak<Self>) {
        let Some(plugin) = inner.upgrade().map(|inner| inner.plugin.clone()) else {
            return;
        };

        let (frames, models, current) = tokio::join!(
            call(&plugin, NOTIFY_FRAME_UPDATED, EnableNotification { enabled: true }),
            call(
                &plugin,
                NOTIFY_CURRENT_MODEL_CHANGED,
                EnableNotification { enabled: true }
            ),
            plugin.call_method(GET_CURRENT_MODEL_ID, Value::Null),
        );

        for (method, result) in [
            (NOTIFY_FRAME_UPDATED, frames),
            (NOTIFY_CURRENT_MODEL_CHANGED, models),
        ] {
            if let Err(e) = result {
                warn!(method, error = %e, "Subscription failed");
            }
        }

        match current.and_then(|reply| reply.data_as::<CurrentModel>()) {
            Ok(model) => Self::set_current_model(&inner, model.model_id),
            Err(e) => warn!(error = %e, "Failed to get current model"),
        }
    }

    /// Switches to `model_id` and refetches both tables.
    fn set_current_model(inner: &Weak<Self>, model_id: String) {
        let Some(this) = inner.upgrade() else {
            return;
        };
        info!(%model_id, "Current model");
        this.update(|view| view.model_id.clone_from(&model_id));

        let inner = inner.clone();
        tokio::spawn(async move {
            let Some(plugin) = inner.upgrade().map(|inner| inner.plugin.clone()) else {
                return;
            };

            let (live, cubism) = tokio::join!(
                plugin.call_method(GET_LIVE_PARAMETERS, json!({})),
                call(
                    &plugin,
                    GET_CUBISM_PARAMETERS,
                    ModelQuery {
                        model_id: model_id.clone()
                    }
                ),
            );

            let Some(this) = inner.upgrade() else {
                return;
            };

            match live.and_then(|reply| reply.data_as::<LiveParameters>()) {
                Ok(live) => this.update_for(&model_id, |view| {
                    view.live.rebuild(live.live_parameters);
                }),
                Err(e) => warn!(error = %e, "Failed to get live parameters"),
            }

            match cubism.and_then(|reply| reply.data_as::<CubismParameters>()) {
                Ok(cubism) => this.update_for(&model_id, |view| {
                    view.cubism.rebuild(cubism.cubism_parameters);
                }),
                Err(e) => warn!(error = %e, "Failed to get model parameters"),
            }
        });
    }

    fn on_frame(&self, event: &Envelope) {
        let frame = match event.data_as::<FrameUpdate>() {
            Ok(frame) => frame,
            Err(e) => {
                warn!(error = %e, "Bad frame event");
                return;
            }
        };

        let mut view = self.view.write();
        let mut updated = 0;
        for model in frame.models {
            if model.model_id != view.model_id {
                continue;
            }
            updated += view.live.apply(&model.live_parameter_values);
            updated += view.cubism.apply(&model.cubism_parameter_values);
        }
        drop(view);

        if updated > 0 {
            self.revision.send_modify(|revision| *revision += 1);
        }
    }

    fn update(&self, change: impl FnOnce(&mut PreviewSnapshot)) {
        change(&mut self.view.write());
        self.revision.send_modify(|revision| *revision += 1);
    }

    /// Applies `change` only if `model_id` is still current.
    fn update_for(&self, model_id: &str, change: impl FnOnce(&mut PreviewSnapshot)) {
        {
            let mut view = self.view.write();
            if view.model_id != model_id {
                debug!(%model_id, "Dropping parameters for previous model");
                return;
            }
            change(&mut view);
        }
        self.revision.send_modify(|revision| *revision += 1);
    }
}

/// Calls `method` with typed request data.
async fn call<T: serde::Serialize>(plugin: &Plugin, method: &str, data: T) -> Result<Envelope> {
    plugin.call_method(method, to_value(data)?).await
}

// ============================================================================
// Tests
// ============================================================================
