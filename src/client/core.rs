//! Plugin client: connection lifecycle, request correlation and event routing.
//!
//! # Example
//!
//! ```no_run
//! use nlplugin::{Plugin, State};
//! use serde_json::json;
//!
//! # async fn example() -> nlplugin::Result<()> {
//! let plugin = Plugin::builder()
//!     .name("Parameters Preview")
//!     .developer("Example Inc.")
//!     .version("1.0.0")
//!     .build()?;
//!
//! plugin.set_on_state_changed(|state| println!("state: {state}"));
//! plugin.add_event_listener("NotifyFrameUpdated", |event| println!("{}", event.data));
//!
//! plugin.start_localhost(22022)?;
//! plugin.wait_for_state(State::Available).await?;
//!
//! let reply = plugin.call_method("GetCurrentModelId", json!({})).await?;
//! println!("model: {}", reply.data["ModelId"]);
//! # Ok(())
//! # }
//! ```

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::{Mutex, ReentrantMutex, RwLock};
use rustc_hash::FxHashMap;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{sleep, timeout};
use tracing::{debug, info, trace, warn};
use url::Url;

use crate::error::{Error, Result};
use crate::identifiers::MessageId;
use crate::protocol::{Envelope, InboundEvent, MessageType};
use crate::transport::{Socket, TransportEvent};

use super::builder::PluginBuilder;
use super::handshake;
use super::listeners::{EventListener, ListenerRegistry, StateHandler};
use super::state::State;

// ============================================================================
// Types
// ============================================================================

/// Map of request ids to reply channels.
type PendingMap = FxHashMap<MessageId, oneshot::Sender<Result<Envelope>>>;

/// Runtime-mutable settings.
#[derive(Debug, Clone, Default)]
pub(crate) struct Settings {
    /// Developer name sent on registration.
    pub developer: String,
    /// Plugin version.
    pub version: String,
    /// Session token; never empty when present.
    pub token: Option<String>,
    /// Mirror envelopes to the log.
    pub debug: bool,
}

/// Internal shared state for a plugin.
pub(crate) struct PluginInner {
    /// Plugin name.
    name: String,
    /// Mutable settings.
    settings: RwLock<Settings>,
    /// Delay before retrying a failed open.
    reconnect_delay: Duration,
    /// Optional per-request timeout.
    request_timeout: Option<Duration>,
    /// Current state; the watch channel doubles as the state cell.
    state: watch::Sender<State>,
    /// Serializes transitions and their notifications.
    transition: ReentrantMutex<()>,
    /// User state-change callback.
    on_state_changed: Mutex<Option<StateHandler>>,
    /// Event listeners.
    listeners: Mutex<ListenerRegistry>,
    /// In-flight requests.
    pending: Mutex<PendingMap>,
    /// Current socket.
    socket: Mutex<Option<Socket>>,
    /// Bumped whenever the socket is replaced or dropped.
    generation: AtomicU64,
    /// Next request id.
    next_id: AtomicU64,
    /// Enablement reported by the host while the handshake was running.
    deferred_enabled: Mutex<Option<bool>>,
}

// ============================================================================
// Plugin
// ============================================================================

/// Client for a host's plugin API.
///
/// Cloning is cheap; all clones share one connection.
///
/// Operations that spawn work (`start`, incoming events) must run inside a
/// tokio runtime.
#[derive(Clone)]
pub struct Plugin {
    /// Shared inner state.
    pub(crate) inner: Arc<PluginInner>,
}

// ============================================================================
// Plugin - Display
// ============================================================================

impl fmt::Debug for Plugin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Plugin")
            .field("name", &self.inner.name)
            .field("state", &self.state())
            .field("pending", &self.pending_count())
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Plugin - Constructor
// ============================================================================

impl Plugin {
    /// Creates a plugin with default settings.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if `name` is blank.
    pub fn new(name: impl Into<String>) -> Result<Self> {
        PluginBuilder::new().name(name).build()
    }

    /// Creates a configuration builder.
    #[inline]
    #[must_use]
    pub fn builder() -> PluginBuilder {
        PluginBuilder::new()
    }

    /// Creates the plugin from a validated builder.
    pub(crate) fn from_builder(name: String, builder: PluginBuilder) -> Self {
        let (state, _) = watch::channel(State::Closed);

        let inner = PluginInner {
            name,
            settings: RwLock::new(Settings {
                developer: builder.developer,
                version: builder.version,
                token: builder.token,
                debug: builder.debug,
            }),
            reconnect_delay: builder.reconnect_delay,
            request_timeout: builder.request_timeout,
            state,
            transition: ReentrantMutex::new(()),
            on_state_changed: Mutex::new(None),
            listeners: Mutex::new(ListenerRegistry::default()),
            pending: Mutex::new(PendingMap::default()),
            socket: Mutex::new(None),
            generation: AtomicU64::new(0),
            next_id: AtomicU64::new(0),
            deferred_enabled: Mutex::new(None),
        };

        Self {
            inner: Arc::new(inner),
        }
    }
}

// ============================================================================
// Plugin - Lifecycle
// ============================================================================

impl Plugin {
    /// Connects to `address` (`ws://host:port/`).
    ///
    /// Any existing connection is closed first and its pending requests fail
    /// with [`Error::ConnectionClosed`].
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidAddress`] if `address` is not a WebSocket URL.
    pub fn start(&self, address: &str) -> Result<()> {
        let url = parse_address(address)?;
        self.inner.start(url);
        Ok(())
    }

    /// Connects to `ws://localhost:{port}/`.
    ///
    /// # Errors
    ///
    /// See [`Plugin::start`].
    pub fn start_localhost(&self, port: u16) -> Result<()> {
        self.start(&format!("ws://localhost:{port}/"))
    }

    /// Closes the connection. Idempotent.
    pub fn stop(&self) {
        self.inner.stop();
    }

    /// Address of the current connection, if any.
    #[must_use]
    pub fn address(&self) -> Option<String> {
        self.inner
            .socket
            .lock()
            .as_ref()
            .map(|socket| socket.url().to_string())
    }
}

// ============================================================================
// Plugin - State
// ============================================================================

impl Plugin {
    /// Current state.
    #[inline]
    #[must_use]
    pub fn state(&self) -> State {
        self.inner.state()
    }

    /// Sets the callback invoked on every state change.
    ///
    /// The callback runs synchronously on the task that caused the change and
    /// may call back into the plugin.
    pub fn set_on_state_changed<F>(&self, handler: F)
    where
        F: Fn(State) + Send + Sync + 'static,
    {
        *self.inner.on_state_changed.lock() = Some(Arc::new(handler));
    }

    /// Subscribes to state changes.
    #[must_use]
    pub fn subscribe_state(&self) -> watch::Receiver<State> {
        self.inner.state.subscribe()
    }

    /// Waits until the plugin is in `state`.
    ///
    /// Returns immediately if it already is.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ConnectionClosed`] if the plugin is dropped meanwhile.
    pub async fn wait_for_state(&self, state: State) -> Result<()> {
        let mut rx = self.inner.state.subscribe();
        let reached = rx.wait_for(|current| *current == state).await.is_ok();
        if reached {
            Ok(())
        } else {
            Err(Error::ConnectionClosed)
        }
    }
}

// ============================================================================
// Plugin - Settings
// ============================================================================

impl Plugin {
    /// Plugin name.
    #[inline]
    #[must_use]
    pub fn name(&self) -> &str {
        self.inner.name()
    }

    /// Developer name.
    #[must_use]
    pub fn developer(&self) -> String {
        self.inner.settings.read().developer.clone()
    }

    /// Sets the developer name used by the next registration.
    pub fn set_developer(&self, developer: impl Into<String>) {
        self.inner.settings.write().developer = developer.into();
    }

    /// Plugin version.
    #[must_use]
    pub fn version(&self) -> String {
        self.inner.settings.read().version.clone()
    }

    /// Sets the version used by the next handshake.
    pub fn set_version(&self, version: impl Into<String>) {
        self.inner.settings.write().version = version.into();
    }

    /// Session token, once issued or restored.
    ///
    /// The plugin never persists the token; save it when the state becomes
    /// [`State::Established`].
    #[must_use]
    pub fn token(&self) -> Option<String> {
        self.inner.settings.read().token.clone()
    }

    /// Restores a saved token. An empty token clears it.
    pub fn set_token(&self, token: impl Into<String>) {
        self.inner.store_token(token.into());
    }

    /// Forgets the token; the next handshake registers again.
    pub fn clear_token(&self) {
        self.inner.settings.write().token = None;
    }

    /// Whether envelopes are mirrored to the log.
    #[must_use]
    pub fn debug(&self) -> bool {
        self.inner.settings.read().debug
    }

    /// Enables or disables envelope mirroring.
    pub fn set_debug(&self, debug: bool) {
        self.inner.settings.write().debug = debug;
    }
}

// ============================================================================
// Plugin - Messaging
// ============================================================================

impl Plugin {
    /// Registers `listener` for host events named `method`.
    ///
    /// Listeners are called in registration order and are never removed.
    pub fn add_event_listener<F>(&self, method: impl Into<String>, listener: F)
    where
        F: Fn(&Envelope) + Send + Sync + 'static,
    {
        let listener: EventListener = Arc::new(listener);
        self.inner.listeners.lock().add(method, listener);
    }

    /// Number of listeners registered for `method`.
    #[must_use]
    pub fn listener_count(&self, method: &str) -> usize {
        self.inner.listeners.lock().count(method)
    }

    /// Calls an API method and waits for the host's reply.
    ///
    /// # Errors
    ///
    /// - [`Error::NotReady`] unless the state is [`State::Available`]; nothing is sent
    /// - [`Error::Remote`] if the host answers with an `Error` envelope
    /// - [`Error::ConnectionClosed`] if the connection is torn down first
    /// - [`Error::RequestTimeout`] if a request timeout is configured and elapses
    pub async fn call_method(&self, method: &str, data: Value) -> Result<Envelope> {
        let state = self.state();
        if !state.is_available() {
            return Err(Error::not_ready(state));
        }
        self.inner.send_request(method, data).await
    }

    /// Number of requests awaiting a reply.
    #[inline]
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.inner.pending.lock().len()
    }
}

// ============================================================================
// PluginInner - Accessors
// ============================================================================

impl PluginInner {
    /// Plugin name.
    #[inline]
    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    /// Snapshot of the settings.
    #[inline]
    pub(crate) fn settings(&self) -> Settings {
        self.settings.read().clone()
    }

    /// Current state.
    #[inline]
    pub(crate) fn state(&self) -> State {
        *self.state.borrow()
    }

    /// Current socket generation.
    #[inline]
    pub(crate) fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// Returns `true` if `generation` still identifies the live socket.
    #[inline]
    pub(crate) fn is_current(&self, generation: u64) -> bool {
        self.generation() == generation
    }

    /// Stores a token; an empty token clears it.
    pub(crate) fn store_token(&self, token: String) {
        self.settings.write().token = Some(token).filter(|t| !t.is_empty());
    }
}

// ============================================================================
// PluginInner - State Machine
// ============================================================================

impl PluginInner {
    /// Moves to `new_state` and notifies; no-op if already there.
    pub(crate) fn set_state(&self, new_state: State) {
        let _transition = self.transition.lock();

        let changed = self.state.send_if_modified(|current| {
            if *current == new_state {
                false
            } else {
                *current = new_state;
                true
            }
        });
        if !changed {
            return;
        }

        debug!(state = %new_state, "State changed");

        let handler = self.on_state_changed.lock().clone();
        if let Some(handler) = handler {
            handler(new_state);
        }
    }

    /// Moves to `Established`, then `Available` if enabled.
    ///
    /// An enablement change received during the handshake is newer than the
    /// handshake reply and wins over `enabled`.
    pub(crate) fn complete_handshake(&self, enabled: bool) {
        let _transition = self.transition.lock();

        self.set_state(State::Established);
        let enabled = self.deferred_enabled.lock().take().unwrap_or(enabled);
        if enabled {
            self.set_state(State::Available);
        }
    }

    /// Replaces the socket with a new connection to `url`.
    fn start(self: &Arc<Self>, url: Url) {
        let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;

        let previous = self.socket.lock().take();
        if let Some(previous) = previous {
            debug!(url = %previous.url(), "Detaching previous socket");
            previous.close();
        }
        self.fail_pending();
        self.deferred_enabled.lock().take();

        self.set_state(State::Connecting);
        if !self.is_current(generation) {
            // The state callback restarted or stopped the plugin
            return;
        }

        info!(%url, "Connecting to host");
        let (socket, events) = Socket::open(url);
        *self.socket.lock() = Some(socket);

        tokio::spawn(Self::pump(Arc::downgrade(self), generation, events));
    }

    /// Tears down the socket and moves to `Closed`.
    pub(crate) fn stop(&self) {
        self.generation.fetch_add(1, Ordering::AcqRel);

        let socket = self.socket.lock().take();
        if let Some(socket) = socket {
            info!(url = %socket.url(), "Closing connection");
            socket.close();
        }
        self.fail_pending();
        self.deferred_enabled.lock().take();

        self.set_state(State::Closed);
    }

    /// Feeds transport events for one socket into the state machine, in order.
    async fn pump(
        inner: Weak<Self>,
        generation: u64,
        mut events: mpsc::UnboundedReceiver<TransportEvent>,
    ) {
        while let Some(event) = events.recv().await {
            let Some(inner) = inner.upgrade() else {
                break;
            };
            if !inner.is_current(generation) {
                trace!(generation, "Ignoring event from detached socket");
                break;
            }

            match event {
                TransportEvent::Opened => inner.handle_open(generation),
                TransportEvent::Message(text) => inner.dispatch(&text),
                TransportEvent::Closed => {
                    inner.handle_close(generation);
                    break;
                }
            }
        }
    }

    /// Socket opened: move to `Open` and start the handshake.
    fn handle_open(self: &Arc<Self>, generation: u64) {
        self.set_state(State::Open);

        let inner = Arc::clone(self);
        tokio::spawn(async move {
            let outcome = handshake::run(&inner, generation).await;
            trace!(?outcome, generation, "Handshake task finished");
        });
    }

    /// Socket closed: retry if it never opened, otherwise stop.
    fn handle_close(self: &Arc<Self>, generation: u64) {
        if self.state() != State::Connecting {
            info!("Connection closed");
            self.stop();
            return;
        }

        let url = self.socket.lock().as_ref().map(|socket| socket.url().clone());
        let Some(url) = url else {
            return;
        };

        let delay = self.reconnect_delay;
        debug!(%url, delay_ms = delay.as_millis() as u64, "Open failed; scheduling retry");

        let inner = Arc::downgrade(self);
        tokio::spawn(async move {
            sleep(delay).await;
            if let Some(inner) = inner.upgrade()
                && inner.is_current(generation)
            {
                inner.start(url);
            }
        });
    }

    /// Fails every pending request with [`Error::ConnectionClosed`].
    fn fail_pending(&self) {
        let pending: Vec<_> = self.pending.lock().drain().collect();
        let count = pending.len();

        for (_, tx) in pending {
            let _ = tx.send(Err(Error::ConnectionClosed));
        }

        if count > 0 {
            debug!(count, "Failed pending requests");
        }
    }
}

// ============================================================================
// PluginInner - Messaging
// ============================================================================

impl PluginInner {
    /// Sends a request and waits for the correlated reply.
    pub(crate) async fn send_request(&self, method: &str, data: Value) -> Result<Envelope> {
        let id = MessageId::from_sequence(self.next_id.fetch_add(1, Ordering::Relaxed));
        let envelope = Envelope::request(id.clone(), method, data);
        let text = envelope.to_text()?;
        self.mirror("Send", &envelope);

        // Store correlation before sending
        let (response_tx, response_rx) = oneshot::channel();
        self.pending.lock().insert(id.clone(), response_tx);

        let sent = self
            .socket
            .lock()
            .as_ref()
            .map_or(Err(Error::ConnectionClosed), |socket| socket.send_text(text));
        if let Err(e) = sent {
            self.pending.lock().remove(&id);
            return Err(e);
        }

        match self.request_timeout {
            None => response_rx.await?,
            Some(limit) => match timeout(limit, response_rx).await {
                Ok(reply) => reply?,
                Err(_) => {
                    self.pending.lock().remove(&id);
                    Err(Error::request_timeout(id, limit.as_millis() as u64))
                }
            },
        }
    }

    /// Routes one inbound text frame.
    pub(crate) fn dispatch(&self, text: &str) {
        let envelope = match Envelope::from_text(text) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(error = %e, "Dropping unparseable message");
                return;
            }
        };
        self.mirror("Received", &envelope);

        match envelope.message_type {
            MessageType::Response | MessageType::Error => self.resolve(envelope),
            MessageType::Event => self.deliver_event(&envelope),
            MessageType::Request | MessageType::Unknown => {
                debug!(method = %envelope.method, "Ignoring unexpected message type");
            }
        }
    }

    /// Completes the pending request a reply belongs to.
    fn resolve(&self, envelope: Envelope) {
        let Some(id) = envelope.id.clone() else {
            debug!(method = %envelope.method, "Reply without id");
            return;
        };
        let Some(tx) = self.pending.lock().remove(&id) else {
            debug!(%id, "Reply for unknown request");
            return;
        };

        let result = match envelope.message_type {
            MessageType::Response => Ok(envelope),
            _ => Err(Error::remote(envelope)),
        };
        let _ = tx.send(result);
    }

    /// Applies built-in events, then notifies listeners.
    fn deliver_event(&self, envelope: &Envelope) {
        if let InboundEvent::EnabledChanged { enabled } = envelope.parse_event() {
            let _transition = self.transition.lock();
            match self.state() {
                state if state.is_established() => self.set_state(if enabled {
                    State::Available
                } else {
                    State::Established
                }),
                State::Open => {
                    debug!(enabled, "Enablement change during handshake");
                    *self.deferred_enabled.lock() = Some(enabled);
                }
                state => debug!(enabled, %state, "Ignoring enablement change"),
            }
        }

        let listeners = self.listeners.lock().listeners_for(&envelope.method);
        for listener in listeners {
            listener(envelope);
        }
    }

    /// Logs an envelope; pretty-printed at `info` when debug is on.
    fn mirror(&self, direction: &'static str, envelope: &Envelope) {
        if self.settings.read().debug {
            info!(direction, method = %envelope.method, "\n{}", envelope.to_pretty());
        } else {
            trace!(
                direction,
                method = %envelope.method,
                id = ?envelope.id,
                message_type = ?envelope.message_type,
                "Envelope"
            );
        }
    }
}

// ============================================================================
// Helpers
// ============================================================================

/// Parses and checks a connection address.
fn parse_address(address: &str) -> Result<Url> {
    let url = Url::parse(address).map_err(|e| Error::invalid_address(address, e))?;
    match url.scheme() {
        "ws" | "wss" => Ok(url),
        scheme => Err(Error::invalid_address(
            address,
            format!("unsupported scheme `{scheme}`"),
        )),
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use proptest::prelude::*;
    use serde_json::json;

    use crate::protocol::method::NOTIFY_ENABLED_CHANGED;
    use crate::transport::mock::{MockHost, MockPeer};

    const WAIT: Duration = Duration::from_secs(5);

    /// Records every state notification.
    fn record_states(plugin: &Plugin) -> Arc<Mutex<Vec<State>>> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        plugin.set_on_state_changed(move |state| sink.lock().push(state));
        seen
    }

    async fn reach(plugin: &Plugin, state: State) {
        timeout(WAIT, plugin.wait_for_state(state))
            .await
            .expect("state reached in time")
            .expect("plugin alive");
    }

    /// Connects with a saved token and answers the handshake with `Enabled: true`.
    async fn available_plugin(builder: PluginBuilder) -> (Plugin, MockHost, MockPeer) {
        let host = MockHost::bind().await;
        let plugin = builder.token("saved").build().expect("plugin");
        plugin.start(&host.ws_url()).expect("start");

        let mut peer = host.accept().await;
        let request = peer.recv_envelope().await;
        assert_eq!(request.method, "EstablishConnection");
        peer.respond(&request, json!({ "Enabled": true })).await;

        reach(&plugin, State::Available).await;
        (plugin, host, peer)
    }

    fn preview_builder() -> PluginBuilder {
        Plugin::builder()
            .name("Parameters Preview")
            .developer("Example Inc.")
            .version("1.0.0")
    }

    #[test]
    fn test_new_requires_name() {
        assert!(matches!(Plugin::new(""), Err(Error::Config { .. })));
        assert!(Plugin::new("Preview").is_ok());
    }

    #[test]
    fn test_initial_state() {
        let plugin = Plugin::new("Preview").expect("plugin");
        assert_eq!(plugin.state(), State::Closed);
        assert_eq!(plugin.token(), None);
        assert_eq!(plugin.address(), None);
        assert_eq!(plugin.pending_count(), 0);
    }

    #[test]
    fn test_settings_are_mutable() {
        let plugin = Plugin::new("Preview").expect("plugin");
        plugin.set_developer("Dev");
        plugin.set_version("1.2.3");
        plugin.set_token("tok");
        plugin.set_debug(true);

        assert_eq!(plugin.developer(), "Dev");
        assert_eq!(plugin.version(), "1.2.3");
        assert_eq!(plugin.token().as_deref(), Some("tok"));
        assert!(plugin.debug());

        plugin.set_token("");
        assert_eq!(plugin.token(), None);
        plugin.set_token("again");
        plugin.clear_token();
        assert_eq!(plugin.token(), None);
    }

    #[test]
    fn test_stop_is_idempotent() {
        let plugin = Plugin::new("Preview").expect("plugin");
        let seen = record_states(&plugin);

        plugin.stop();
        plugin.stop();

        assert_eq!(plugin.state(), State::Closed);
        assert!(seen.lock().is_empty());
    }

    #[test]
    fn test_start_rejects_invalid_address() {
        let plugin = Plugin::new("Preview").expect("plugin");

        let err = plugin.start("http://localhost:22022/").unwrap_err();
        assert!(matches!(err, Error::InvalidAddress { .. }));
        assert!(plugin.start("not an address").is_err());
        assert_eq!(plugin.state(), State::Closed);
    }

    #[tokio::test]
    async fn test_call_method_fails_unless_available() {
        let plugin = Plugin::new("Preview").expect("plugin");

        for state in [
            State::Closed,
            State::Connecting,
            State::Open,
            State::Established,
        ] {
            plugin.inner.set_state(state);
            let err = plugin
                .call_method("GetCurrentModelId", json!({}))
                .await
                .unwrap_err();

            assert!(err.is_not_ready());
            assert!(matches!(err, Error::NotReady { state: s } if s == state));
            assert_eq!(plugin.pending_count(), 0);
        }
    }

    #[tokio::test]
    async fn test_fresh_client_registers() {
        let host = MockHost::bind().await;
        let plugin = preview_builder().build().expect("plugin");
        let seen = record_states(&plugin);

        plugin.start(&host.ws_url()).expect("start");
        let mut peer = host.accept().await;

        let request = peer.recv_envelope().await;
        assert_eq!(request.message_type, MessageType::Request);
        assert_eq!(request.method, "RegisterPlugin");
        assert_eq!(
            request.data,
            json!({
                "Name": "Parameters Preview",
                "Developer": "Example Inc.",
                "Version": "1.0.0"
            })
        );

        peer.respond(&request, json!({ "Token": "issued-token" })).await;
        reach(&plugin, State::Established).await;

        assert_eq!(plugin.token().as_deref(), Some("issued-token"));
        assert_eq!(
            *seen.lock(),
            vec![State::Connecting, State::Open, State::Established]
        );

        plugin.stop();
    }

    #[tokio::test]
    async fn test_saved_token_establishes_and_becomes_available() {
        let host = MockHost::bind().await;
        let plugin = preview_builder().token("saved").build().expect("plugin");
        let seen = record_states(&plugin);

        plugin.start(&host.ws_url()).expect("start");
        let mut peer = host.accept().await;

        let request = peer.recv_envelope().await;
        assert_eq!(request.method, "EstablishConnection");
        assert_eq!(request.data["Token"], "saved");
        assert_eq!(request.data["Name"], "Parameters Preview");
        assert_eq!(request.data["Version"], "1.0.0");

        peer.respond(&request, json!({ "Enabled": true })).await;
        reach(&plugin, State::Available).await;

        assert_eq!(
            *seen.lock(),
            vec![
                State::Connecting,
                State::Open,
                State::Established,
                State::Available
            ]
        );

        plugin.stop();
    }

    #[tokio::test]
    async fn test_establish_disabled_stays_established() {
        let host = MockHost::bind().await;
        let plugin = preview_builder().token("saved").build().expect("plugin");

        plugin.start(&host.ws_url()).expect("start");
        let mut peer = host.accept().await;

        let request = peer.recv_envelope().await;
        peer.respond(&request, json!({ "Enabled": false })).await;
        reach(&plugin, State::Established).await;

        // Nothing else is sent after a successful establish
        assert!(peer.try_recv_text(Duration::from_millis(100)).await.is_none());
        assert_eq!(plugin.state(), State::Established);

        plugin.stop();
    }

    #[tokio::test]
    async fn test_rejected_establish_falls_back_to_register() {
        let host = MockHost::bind().await;
        let plugin = preview_builder().token("stale").build().expect("plugin");

        plugin.start(&host.ws_url()).expect("start");
        let mut peer = host.accept().await;

        let establish = peer.recv_envelope().await;
        assert_eq!(establish.method, "EstablishConnection");
        peer.reject(&establish, json!({ "Message": "unknown token" })).await;

        let register = peer.recv_envelope().await;
        assert_eq!(register.method, "RegisterPlugin");
        assert_ne!(register.id, establish.id);
        peer.respond(&register, json!({ "Token": "fresh" })).await;

        reach(&plugin, State::Established).await;
        assert_eq!(plugin.token().as_deref(), Some("fresh"));

        plugin.stop();
    }

    #[tokio::test]
    async fn test_rejected_handshake_stops() {
        let host = MockHost::bind().await;
        let plugin = preview_builder().token("stale").build().expect("plugin");
        let seen = record_states(&plugin);

        plugin.start(&host.ws_url()).expect("start");
        let mut peer = host.accept().await;

        let establish = peer.recv_envelope().await;
        peer.reject(&establish, json!({})).await;
        let register = peer.recv_envelope().await;
        peer.reject(&register, json!({})).await;

        reach(&plugin, State::Closed).await;
        assert_eq!(peer.recv_text().await, None);
        assert_eq!(
            *seen.lock(),
            vec![State::Connecting, State::Open, State::Closed]
        );
        assert_eq!(plugin.address(), None);
    }

    #[tokio::test]
    async fn test_call_method_correlates_out_of_order_replies() {
        let (plugin, _host, mut peer) = available_plugin(preview_builder()).await;

        let live = tokio::spawn({
            let plugin = plugin.clone();
            async move { plugin.call_method("GetLiveParameters", json!({})).await }
        });
        let cubism = tokio::spawn({
            let plugin = plugin.clone();
            async move {
                plugin
                    .call_method("GetCubismParameters", json!({ "ModelId": "m1" }))
                    .await
            }
        });

        let first = peer.recv_envelope().await;
        let second = peer.recv_envelope().await;
        assert_ne!(first.id, second.id);

        // Answer in reverse order
        peer.respond(&second, json!({ "Answer": second.method })).await;
        peer.respond(&first, json!({ "Answer": first.method })).await;

        let live = live.await.expect("join").expect("live reply");
        let cubism = cubism.await.expect("join").expect("cubism reply");
        assert_eq!(live.data["Answer"], "GetLiveParameters");
        assert_eq!(cubism.data["Answer"], "GetCubismParameters");
        assert_eq!(plugin.pending_count(), 0);

        plugin.stop();
    }

    #[tokio::test]
    async fn test_error_reply_rejects_call() {
        let (plugin, _host, mut peer) = available_plugin(preview_builder()).await;

        let call = tokio::spawn({
            let plugin = plugin.clone();
            async move { plugin.call_method("GetCubismParameters", json!({})).await }
        });

        let request = peer.recv_envelope().await;
        peer.reject(&request, json!({ "ErrorType": "InvalidData" })).await;

        let err = call.await.expect("join").unwrap_err();
        assert!(err.is_remote());
        let envelope = err.remote_envelope().expect("envelope");
        assert_eq!(envelope.message_type, MessageType::Error);
        assert_eq!(envelope.data["ErrorType"], "InvalidData");
        assert_eq!(plugin.pending_count(), 0);

        plugin.stop();
    }

    #[tokio::test]
    async fn test_unmatched_replies_are_ignored() {
        let (plugin, _host, mut peer) = available_plugin(preview_builder()).await;

        let stray = Envelope {
            id: Some(MessageId::new("never-issued")),
            ..Envelope::event("GetCurrentModelId", json!({}))
        };
        let stray = Envelope {
            message_type: MessageType::Response,
            ..stray
        };
        peer.send(&stray).await;

        let call = tokio::spawn({
            let plugin = plugin.clone();
            async move { plugin.call_method("GetCurrentModelId", json!({})).await }
        });
        let request = peer.recv_envelope().await;
        peer.respond(&request, json!({ "ModelId": "m1" })).await;
        // Duplicate reply for an already resolved request
        peer.respond(&request, json!({ "ModelId": "other" })).await;

        let reply = call.await.expect("join").expect("reply");
        assert_eq!(reply.data["ModelId"], "m1");

        // Round-trip once more so the duplicate has been processed
        let call = tokio::spawn({
            let plugin = plugin.clone();
            async move { plugin.call_method("GetCurrentModelId", json!({})).await }
        });
        let request = peer.recv_envelope().await;
        peer.respond(&request, json!({ "ModelId": "m2" })).await;
        assert_eq!(call.await.expect("join").expect("reply").data["ModelId"], "m2");

        assert_eq!(plugin.pending_count(), 0);
        assert_eq!(plugin.state(), State::Available);

        plugin.stop();
    }

    #[tokio::test]
    async fn test_enabled_changed_toggles_availability() {
        let (plugin, _host, mut peer) = available_plugin(preview_builder()).await;
        let seen = record_states(&plugin);

        let received = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&received);
        plugin.add_event_listener(NOTIFY_ENABLED_CHANGED, move |event| {
            sink.lock().push(event.data["Enabled"].as_bool());
        });

        peer.send(&Envelope::event(
            NOTIFY_ENABLED_CHANGED,
            json!({ "Enabled": false }),
        ))
        .await;
        reach(&plugin, State::Established).await;

        peer.send(&Envelope::event(
            NOTIFY_ENABLED_CHANGED,
            json!({ "Enabled": true }),
        ))
        .await;
        reach(&plugin, State::Available).await;

        assert_eq!(*seen.lock(), vec![State::Established, State::Available]);
        assert_eq!(*received.lock(), vec![Some(false), Some(true)]);

        plugin.stop();
    }

    #[test]
    fn test_enabled_changed_ignored_before_open() {
        let plugin = Plugin::new("Preview").expect("plugin");
        plugin.inner.set_state(State::Connecting);

        let event = Envelope::event(NOTIFY_ENABLED_CHANGED, json!({ "Enabled": true }));
        plugin.inner.dispatch(&event.to_text().expect("serialize"));
        assert_eq!(plugin.state(), State::Connecting);

        plugin.inner.set_state(State::Open);
        plugin.inner.complete_handshake(false);
        assert_eq!(plugin.state(), State::Established);
    }

    #[test]
    fn test_enabled_changed_during_handshake_wins_over_reply() {
        let plugin = Plugin::new("Preview").expect("plugin");
        let seen = record_states(&plugin);
        plugin.inner.set_state(State::Open);

        let enable = Envelope::event(NOTIFY_ENABLED_CHANGED, json!({ "Enabled": true }));
        plugin.inner.dispatch(&enable.to_text().expect("serialize"));
        assert_eq!(plugin.state(), State::Open);

        // Reply said disabled, but the event arrived after it
        plugin.inner.complete_handshake(false);
        assert_eq!(plugin.state(), State::Available);
        assert_eq!(
            *seen.lock(),
            vec![State::Open, State::Established, State::Available]
        );
    }

    #[test]
    fn test_disable_during_handshake_wins_over_reply() {
        let plugin = Plugin::new("Preview").expect("plugin");
        plugin.inner.set_state(State::Open);

        let disable = Envelope::event(NOTIFY_ENABLED_CHANGED, json!({ "Enabled": false }));
        plugin.inner.dispatch(&disable.to_text().expect("serialize"));

        plugin.inner.complete_handshake(true);
        assert_eq!(plugin.state(), State::Established);
    }

    #[test]
    fn test_stop_discards_enablement_from_handshake() {
        let plugin = Plugin::new("Preview").expect("plugin");
        plugin.inner.set_state(State::Open);

        let enable = Envelope::event(NOTIFY_ENABLED_CHANGED, json!({ "Enabled": true }));
        plugin.inner.dispatch(&enable.to_text().expect("serialize"));
        plugin.stop();

        plugin.inner.set_state(State::Open);
        plugin.inner.complete_handshake(false);
        assert_eq!(plugin.state(), State::Established);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_enable_event_right_after_establish_reply() {
        let host = MockHost::bind().await;
        let plugin = preview_builder().token("saved").build().expect("plugin");

        plugin.start(&host.ws_url()).expect("start");
        let mut peer = host.accept().await;

        let request = peer.recv_envelope().await;
        assert_eq!(request.method, "EstablishConnection");

        // Back-to-back: the handshake may still be handling the reply when
        // the event is dispatched
        peer.respond(&request, json!({ "Enabled": false })).await;
        peer.send(&Envelope::event(
            NOTIFY_ENABLED_CHANGED,
            json!({ "Enabled": true }),
        ))
        .await;

        reach(&plugin, State::Available).await;
        sleep(Duration::from_millis(100)).await;
        assert_eq!(plugin.state(), State::Available);

        plugin.stop();
    }

    #[test]
    fn test_listeners_receive_events_in_registration_order() {
        let plugin = Plugin::new("Preview").expect("plugin");
        let calls = Arc::new(Mutex::new(Vec::new()));

        for tag in ["first", "second"] {
            let calls = Arc::clone(&calls);
            plugin.add_event_listener("NotifyFrameUpdated", move |event| {
                calls.lock().push((tag, event.data["Frame"].as_u64()));
            });
        }
        plugin.add_event_listener("NotifyCurrentModelChanged", |_| {
            panic!("wrong listener");
        });
        assert_eq!(plugin.listener_count("NotifyFrameUpdated"), 2);
        assert_eq!(plugin.listener_count("NotifyEnabledChanged"), 0);

        for frame in [1, 2] {
            let event = Envelope::event("NotifyFrameUpdated", json!({ "Frame": frame }));
            plugin.inner.dispatch(&event.to_text().expect("serialize"));
        }

        assert_eq!(
            *calls.lock(),
            vec![
                ("first", Some(1)),
                ("second", Some(1)),
                ("first", Some(2)),
                ("second", Some(2)),
            ]
        );
    }

    #[test]
    fn test_garbage_is_dropped() {
        let plugin = Plugin::new("Preview").expect("plugin");
        plugin.inner.dispatch("{ not json");
        plugin.inner.dispatch(r#"{"Type":"Response","Id":"0"}"#);
        assert_eq!(plugin.state(), State::Closed);
    }

    #[tokio::test]
    async fn test_close_after_open_stops_without_retry() {
        let host = MockHost::bind().await;
        let plugin = preview_builder()
            .reconnect_delay(Duration::from_millis(50))
            .build()
            .expect("plugin");

        plugin.start(&host.ws_url()).expect("start");
        let mut peer = host.accept().await;
        let request = peer.recv_envelope().await;
        peer.respond(&request, json!({ "Token": "t" })).await;
        reach(&plugin, State::Established).await;

        peer.close().await;
        reach(&plugin, State::Closed).await;

        assert!(host.try_accept_raw(Duration::from_millis(300)).await.is_none());
        assert_eq!(plugin.state(), State::Closed);
    }

    #[tokio::test]
    async fn test_close_during_handshake_stops_without_retry() {
        let host = MockHost::bind().await;
        let plugin = preview_builder()
            .reconnect_delay(Duration::from_millis(50))
            .build()
            .expect("plugin");
        let seen = record_states(&plugin);

        plugin.start(&host.ws_url()).expect("start");
        let mut peer = host.accept().await;

        // Close before answering the first handshake request
        let request = peer.recv_envelope().await;
        assert_eq!(request.method, "RegisterPlugin");
        assert_eq!(plugin.state(), State::Open);
        peer.close().await;

        reach(&plugin, State::Closed).await;
        assert!(host.try_accept_raw(Duration::from_millis(300)).await.is_none());
        assert_eq!(
            *seen.lock(),
            vec![State::Connecting, State::Open, State::Closed]
        );
        assert_eq!(plugin.token(), None);
        assert_eq!(plugin.pending_count(), 0);
    }

    #[derive(Clone, Default)]
    struct CapturedLog(Arc<Mutex<Vec<u8>>>);

    impl std::io::Write for CapturedLog {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    /// Runs a handshake with an `info` capture installed and returns the log.
    async fn handshake_log(debug: bool) -> String {
        let log = CapturedLog::default();
        let writer = log.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_writer(move || writer.clone())
            .with_max_level(tracing::Level::INFO)
            .with_ansi(false)
            .finish();
        let _guard = tracing::subscriber::set_default(subscriber);

        let (plugin, _host, _peer) = available_plugin(preview_builder().debug(debug)).await;
        plugin.stop();

        String::from_utf8_lossy(&log.0.lock()).into_owned()
    }

    #[tokio::test]
    async fn test_debug_mirrors_envelopes() {
        let log = handshake_log(true).await;

        assert!(log.contains("Send"), "{log}");
        assert!(log.contains("Received"), "{log}");
        // Request and reply, pretty-printed
        assert!(log.matches(r#""Method": "EstablishConnection""#).count() >= 2, "{log}");
        assert!(log.contains(r#""nLPlugin": "1.0.0""#), "{log}");
        assert!(log.contains(r#""Enabled": true"#), "{log}");
    }

    #[tokio::test]
    async fn test_envelopes_not_mirrored_without_debug() {
        let log = handshake_log(false).await;

        assert!(log.contains("Connecting to host"), "{log}");
        assert!(!log.contains(r#""Method": "#), "{log}");
    }

    #[tokio::test]
    async fn test_close_while_connecting_retries_once() {
        let host = MockHost::bind().await;
        let plugin = preview_builder()
            .reconnect_delay(Duration::from_millis(50))
            .build()
            .expect("plugin");
        let seen = record_states(&plugin);

        plugin.start(&host.ws_url()).expect("start");

        // Drop the first attempt before the WebSocket upgrade
        drop(host.accept_raw().await);

        let mut peer = host.accept().await;
        let request = peer.recv_envelope().await;
        assert_eq!(request.method, "RegisterPlugin");
        assert_eq!(plugin.address().as_deref(), Some(host.ws_url().as_str()));

        assert!(host.try_accept_raw(Duration::from_millis(200)).await.is_none());
        assert_eq!(*seen.lock(), vec![State::Connecting, State::Open]);

        plugin.stop();
    }

    #[tokio::test]
    async fn test_stop_cancels_scheduled_retry() {
        let host = MockHost::bind().await;
        let plugin = preview_builder()
            .reconnect_delay(Duration::from_millis(100))
            .build()
            .expect("plugin");

        plugin.start(&host.ws_url()).expect("start");
        drop(host.accept_raw().await);

        // Give the failed open time to be observed, then stop before the retry
        sleep(Duration::from_millis(30)).await;
        plugin.stop();

        assert!(host.try_accept_raw(Duration::from_millis(300)).await.is_none());
        assert_eq!(plugin.state(), State::Closed);
    }

    #[tokio::test]
    async fn test_stop_fails_pending_requests() {
        let (plugin, _host, mut peer) = available_plugin(preview_builder()).await;

        let call = tokio::spawn({
            let plugin = plugin.clone();
            async move { plugin.call_method("GetLiveParameters", json!({})).await }
        });
        let _request = peer.recv_envelope().await;
        assert_eq!(plugin.pending_count(), 1);

        plugin.stop();

        let err = call.await.expect("join").unwrap_err();
        assert!(matches!(err, Error::ConnectionClosed));
        assert_eq!(plugin.state(), State::Closed);
        assert_eq!(plugin.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_request_timeout() {
        let builder = preview_builder().request_timeout(Duration::from_millis(100));
        let (plugin, _host, mut peer) = available_plugin(builder).await;

        let call = tokio::spawn({
            let plugin = plugin.clone();
            async move { plugin.call_method("GetLiveParameters", json!({})).await }
        });
        let _unanswered = peer.recv_envelope().await;

        let err = call.await.expect("join").unwrap_err();
        assert!(err.is_timeout());
        assert_eq!(plugin.pending_count(), 0);

        plugin.stop();
    }

    #[tokio::test]
    async fn test_restart_replaces_socket() {
        let host = MockHost::bind().await;
        let plugin = preview_builder().build().expect("plugin");

        plugin.start(&host.ws_url()).expect("start");
        let mut first = host.accept().await;
        let _register = first.recv_envelope().await;

        plugin.start_localhost(host.port()).expect("restart");
        let mut second = host.accept().await;

        assert_eq!(first.recv_text().await, None);
        let request = second.recv_envelope().await;
        assert_eq!(request.method, "RegisterPlugin");
        assert_eq!(
            plugin.address(),
            Some(format!("ws://localhost:{}/", host.port()))
        );

        plugin.stop();
    }

    #[tokio::test]
    async fn test_request_ids_are_monotonic() {
        let (plugin, _host, mut peer) = available_plugin(preview_builder()).await;

        let mut ids = Vec::new();
        for _ in 0..3 {
            let call = tokio::spawn({
                let plugin = plugin.clone();
                async move { plugin.call_method("GetCurrentModelId", Value::Null).await }
            });
            let request = peer.recv_envelope().await;
            assert!(request.data.is_null());
            ids.push(request.id.clone().expect("id"));
            peer.respond(&request, json!({})).await;
            call.await.expect("join").expect("reply");
        }

        // Id 0 went to EstablishConnection
        assert_eq!(
            ids,
            vec![
                MessageId::from_sequence(1),
                MessageId::from_sequence(2),
                MessageId::from_sequence(3)
            ]
        );

        plugin.stop();
    }

    proptest! {
        #[test]
        fn prop_state_notifications_fire_once_per_change(
            sequence in prop::collection::vec(0u8..5, 0..40)
        ) {
            let plugin = Plugin::new("Preview").expect("plugin");
            let seen = record_states(&plugin);

            let mut expected = Vec::new();
            let mut current = State::Closed;
            for value in sequence {
                let state = State::from_u8(value).expect("valid state");
                plugin.inner.set_state(state);
                if state != current {
                    expected.push(state);
                    current = state;
                }
            }

            let seen = seen.lock().clone();
            prop_assert_eq!(&seen, &expected);
            prop_assert!(seen.windows(2).all(|pair| pair[0] != pair[1]));
            prop_assert_eq!(plugin.state(), current);
        }
    }
}
