//! Named event listener registry.

// ============================================================================
// Imports
// ============================================================================

use std::sync::Arc;

use rustc_hash::FxHashMap;

use crate::protocol::Envelope;

// ============================================================================
// Types
// ============================================================================

/// Callback invoked for each matching host event.
pub type EventListener = Arc<dyn Fn(&Envelope) + Send + Sync>;

/// Callback invoked on every state change.
pub type StateHandler = Arc<dyn Fn(super::State) + Send + Sync>;

// ============================================================================
// ListenerRegistry
// ============================================================================

/// Method name → listeners, in registration order.
///
/// Listeners are never removed.
#[derive(Default)]
pub(crate) struct ListenerRegistry {
    by_method: FxHashMap<String, Vec<EventListener>>,
}

impl ListenerRegistry {
    /// Appends a listener for `method`.
    pub(crate) fn add(&mut self, method: impl Into<String>, listener: EventListener) {
        self.by_method.entry(method.into()).or_default().push(listener);
    }

    /// Snapshot of the listeners for `method`.
    ///
    /// Cloned so callers can invoke them without holding the registry lock.
    pub(crate) fn listeners_for(&self, method: &str) -> Vec<EventListener> {
        self.by_method.get(method).cloned().unwrap_or_default()
    }

    /// Number of listeners registered for `method`.
    pub(crate) fn count(&self, method: &str) -> usize {
        self.by_method.get(method).map_or(0, Vec::len)
    }
}

// ============================================================================
// Tests
// ============================================================================
