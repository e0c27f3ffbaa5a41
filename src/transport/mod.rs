//! WebSocket transport layer.
//!
//! ```text
//! ┌─────────────────┐                              ┌─────────────────┐
//! │  Plugin (Rust)  │         WebSocket            │  Host           │
//! │                 │─────────────────────────────►│                 │
//! │  Socket         │◄─────────────────────────────│  Plugin API     │
//! │  → events       │      ws://localhost:PORT     │  server         │
//! └─────────────────┘                              └─────────────────┘
//! ```
//!
//! The plugin is always the connecting side. One [`Socket`] per `start`;
//! its events feed the client's state machine in order.

// ============================================================================
// Submodules
// ============================================================================

/// WebSocket connection and I/O loop.
pub(crate) mod connection;

/// In-process host for tests.
#[cfg(test)]
pub(crate) mod mock;

// ============================================================================
// Re-exports
// ============================================================================

pub(crate) use connection::{Socket, TransportEvent};
