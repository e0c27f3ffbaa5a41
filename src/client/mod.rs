//! Plugin client.
//!
//! | Type | Description |
//! |------|-------------|
//! | [`Plugin`] | Connection to a host's plugin API |
//! | [`PluginBuilder`] | Name, version, token and timing settings |
//! | [`State`] | Connection lifecycle state |
//! | [`HandshakeStep`] | Session handshake attempts |
//!
//! # Lifecycle
//!
//! ```text
//! Closed ──start──► Connecting ──open──► Open ──handshake──► Established ◄──► Available
//!    ▲                  │ open failed: retry after delay                  enabled changed
//!    └──── stop / close / handshake failed ◄───────────────────────────────────┘
//! ```

// ============================================================================
// Submodules
// ============================================================================

/// Plugin configuration builder.
pub mod builder;

/// Plugin connection and messaging.
pub mod core;

/// Session handshake.
pub mod handshake;

/// Listener and callback types.
pub mod listeners;

/// Connection state.
pub mod state;

// ============================================================================
// Re-exports
// ============================================================================

pub use builder::{DEFAULT_RECONNECT_DELAY, PluginBuilder};
pub use self::core::Plugin;
pub use handshake::HandshakeStep;
pub use listeners::{EventListener, StateHandler};
pub use state::State;
