//! nlplugin - Client for the nLPlugin WebSocket plugin API.
//!
//! A plugin connects to a host application over WebSocket, proves its
//! identity with a token, and then calls API methods and receives events.
//!
//! # Architecture
//!
//! - **Plugin (Rust)**: Connects, sends requests, receives replies and events
//! - **Host**: Serves the plugin API, decides whether the plugin is enabled
//!
//! Key design principles:
//!
//! - Each [`Plugin`] owns one WebSocket connection and its I/O task
//! - Replies are matched to requests by message id, in any order
//! - The handshake reuses a saved token and falls back to registration
//! - Event-driven architecture (no polling)
//!
//! # Quick Start
//!
//! ```no_run
//! use nlplugin::{Plugin, Result, State};
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let plugin = Plugin::builder()
//!         .name("Parameters Preview")
//!         .developer("Example Inc.")
//!         .version("1.0.0")
//!         .build()?;
//!
//!     plugin.start_localhost(22022)?;
//!     plugin.wait_for_state(State::Available).await?;
//!
//!     let reply = plugin.call_method("GetCurrentModelId", json!({})).await?;
//!     println!("Current model: {}", reply.data["ModelId"]);
//!
//!     plugin.stop();
//!     Ok(())
//! }
//! ```
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`client`] | [`Plugin`], its builder and state machine |
//! | [`error`] | Error types and [`Result`] alias |
//! | [`identifiers`] | Message id wrapper |
//! | [`preview`] | Parameter preview controller |
//! | [`protocol`] | Envelope and payload types |

// ============================================================================
// Modules
// ============================================================================

/// Plugin client.
///
/// Use [`Plugin::builder()`] to create a configured plugin.
pub mod client;

/// Error types and result aliases.
///
/// All fallible operations return [`Result<T>`] which uses [`Error`].
pub mod error;

/// Type-safe identifiers.
pub mod identifiers;

/// Parameter preview built on the client.
pub mod preview;

/// Plugin API message types.
pub mod protocol;

/// WebSocket transport layer.
///
/// Internal module handling the socket and its I/O loop.
pub(crate) mod transport;

// ============================================================================
// Re-exports
// ============================================================================

// Client types
pub use client::{DEFAULT_RECONNECT_DELAY, HandshakeStep, Plugin, PluginBuilder, State};

// Error types
pub use error::{Error, Result};

// Identifier types
pub use identifiers::MessageId;

// Preview types
pub use preview::{
    FileTokenStore, MemoryTokenStore, ParameterPreview, ParameterTable, PreviewSnapshot,
    TokenStore,
};

// Protocol types
pub use protocol::{API_VERSION, Envelope, InboundEvent, MessageType};
