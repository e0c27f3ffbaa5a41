//! Plugin API message types.
//!
//! Every frame is one JSON [`Envelope`]:
//!
//! | Type | Direction | Purpose |
//! |------|-----------|---------|
//! | `Request` | Plugin → Host | API call, carries a fresh `Id` |
//! | `Response` | Host → Plugin | Successful reply, echoes the `Id` |
//! | `Error` | Host → Plugin | Failed reply, echoes the `Id` |
//! | `Event` | Host → Plugin | Notification, no `Id` |
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | `envelope` | Envelope framing |
//! | `method` | Handshake methods and payloads |
//! | `parameters` | Model and parameter methods and payloads |

// ============================================================================
// Submodules
// ============================================================================

/// Envelope framing.
pub mod envelope;

/// Handshake methods and payloads.
pub mod method;

/// Model and parameter payloads.
pub mod parameters;

// ============================================================================
// Re-exports
// ============================================================================

pub use envelope::{API_VERSION, Envelope, InboundEvent, MessageType};
