//! Error types for the plugin client.
//!
//! This module defines all error types used throughout the crate.
//!
//! # Usage
//!
//! All fallible operations return [`Result<T>`] which uses [`Error`]:
//!
//! ```ignore
//! use nlplugin::{Plugin, Result};
//! use serde_json::json;
//!
//! async fn example(plugin: &Plugin) -> Result<()> {
//!     let reply = plugin.call_method("GetCurrentModelId", json!({})).await?;
//!     println!("{}", reply.data);
//!     Ok(())
//! }
//! ```
//!
//! # Error Categories
//!
//! | Category | Variants |
//! |----------|----------|
//! | Configuration | [`Error::Config`], [`Error::InvalidAddress`] |
//! | Session | [`Error::NotReady`], [`Error::Handshake`] |
//! | Connection | [`Error::ConnectionClosed`], [`Error::ChannelClosed`] |
//! | Protocol | [`Error::Remote`], [`Error::Protocol`], [`Error::RequestTimeout`] |
//! | External | [`Error::Io`], [`Error::Json`] |

// ============================================================================
// Imports
// ============================================================================

use std::io::Error as IoError;
use std::result::Result as StdResult;

use thiserror::Error;
use tokio::sync::oneshot::error::RecvError;

use crate::client::State;
use crate::identifiers::MessageId;
use crate::protocol::Envelope;

// ============================================================================
// Result Alias
// ============================================================================

/// Result type alias using crate [`enum@Error`].
///
/// All fallible operations in this crate return this type.
pub type Result<T> = StdResult<T, Error>;

// ============================================================================
// Error Enum
// ============================================================================

/// Main error type for the crate.
#[derive(Error, Debug)]
pub enum Error {
    // ========================================================================
    // Configuration Errors
    // ========================================================================
    /// Configuration error.
    ///
    /// Returned when the plugin is built without a name.
    #[error("Configuration error: {message}")]
    Config {
        /// Description of the configuration error.
        message: String,
    },

    /// The address passed to `start` is not a WebSocket URL.
    #[error("Invalid address {address}: {message}")]
    InvalidAddress {
        /// Address as given.
        address: String,
        /// Why it was rejected.
        message: String,
    },

    // ========================================================================
    // Session Errors
    // ========================================================================
    /// API call attempted before the host enabled the plugin.
    #[error("API not ready (state: {state})")]
    NotReady {
        /// State at the time of the call.
        state: State,
    },

    /// Handshake step could not run or was rejected.
    #[error("Handshake failed: {message}")]
    Handshake {
        /// Description of the failure.
        message: String,
    },

    // ========================================================================
    // Connection Errors
    // ========================================================================
    /// Connection closed before the request completed.
    #[error("Connection closed")]
    ConnectionClosed,

    // ========================================================================
    // Protocol Errors
    // ========================================================================
    /// The host answered a request with an `Error` envelope.
    #[error("Host rejected {}: {}", .envelope.method, .envelope.data)]
    Remote {
        /// The `Error` envelope as received.
        envelope: Box<Envelope>,
    },

    /// Malformed or unexpected message.
    #[error("Protocol error: {message}")]
    Protocol {
        /// Description of the protocol violation.
        message: String,
    },

    /// No reply within the configured request timeout.
    #[error("Request {request_id} timed out after {timeout_ms}ms")]
    RequestTimeout {
        /// The request that timed out.
        request_id: MessageId,
        /// Milliseconds waited before timeout.
        timeout_ms: u64,
    },

    // ========================================================================
    // External Errors
    // ========================================================================
    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] IoError),

    /// JSON serialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Channel receive error.
    #[error("Channel closed")]
    ChannelClosed(#[from] RecvError),
}

// ============================================================================
// Error Constructors
// ============================================================================

impl Error {
    /// Creates a configuration error.
    #[inline]
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Creates an invalid address error.
    #[inline]
    pub fn invalid_address(address: impl Into<String>, message: impl ToString) -> Self {
        Self::InvalidAddress {
            address: address.into(),
            message: message.to_string(),
        }
    }

    /// Creates a not-ready error.
    #[inline]
    pub fn not_ready(state: State) -> Self {
        Self::NotReady { state }
    }

    /// Creates a handshake error.
    #[inline]
    pub fn handshake(message: impl Into<String>) -> Self {
        Self::Handshake {
            message: message.into(),
        }
    }

    /// Creates a remote error from the host's `Error` envelope.
    #[inline]
    pub fn remote(envelope: Envelope) -> Self {
        Self::Remote {
            envelope: Box::new(envelope),
        }
    }

    /// Creates a protocol error.
    #[inline]
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol {
            message: message.into(),
        }
    }

    /// Creates a request timeout error.
    #[inline]
    pub fn request_timeout(request_id: MessageId, timeout_ms: u64) -> Self {
        Self::RequestTimeout {
            request_id,
            timeout_ms,
        }
    }
}

// ============================================================================
// Error Predicates
// ============================================================================

impl Error {
    /// Returns `true` if the call was refused because the API is not available.
    #[inline]
    #[must_use]
    pub fn is_not_ready(&self) -> bool {
        matches!(self, Self::NotReady { .. })
    }

    /// Returns `true` if this is a timeout error.
    #[inline]
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::RequestTimeout { .. })
    }

    /// Returns `true` if the host rejected the request.
    #[inline]
    #[must_use]
    pub fn is_remote(&self) -> bool {
        matches!(self, Self::Remote { .. })
    }

    /// Returns `true` if this is a connection error.
    #[inline]
    #[must_use]
    pub fn is_connection_error(&self) -> bool {
        matches!(self, Self::ConnectionClosed | Self::ChannelClosed(_))
    }

    /// Returns the host's `Error` envelope, if this is a remote error.
    #[inline]
    #[must_use]
    pub fn remote_envelope(&self) -> Option<&Envelope> {
        match self {
            Self::Remote { envelope } => Some(envelope),
            _ => None,
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
