//! Message envelope exchanged with the host.
//!
//! Every frame on the wire is one JSON envelope. Requests flow from the
//! plugin to the host; responses, errors and events flow back.

// ============================================================================
// Imports
// ============================================================================

use std::time::{SystemTime, UNIX_EPOCH};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};
use crate::identifiers::MessageId;

use super::method::{EnabledChanged, NOTIFY_ENABLED_CHANGED};

// ============================================================================
// Constants
// ============================================================================

/// Protocol version written into every outbound envelope.
pub const API_VERSION: &str = "1.0.0";

// ============================================================================
// MessageType
// ============================================================================

/// Envelope type discriminator (`Type` field).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageType {
    /// Plugin → host call.
    Request,
    /// Successful reply to a request.
    Response,
    /// Unsolicited host notification.
    Event,
    /// Failed reply to a request.
    Error,
    /// Any type this client does not know about.
    #[serde(other)]
    Unknown,
}

// ============================================================================
// Envelope
// ============================================================================

/// A single protocol message.
///
/// # Format
///
/// ```json
/// {
///   "nLPlugin": "1.0.0",
///   "Timestamp": 1700000000000,
///   "Id": "0",
///   "Type": "Request",
///   "Method": "RegisterPlugin",
///   "Data": { "Name": "Parameters Preview" }
/// }
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Protocol version.
    #[serde(rename = "nLPlugin", default)]
    pub api_version: String,

    /// Milliseconds since the Unix epoch.
    #[serde(rename = "Timestamp", default)]
    pub timestamp: u64,

    /// Correlation id; absent on most events.
    #[serde(rename = "Id", default, skip_serializing_if = "Option::is_none")]
    pub id: Option<MessageId>,

    /// Envelope type.
    #[serde(rename = "Type")]
    pub message_type: MessageType,

    /// Method or event name.
    #[serde(rename = "Method", default)]
    pub method: String,

    /// Method-specific payload.
    #[serde(rename = "Data", default, skip_serializing_if = "Value::is_null")]
    pub data: Value,
}

impl Envelope {
    /// Creates a request envelope stamped with the current time.
    #[must_use]
    pub fn request(id: MessageId, method: impl Into<String>, data: Value) -> Self {
        Self {
            api_version: API_VERSION.to_string(),
            timestamp: now_millis(),
            id: Some(id),
            message_type: MessageType::Request,
            method: method.into(),
            data,
        }
    }

    /// Creates a reply (`Response` or `Error`) to `request`.
    #[must_use]
    pub fn reply_to(request: &Envelope, message_type: MessageType, data: Value) -> Self {
        Self {
            api_version: API_VERSION.to_string(),
            timestamp: now_millis(),
            id: request.id.clone(),
            message_type,
            method: request.method.clone(),
            data,
        }
    }

    /// Creates an uncorrelated event envelope.
    #[must_use]
    pub fn event(method: impl Into<String>, data: Value) -> Self {
        Self {
            api_version: API_VERSION.to_string(),
            timestamp: now_millis(),
            id: None,
            message_type: MessageType::Event,
            method: method.into(),
            data,
        }
    }

    /// Parses an envelope from a text frame.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Json`] if the text is not a valid envelope.
    pub fn from_text(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    /// Serializes the envelope for sending.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Json`] if serialization fails.
    pub fn to_text(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Pretty-printed JSON used for debug mirroring.
    #[must_use]
    pub fn to_pretty(&self) -> String {
        serde_json::to_string_pretty(self).unwrap_or_else(|e| format!("<unprintable: {e}>"))
    }

    /// Returns `true` if this is a reply to a request.
    #[inline]
    #[must_use]
    pub fn is_reply(&self) -> bool {
        matches!(
            self.message_type,
            MessageType::Response | MessageType::Error
        )
    }

    /// Returns `true` if this is an event.
    #[inline]
    #[must_use]
    pub fn is_event(&self) -> bool {
        self.message_type == MessageType::Event
    }

    /// Decodes `Data` into a typed payload.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Protocol`] if the payload does not match `T`.
    pub fn data_as<T: DeserializeOwned>(&self) -> Result<T> {
        T::deserialize(&self.data).map_err(|e| {
            Error::protocol(format!("Unexpected {} payload: {e}", self.method))
        })
    }

    /// Classifies an event for the client's own routing.
    #[must_use]
    pub fn parse_event(&self) -> InboundEvent {
        match self.method.as_str() {
            NOTIFY_ENABLED_CHANGED => match self.data_as::<EnabledChanged>() {
                Ok(payload) => InboundEvent::EnabledChanged {
                    enabled: payload.enabled,
                },
                Err(_) => InboundEvent::Other,
            },
            _ => InboundEvent::Other,
        }
    }
}

// ============================================================================
// InboundEvent
// ============================================================================

/// Events the client reacts to itself before notifying listeners.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InboundEvent {
    /// `NotifyEnabledChanged`: the user toggled the plugin in the host.
    EnabledChanged {
        /// Whether API access is enabled.
        enabled: bool,
    },

    /// Any other event; only delivered to listeners.
    Other,
}

// ============================================================================
// Helpers
// ============================================================================

/// Current time in milliseconds since the Unix epoch.
fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

// ============================================================================
// Tests
// ============================================================================
