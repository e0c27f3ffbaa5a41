//! Handshake methods and the built-in enablement event.
//!
//! | Method | Kind | Payload |
//! |--------|------|---------|
//! | `RegisterPlugin` | Request | [`RegisterPluginParams`] → [`RegisterPluginResult`] |
//! | `EstablishConnection` | Request | [`EstablishConnectionParams`] → [`EstablishConnectionResult`] |
//! | `NotifyEnabledChanged` | Event | [`EnabledChanged`] |

// ============================================================================
// Imports
// ============================================================================

use serde::{Deserialize, Serialize};

// ============================================================================
// Method Names
// ============================================================================

/// First-time registration; the host issues a token.
pub const REGISTER_PLUGIN: &str = "RegisterPlugin";

/// Reconnection with a previously issued token.
pub const ESTABLISH_CONNECTION: &str = "EstablishConnection";

/// Host-pushed change of the plugin's API enablement.
pub const NOTIFY_ENABLED_CHANGED: &str = "NotifyEnabledChanged";

// ============================================================================
// RegisterPlugin
// ============================================================================

/// `RegisterPlugin` request data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct RegisterPluginParams {
    /// Plugin name shown to the user.
    pub name: String,
    /// Developer name.
    pub developer: String,
    /// Plugin version.
    pub version: String,
}

/// `RegisterPlugin` response data.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct RegisterPluginResult {
    /// Newly issued session token.
    pub token: String,
}

// ============================================================================
// EstablishConnection
// ============================================================================

/// `EstablishConnection` request data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct EstablishConnectionParams {
    /// Plugin name shown to the user.
    pub name: String,
    /// Token from an earlier registration.
    pub token: String,
    /// Plugin version.
    pub version: String,
}

/// `EstablishConnection` response data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct EstablishConnectionResult {
    /// Whether the user has already enabled the plugin.
    #[serde(default)]
    pub enabled: bool,
}

// ============================================================================
// NotifyEnabledChanged
// ============================================================================

/// `NotifyEnabledChanged` event data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct EnabledChanged {
    /// New enablement.
    pub enabled: bool,
}

// ============================================================================
// Tests
// ============================================================================
