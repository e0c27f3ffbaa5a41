//! Parameter preview payloads.
//!
//! These are ordinary API methods called through
//! [`Plugin::call_method`](crate::Plugin::call_method); the client core never
//! looks at them.

// ============================================================================
// Imports
// ============================================================================

use serde::{Deserialize, Serialize};

// ============================================================================
// Method Names
// ============================================================================

/// Returns the id of the model currently shown by the host.
pub const GET_CURRENT_MODEL_ID: &str = "GetCurrentModelId";

/// Lists the tracking ("live") parameters.
pub const GET_LIVE_PARAMETERS: &str = "GetLiveParameters";

/// Lists the model's rig parameters.
pub const GET_CUBISM_PARAMETERS: &str = "GetCubismParameters";

/// Per-frame parameter values; also the subscription request name.
pub const NOTIFY_FRAME_UPDATED: &str = "NotifyFrameUpdated";

/// Current model switched; also the subscription request name.
pub const NOTIFY_CURRENT_MODEL_CHANGED: &str = "NotifyCurrentModelChanged";

// ============================================================================
// Requests
// ============================================================================

/// Subscribes to or unsubscribes from a notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct EnableNotification {
    /// `true` to receive the notification.
    pub enabled: bool,
}

/// `GetCubismParameters` request data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct ModelQuery {
    /// Model to query.
    pub model_id: String,
}

// ============================================================================
// Responses and Events
// ============================================================================

/// `GetCurrentModelId` response and `NotifyCurrentModelChanged` event.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct CurrentModel {
    /// Model id; empty when no model is loaded.
    #[serde(default)]
    pub model_id: String,
}

/// Static description of one parameter.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ParameterInfo {
    /// Parameter id.
    pub id: String,
    /// Display name, when the host provides one.
    #[serde(default)]
    pub name: Option<String>,
    /// Lower bound.
    pub min: f64,
    /// Upper bound.
    pub max: f64,
    /// Default value, when the host provides one.
    #[serde(default)]
    pub default: Option<f64>,
}

/// `GetLiveParameters` response.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct LiveParameters {
    /// Tracking parameters.
    #[serde(default)]
    pub live_parameters: Vec<ParameterInfo>,
}

/// `GetCubismParameters` response.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct CubismParameters {
    /// Model parameters.
    #[serde(default)]
    pub cubism_parameters: Vec<ParameterInfo>,
}

/// One parameter value in a frame.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ParameterValue {
    /// Parameter id.
    pub id: String,
    /// Current value.
    pub value: f64,
}

/// Values for one model in a frame.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ModelFrame {
    /// Model the values belong to.
    pub model_id: String,
    /// Tracking parameter values.
    #[serde(default)]
    pub live_parameter_values: Vec<ParameterValue>,
    /// Model parameter values.
    #[serde(default)]
    pub cubism_parameter_values: Vec<ParameterValue>,
}

/// `NotifyFrameUpdated` event.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct FrameUpdate {
    /// Every model shown by the host.
    #[serde(default)]
    pub models: Vec<ModelFrame>,
}

// ============================================================================
// Tests
// ============================================================================
