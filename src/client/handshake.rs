//! Session handshake.
//!
//! After the socket opens, the client tries the steps below in order and
//! stops at the first one that succeeds:
//!
//! | Step | Method | Requires | On success |
//! |------|--------|----------|------------|
//! | [`HandshakeStep::Establish`] | `EstablishConnection` | `Open`, saved token | `Established`, then `Available` if enabled |
//! | [`HandshakeStep::Register`] | `RegisterPlugin` | `Open` | token stored, `Established` |
//!
//! If every step fails the plugin is stopped. An enablement change the host
//! sends while a step is waiting for its reply is applied once the step
//! completes.

// ============================================================================
// Imports
// ============================================================================

use serde_json::to_value;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::protocol::method::{
    ESTABLISH_CONNECTION, EstablishConnectionParams, EstablishConnectionResult, REGISTER_PLUGIN,
    RegisterPluginParams, RegisterPluginResult,
};

use super::State;
use super::core::PluginInner;

// ============================================================================
// HandshakeStep
// ============================================================================

/// One attempt in the handshake sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HandshakeStep {
    /// Reuse a saved token.
    Establish,
    /// Obtain a new token.
    Register,
}

impl HandshakeStep {
    /// Step tried first after the socket opens.
    pub const FIRST: Self = Self::Establish;

    /// Step to try when this one fails; `None` ends the handshake.
    #[inline]
    #[must_use]
    pub const fn fallback(self) -> Option<Self> {
        match self {
            Self::Establish => Some(Self::Register),
            Self::Register => None,
        }
    }

    /// Protocol method sent by this step.
    #[inline]
    #[must_use]
    pub const fn method(self) -> &'static str {
        match self {
            Self::Establish => ESTABLISH_CONNECTION,
            Self::Register => REGISTER_PLUGIN,
        }
    }

    /// The full attempt order.
    #[cfg(test)]
    fn sequence() -> Vec<Self> {
        let mut steps = Vec::new();
        let mut step = Some(Self::FIRST);
        while let Some(current) = step {
            steps.push(current);
            step = current.fallback();
        }
        steps
    }
}

// ============================================================================
// HandshakeOutcome
// ============================================================================

/// How a handshake run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum HandshakeOutcome {
    /// The given step succeeded.
    Completed(HandshakeStep),
    /// Every step failed; the plugin was stopped unless the socket was
    /// already replaced.
    Abandoned,
}

// ============================================================================
// Runner
// ============================================================================

/// Runs the handshake for the socket identified by `generation`.
pub(crate) async fn run(inner: &PluginInner, generation: u64) -> HandshakeOutcome {
    let mut step = Some(HandshakeStep::FIRST);

    while let Some(current) = step {
        match attempt(inner, current, generation).await {
            Ok(()) => {
                info!(method = current.method(), "Handshake completed");
                return HandshakeOutcome::Completed(current);
            }
            Err(e) => {
                debug!(method = current.method(), error = %e, "Handshake step failed");
                step = current.fallback();
            }
        }
    }

    if inner.is_current(generation) {
        warn!("Handshake failed; stopping");
        inner.stop();
    }

    HandshakeOutcome::Abandoned
}

/// Runs a single step.
async fn attempt(inner: &PluginInner, step: HandshakeStep, generation: u64) -> Result<()> {
    match step {
        HandshakeStep::Establish => establish(inner, generation).await,
        HandshakeStep::Register => register(inner, generation).await,
    }
}

/// `EstablishConnection` with the saved token.
async fn establish(inner: &PluginInner, generation: u64) -> Result<()> {
    let settings = inner.settings();
    let token = settings
        .token
        .ok_or_else(|| Error::handshake("no saved token"))?;
    require_open(inner)?;

    let params = EstablishConnectionParams {
        name: inner.name().to_string(),
        token,
        version: settings.version,
    };
    let reply = inner
        .send_request(ESTABLISH_CONNECTION, to_value(params)?)
        .await?;
    require_current(inner, generation)?;

    let result = reply
        .data_as::<EstablishConnectionResult>()
        .unwrap_or_default();

    inner.complete_handshake(result.enabled);
    Ok(())
}

/// `RegisterPlugin` to obtain a token.
async fn register(inner: &PluginInner, generation: u64) -> Result<()> {
    require_open(inner)?;

    let settings = inner.settings();
    let params = RegisterPluginParams {
        name: inner.name().to_string(),
        developer: settings.developer,
        version: settings.version,
    };
    let reply = inner.send_request(REGISTER_PLUGIN, to_value(params)?).await?;
    require_current(inner, generation)?;

    let result = reply.data_as::<RegisterPluginResult>()?;
    inner.store_token(result.token);
    inner.complete_handshake(false);
    Ok(())
}

/// Fails unless the socket is open and not yet established.
fn require_open(inner: &PluginInner) -> Result<()> {
    match inner.state() {
        State::Open => Ok(()),
        state => Err(Error::handshake(format!("expected Open, state is {state}"))),
    }
}

/// Fails if the socket was replaced or stopped while waiting.
fn require_current(inner: &PluginInner, generation: u64) -> Result<()> {
    if inner.is_current(generation) {
        Ok(())
    } else {
        Err(Error::handshake("socket replaced during handshake"))
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use crate::client::Plugin;

    #[test]
    fn test_sequence_is_establish_then_register() {
        assert_eq!(
            HandshakeStep::sequence(),
            vec![HandshakeStep::Establish, HandshakeStep::Register]
        );
        assert_eq!(HandshakeStep::FIRST, HandshakeStep::Establish);
        assert_eq!(HandshakeStep::Register.fallback(), None);
    }

    #[test]
    fn test_step_methods() {
        assert_eq!(HandshakeStep::Establish.method(), "EstablishConnection");
        assert_eq!(HandshakeStep::Register.method(), "RegisterPlugin");
    }

    #[tokio::test]
    async fn test_establish_without_token_sends_nothing() {
        let plugin = Plugin::new("Preview").expect("plugin");
        plugin.inner.set_state(State::Open);

        let result = establish(&plugin.inner, plugin.inner.generation()).await;
        assert!(matches!(result, Err(Error::Handshake { .. })));
        assert_eq!(plugin.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_establish_requires_open_state() {
        let plugin = Plugin::builder()
            .name("Preview")
            .token("saved")
            .build()
            .expect("plugin");

        let result = establish(&plugin.inner, plugin.inner.generation()).await;
        assert!(matches!(result, Err(Error::Handshake { .. })));
        assert_eq!(plugin.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_register_requires_open_state() {
        let plugin = Plugin::new("Preview").expect("plugin");
        plugin.inner.set_state(State::Established);

        let result = register(&plugin.inner, plugin.inner.generation()).await;
        assert!(matches!(result, Err(Error::Handshake { .. })));
        assert_eq!(plugin.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_failed_handshake_without_socket_is_abandoned() {
        let plugin = Plugin::new("Preview").expect("plugin");
        plugin.inner.set_state(State::Open);

        // Establish has no token, register has no socket to send on
        let outcome = run(&plugin.inner, plugin.inner.generation()).await;
        assert_eq!(outcome, HandshakeOutcome::Abandoned);
        assert_eq!(plugin.state(), State::Closed);
        assert_eq!(plugin.pending_count(), 0);
    }
}
