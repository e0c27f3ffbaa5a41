//! Builder pattern for plugin configuration.
//!
//! # Example
//!
//! ```no_run
//! use std::time::Duration;
//!
//! use nlplugin::Plugin;
//!
//! # fn example() -> nlplugin::Result<()> {
//! let plugin = Plugin::builder()
//!     .name("Parameters Preview")
//!     .developer("Example Inc.")
//!     .version("1.0.0")
//!     .reconnect_delay(Duration::from_millis(500))
//!     .build()?;
//! # Ok(())
//! # }
//! ```

// ============================================================================
// Imports
// ============================================================================

use std::time::Duration;

use crate::error::{Error, Result};

use super::core::Plugin;

// ============================================================================
// Constants
// ============================================================================

/// Delay before retrying a connection that failed to open.
pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_millis(1000);

// ============================================================================
// PluginBuilder
// ============================================================================

/// Builder for configuring a [`Plugin`] instance.
///
/// Use [`Plugin::builder()`] to create a new builder.
#[derive(Debug, Clone)]
pub struct PluginBuilder {
    /// Plugin name (required).
    pub(crate) name: Option<String>,
    /// Developer name sent on registration.
    pub(crate) developer: String,
    /// Plugin version sent on every handshake.
    pub(crate) version: String,
    /// Token from an earlier session.
    pub(crate) token: Option<String>,
    /// Mirror envelopes to the log.
    pub(crate) debug: bool,
    /// Delay before retrying a failed open.
    pub(crate) reconnect_delay: Duration,
    /// Optional limit on how long a request may stay pending.
    pub(crate) request_timeout: Option<Duration>,
}

impl Default for PluginBuilder {
    fn default() -> Self {
        Self {
            name: None,
            developer: String::new(),
            version: String::new(),
            token: None,
            debug: false,
            reconnect_delay: DEFAULT_RECONNECT_DELAY,
            request_timeout: None,
        }
    }
}

// ============================================================================
// PluginBuilder Implementation
// ============================================================================

impl PluginBuilder {
    /// Creates a builder with default settings and no name.
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the plugin name shown by the host.
    #[inline]
    #[must_use]
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Sets the developer name.
    #[inline]
    #[must_use]
    pub fn developer(mut self, developer: impl Into<String>) -> Self {
        self.developer = developer.into();
        self
    }

    /// Sets the plugin version.
    #[inline]
    #[must_use]
    pub fn version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    /// Restores a token saved from an earlier session.
    ///
    /// An empty token is treated as no token.
    #[inline]
    #[must_use]
    pub fn token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into()).filter(|t| !t.is_empty());
        self
    }

    /// Mirrors every envelope to the log at `info` level.
    #[inline]
    #[must_use]
    pub fn debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    /// Sets the delay before retrying a connection that failed to open.
    #[inline]
    #[must_use]
    pub fn reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay = delay;
        self
    }

    /// Fails requests that get no reply within `timeout`.
    ///
    /// Without a timeout a request waits until its reply arrives or the
    /// connection is torn down.
    #[inline]
    #[must_use]
    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = Some(timeout);
        self
    }

    /// Builds the plugin.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if no non-blank name was set.
    pub fn build(self) -> Result<Plugin> {
        let name = self.validate_name()?;
        Ok(Plugin::from_builder(name, self))
    }
}

// ============================================================================
// Validation
// ============================================================================

impl PluginBuilder {
    /// Validates the name.
    fn validate_name(&self) -> Result<String> {
        let name = self
            .name
            .as_deref()
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .ok_or_else(|| {
                Error::config(
                    "Plugin name is required. Use .name() to set it.\n\
                     Example: Plugin::builder().name(\"Parameters Preview\")",
                )
            })?;

        Ok(name.to_string())
    }
}

// ============================================================================
// Tests
// ============================================================================
