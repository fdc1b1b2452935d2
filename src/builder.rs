//! Fluent builder for Runtime construction.
//!
//! The builder collects a [`HubConfig`], creates a hub from it, installs that
//! hub as the current thread's hub and wraps it in a [`Runtime`].

use crate::config::{Backend, HubConfig};
use crate::error::Result;
use crate::hub::use_hub;
use crate::runtime::Runtime;

use std::time::Duration;

/// Builder for constructing Runtime instances with a fluent API.
///
/// # Example
/// ```ignore
/// let rt = RuntimeBuilder::new()
///     .backend(Backend::Poll)
///     .default_sleep(Duration::from_secs(5))
///     .build()?;
/// ```
#[derive(Clone, Debug, Default)]
pub struct RuntimeBuilder {
    config: HubConfig,
}

impl RuntimeBuilder {
    /// Creates a builder holding the default configuration.
    ///
    /// # Example
    /// ```ignore
    /// let builder = RuntimeBuilder::new();
    /// ```
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts from the `GREENHUB_*` environment variables.
    ///
    /// # Errors
    /// Returns the first invalid variable found.
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            config: HubConfig::from_env()?,
        })
    }

    /// Selects the readiness backend.
    pub fn backend(mut self, backend: Backend) -> Self {
        self.config.backend = backend;
        self
    }

    /// How long the hub blocks when no timer is pending.
    pub fn default_sleep(mut self, interval: Duration) -> Self {
        self.config.default_sleep = interval;
        self
    }

    /// Whether panics caught in hub callbacks are logged at error level.
    pub fn debug_exceptions(mut self, enabled: bool) -> Self {
        self.config.debug_exceptions = enabled;
        self
    }

    /// Whether a second listener on the same fd and direction is rejected.
    pub fn prevent_multiple_readers(mut self, enabled: bool) -> Self {
        self.config.prevent_multiple_readers = enabled;
        self
    }

    pub fn config(&self) -> &HubConfig {
        &self.config
    }

    /// Builds the runtime and makes its hub the thread's hub.
    ///
    /// # Returns
    /// A newly constructed Runtime instance
    ///
    /// # Errors
    /// Fails if the backend is unavailable, or if the thread's current hub
    /// is running.
    ///
    /// # Example
    /// ```ignore
    /// let mut rt = RuntimeBuilder::new().build()?;
    /// ```
    pub fn build(self) -> Result<Runtime> {
        let hub = use_hub(self.config)?;
        Ok(Runtime::with_hub(hub))
    }
}
