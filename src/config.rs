//! Hub configuration and backend selection.
//!
//! A hub is configured once, when it is created. The configuration can be
//! built in code (see [`crate::RuntimeBuilder`]) or read from the
//! environment with [`HubConfig::from_env`]:
//!
//! - `GREENHUB_HUB`: backend name, one of `selects`, `poll`, `epolls`,
//!   `kqueue` or `asyncio`
//! - `GREENHUB_DEFAULT_SLEEP`: idle poll interval in seconds when no timer is
//!   pending
//! - `GREENHUB_DEBUG_EXCEPTIONS`: `1`/`true` to log callback panics at error
//!   level
//!
//! # Example
//!
//! ```ignore
//! use greenhub::{Backend, HubConfig};
//!
//! let config = HubConfig::from_env()?;
//! assert!(matches!(config.backend, Backend::Epoll | Backend::Poll | Backend::Select | Backend::Kqueue));
//! ```

use crate::error::ConfigError;

use std::fmt;
use std::time::Duration;

pub const ENV_HUB: &str = "GREENHUB_HUB";
pub const ENV_DEFAULT_SLEEP: &str = "GREENHUB_DEFAULT_SLEEP";
pub const ENV_DEBUG_EXCEPTIONS: &str = "GREENHUB_DEBUG_EXCEPTIONS";

const DEFAULT_SLEEP: Duration = Duration::from_secs(60);

/// Readiness multiplexing call used by the hub.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Backend {
    Select,
    Poll,
    Epoll,
    Kqueue,
    /// Drive the hub from an external event loop. Recognised but not
    /// available in this crate.
    Asyncio,
}

impl Backend {
    /// Parses a backend from its configuration name.
    pub fn from_name(name: &str) -> Result<Self, ConfigError> {
        match name.trim().to_ascii_lowercase().as_str() {
            "selects" | "select" => Ok(Backend::Select),
            "poll" => Ok(Backend::Poll),
            "epolls" | "epoll" => Ok(Backend::Epoll),
            "kqueue" => Ok(Backend::Kqueue),
            "asyncio" => Ok(Backend::Asyncio),
            other => Err(ConfigError::UnknownBackend(other.to_string())),
        }
    }

    /// Name accepted by [`Backend::from_name`].
    pub fn name(self) -> &'static str {
        match self {
            Backend::Select => "selects",
            Backend::Poll => "poll",
            Backend::Epoll => "epolls",
            Backend::Kqueue => "kqueue",
            Backend::Asyncio => "asyncio",
        }
    }

    /// Whether the backend can be constructed on this platform.
    pub fn is_available(self) -> bool {
        match self {
            Backend::Select | Backend::Poll => true,
            Backend::Epoll => cfg!(any(target_os = "linux", target_os = "android")),
            Backend::Kqueue => cfg!(any(target_os = "macos", target_os = "freebsd")),
            Backend::Asyncio => false,
        }
    }

    /// Best backend for this platform.
    pub fn platform_default() -> Self {
        if Backend::Epoll.is_available() {
            Backend::Epoll
        } else if Backend::Kqueue.is_available() {
            Backend::Kqueue
        } else {
            Backend::Poll
        }
    }
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Settings fixed at hub construction.
#[derive(Clone, Debug, PartialEq)]
pub struct HubConfig {
    /// Multiplexing backend.
    pub backend: Backend,

    /// How long the loop blocks when no timer is pending.
    pub default_sleep: Duration,

    /// Log callback panics at error level instead of debug level.
    pub debug_exceptions: bool,

    /// Reject a second listener on the same fd and direction.
    pub prevent_multiple_readers: bool,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            backend: Backend::platform_default(),
            default_sleep: DEFAULT_SLEEP,
            debug_exceptions: true,
            prevent_multiple_readers: true,
        }
    }
}

impl HubConfig {
    /// Reads the configuration from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Reads the configuration through `lookup`, which maps a variable name to
    /// its value. Unset variables keep their defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(name) = lookup(ENV_HUB) {
            config.backend = Backend::from_name(&name)?;
        }

        if let Some(value) = lookup(ENV_DEFAULT_SLEEP) {
            config.default_sleep = value
                .trim()
                .parse::<f64>()
                .ok()
                .and_then(|seconds| Duration::try_from_secs_f64(seconds).ok())
                .ok_or(ConfigError::InvalidValue {
                    name: ENV_DEFAULT_SLEEP,
                    value: value.clone(),
                })?;
        }

        if let Some(value) = lookup(ENV_DEBUG_EXCEPTIONS) {
            config.debug_exceptions = parse_flag(&value).ok_or(ConfigError::InvalidValue {
                name: ENV_DEBUG_EXCEPTIONS,
                value: value.clone(),
            })?;
        }

        Ok(config)
    }

    /// Checks that the selected backend can be built here.
    pub(crate) fn validate(&self) -> Result<(), ConfigError> {
        if self.backend.is_available() {
            Ok(())
        } else {
            Err(ConfigError::UnsupportedBackend(self.backend.name().to_string()))
        }
    }
}

fn parse_flag(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" | "" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn empty_environment_gives_defaults() {
        let config = HubConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config, HubConfig::default());
        assert_eq!(config.default_sleep, Duration::from_secs(60));
    }

    #[test]
    fn backend_names_are_recognised() {
        assert_eq!(Backend::from_name("selects").unwrap(), Backend::Select);
        assert_eq!(Backend::from_name("poll").unwrap(), Backend::Poll);
        assert_eq!(Backend::from_name("epolls").unwrap(), Backend::Epoll);
        assert_eq!(Backend::from_name("asyncio").unwrap(), Backend::Asyncio);
        assert_eq!(
            Backend::from_name("libuv"),
            Err(ConfigError::UnknownBackend("libuv".into()))
        );
    }

    #[test]
    fn environment_overrides_apply() {
        let config = HubConfig::from_lookup(lookup(&[
            (ENV_HUB, "poll"),
            (ENV_DEFAULT_SLEEP, "0.25"),
            (ENV_DEBUG_EXCEPTIONS, "0"),
        ]))
        .unwrap();

        assert_eq!(config.backend, Backend::Poll);
        assert_eq!(config.default_sleep, Duration::from_millis(250));
        assert!(!config.debug_exceptions);
    }

    #[test]
    fn bad_sleep_value_is_rejected() {
        let err = HubConfig::from_lookup(lookup(&[(ENV_DEFAULT_SLEEP, "-3")])).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { name, .. } if name == ENV_DEFAULT_SLEEP));
    }

    #[test]
    fn asyncio_is_not_available() {
        let config = HubConfig {
            backend: Backend::Asyncio,
            ..HubConfig::default()
        };
        assert_eq!(
            config.validate(),
            Err(ConfigError::UnsupportedBackend("asyncio".into()))
        );
    }
}
