//! Run configuration
//!
//! Everything outside the command line comes from `RUNEJAIL_*` environment
//! variables. Unset variables keep the defaults of [`RegistryConfig`] and
//! [`LaunchConfig`].

use crate::error::{JailError, Result};
use crate::image::RegistryConfig;
use crate::runtime::LaunchConfig;
use std::time::Duration;
use tracing::level_filters::LevelFilter;

/// Log verbosity variable
pub const LOG_ENV: &str = "RUNEJAIL_LOG";
/// Registry base URL override
pub const REGISTRY_URL_ENV: &str = "RUNEJAIL_REGISTRY_URL";
/// Token endpoint override
pub const AUTH_URL_ENV: &str = "RUNEJAIL_AUTH_URL";
/// Token service name override
pub const AUTH_SERVICE_ENV: &str = "RUNEJAIL_AUTH_SERVICE";
/// Per-request timeout in seconds
pub const HTTP_TIMEOUT_ENV: &str = "RUNEJAIL_HTTP_TIMEOUT";

/// Complete configuration for one run
#[derive(Debug, Clone)]
pub struct Config {
    /// Registry endpoints
    pub registry: RegistryConfig,
    /// Isolation settings
    pub launch: LaunchConfig,
    /// Maximum log level
    pub log_level: LevelFilter,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            registry: RegistryConfig::default(),
            launch: LaunchConfig::default(),
            log_level: LevelFilter::ERROR,
        }
    }
}

impl Config {
    /// Load configuration from the process environment
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through an arbitrary variable lookup
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Config {
            log_level: log_level(lookup(LOG_ENV).as_deref()),
            ..Default::default()
        };

        if let Some(url) = lookup(REGISTRY_URL_ENV) {
            config.registry.url = url.trim_end_matches('/').to_string();
        }
        if let Some(url) = lookup(AUTH_URL_ENV) {
            config.registry.auth_url = url;
        }
        if let Some(service) = lookup(AUTH_SERVICE_ENV) {
            config.registry.service = service;
        }
        if let Some(raw) = lookup(HTTP_TIMEOUT_ENV) {
            let secs: u64 = raw.trim().parse().map_err(|_| {
                JailError::InvalidConfig(format!(
                    "{} must be a whole number of seconds, got '{}'",
                    HTTP_TIMEOUT_ENV, raw
                ))
            })?;
            config.registry.timeout = Some(Duration::from_secs(secs));
        }

        Ok(config)
    }
}

/// Map a verbosity value to a level filter
///
/// Absent or unrecognized values mean errors only.
pub fn log_level(value: Option<&str>) -> LevelFilter {
    match value.map(|v| v.trim().to_ascii_lowercase()).as_deref() {
        Some("trace") => LevelFilter::TRACE,
        Some("debug") => LevelFilter::DEBUG,
        Some("info") => LevelFilter::INFO,
        Some("warn") | Some("warning") => LevelFilter::WARN,
        _ => LevelFilter::ERROR,
    }
}
