//! Bridge configuration.
//!
//! Configuration is read from `~/.config/taiga-bridge/config.json` when it
//! exists, then overridden by `TAIGA_BRIDGE_*` environment variables (which
//! may come from a `.env` file loaded at startup). Every option has a
//! default, so a missing config file is not an error.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use serde::Deserialize;

/// Application name used for config/cache directory paths
const APP_NAME: &str = "taiga-bridge";

/// Config file name
const CONFIG_FILE: &str = "config.json";

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Seconds a session lives without refresh before the sweep evicts it.
    pub session_expiry_seconds: u64,
    /// Token bucket capacity per session, refilled over a 60 second window.
    pub rate_limit_capacity: u32,
    /// Fixed timeout applied to every outbound HTTP request.
    pub request_timeout_seconds: u64,
    /// Total attempts per call (original attempt plus retries).
    pub retry_max_attempts: u32,
    /// Base delay for exponential backoff, doubling each attempt.
    pub retry_base_delay_seconds: f64,
    /// Ceiling on any single backoff delay.
    pub retry_max_delay_seconds: f64,
    /// Interval between expiry sweeps of the session store.
    pub sweep_interval_seconds: u64,
    /// How close to expiry a bearer session gets before a silent refresh
    /// is attempted.
    pub refresh_margin_seconds: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            session_expiry_seconds: 28_800,
            rate_limit_capacity: 100,
            request_timeout_seconds: 30,
            retry_max_attempts: 4,
            retry_base_delay_seconds: 0.5,
            retry_max_delay_seconds: 8.0,
            sweep_interval_seconds: 300,
            refresh_margin_seconds: 600,
        }
    }
}

impl Config {
    /// Load configuration: file first, then environment overrides.
    pub fn load() -> Result<Self> {
        let mut config = match Self::config_path() {
            Ok(path) if path.exists() => {
                let contents = std::fs::read_to_string(&path)?;
                serde_json::from_str(&contents)?
            }
            _ => Self::default(),
        };
        config.apply_env();
        Ok(config)
    }

    fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find config directory"))?;
        Ok(config_dir.join(APP_NAME).join(CONFIG_FILE))
    }

    /// Directory for cached tokens.
    pub fn cache_dir() -> Result<PathBuf> {
        let cache_dir = dirs::cache_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find cache directory"))?;
        Ok(cache_dir.join(APP_NAME))
    }

    /// Override fields from `TAIGA_BRIDGE_*` environment variables.
    /// Unparseable values are ignored in favor of the existing setting.
    fn apply_env(&mut self) {
        fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
            std::env::var(name).ok()?.parse().ok()
        }

        if let Some(v) = env_parse("TAIGA_BRIDGE_SESSION_EXPIRY_SECONDS") {
            self.session_expiry_seconds = v;
        }
        if let Some(v) = env_parse("TAIGA_BRIDGE_RATE_LIMIT_CAPACITY") {
            self.rate_limit_capacity = v;
        }
        if let Some(v) = env_parse("TAIGA_BRIDGE_REQUEST_TIMEOUT_SECONDS") {
            self.request_timeout_seconds = v;
        }
        if let Some(v) = env_parse("TAIGA_BRIDGE_RETRY_MAX_ATTEMPTS") {
            self.retry_max_attempts = v;
        }
        if let Some(v) = env_parse("TAIGA_BRIDGE_RETRY_BASE_DELAY_SECONDS") {
            self.retry_base_delay_seconds = v;
        }
        if let Some(v) = env_parse("TAIGA_BRIDGE_RETRY_MAX_DELAY_SECONDS") {
            self.retry_max_delay_seconds = v;
        }
        if let Some(v) = env_parse("TAIGA_BRIDGE_SWEEP_INTERVAL_SECONDS") {
            self.sweep_interval_seconds = v;
        }
        if let Some(v) = env_parse("TAIGA_BRIDGE_REFRESH_MARGIN_SECONDS") {
            self.refresh_margin_seconds = v;
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_seconds)
    }

    pub fn retry_base_delay(&self) -> Duration {
        Duration::from_secs_f64(self.retry_base_delay_seconds)
    }

    pub fn retry_max_delay(&self) -> Duration {
        Duration::from_secs_f64(self.retry_max_delay_seconds)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_seconds)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = Config::default();
        assert_eq!(config.session_expiry_seconds, 28_800);
        assert_eq!(config.rate_limit_capacity, 100);
        assert_eq!(config.request_timeout_seconds, 30);
        assert_eq!(config.retry_max_attempts, 4);
        assert_eq!(config.retry_base_delay_seconds, 0.5);
        assert_eq!(config.retry_max_delay_seconds, 8.0);
        assert_eq!(config.sweep_interval_seconds, 300);
    }

    #[test]
    fn partial_config_file_fills_in_defaults() {
        let config: Config = serde_json::from_str(r#"{"rate_limit_capacity": 10}"#)
            .expect("partial config should parse");
        assert_eq!(config.rate_limit_capacity, 10);
        assert_eq!(config.retry_max_attempts, 4);
    }
}
