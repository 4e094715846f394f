//! Runtime configuration, loaded from `config.yaml` in the app home.
//!
//! Every field has a default so a missing or partial file still yields a
//! working setup.

use crate::paths;
use crate::usage::fetch::DEFAULT_API_BASE_URL;
use crate::usage::tracker::{TrackerConfig, DEBOUNCE_TIMEOUT, POLL_INTERVAL};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AppConfig {
    /// Seconds between poll cycles when clock alignment is off.
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    /// Poll at :01/:31 past the minute instead of a free-running interval.
    #[serde(default = "default_align_to_clock")]
    pub align_to_clock: bool,
    /// Base URL of the usage API.
    #[serde(default = "default_api_base_url")]
    pub api_base_url: String,
    /// Desktop notifications when a usage window resets.
    #[serde(default = "default_notifications")]
    pub notifications: bool,
}

fn default_poll_interval_secs() -> u64 {
    POLL_INTERVAL.as_secs()
}

fn default_align_to_clock() -> bool {
    true
}

fn default_api_base_url() -> String {
    DEFAULT_API_BASE_URL.to_string()
}

fn default_notifications() -> bool {
    true
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_poll_interval_secs(),
            align_to_clock: default_align_to_clock(),
            api_base_url: default_api_base_url(),
            notifications: default_notifications(),
        }
    }
}

impl AppConfig {
    /// Loads the config file; a missing file yields the defaults.
    pub fn load() -> Result<Self> {
        let path = paths::config_path()?;
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let config: Self = serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse config file as YAML: {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.poll_interval_secs == 0 {
            anyhow::bail!("poll_interval_secs must be at least 1");
        }
        if self.api_base_url.trim().is_empty() {
            anyhow::bail!("api_base_url must not be empty");
        }
        Ok(())
    }

    pub fn tracker_config(&self) -> TrackerConfig {
        TrackerConfig {
            poll_interval: Duration::from_secs(self.poll_interval_secs),
            debounce_timeout: DEBOUNCE_TIMEOUT,
            align_to_clock: self.align_to_clock,
        }
    }
}
