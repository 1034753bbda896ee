// Configuration load/save

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

const CONFIG_DIR: &str = "netpulse";
const CONFIG_FILE: &str = "config.json";

/// Reverse DNS settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DnsConfig {
    /// Maximum number of cached hostnames (least recently used are evicted)
    pub cache_capacity: usize,

    /// Per-lookup timeout in milliseconds
    pub lookup_timeout_ms: u64,

    /// Also resolve private, loopback and link-local addresses
    pub resolve_private: bool,
}

impl Default for DnsConfig {
    fn default() -> Self {
        Self {
            cache_capacity: 65_536,
            lookup_timeout_ms: 2_000,
            resolve_private: true,
        }
    }
}

/// Activity estimator settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ActivityConfig {
    pub enabled: bool,

    /// Chance per established flow per cycle of emitting an activity event
    pub probability: f64,

    /// Estimated size range in bytes, `min_size..max_size`
    pub min_size: u64,
    pub max_size: u64,
}

impl Default for ActivityConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            probability: 0.3,
            min_size: 64,
            max_size: 1064,
        }
    }
}

/// Configuration file structure
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Preferred connection source (procfs, netstat, lsof, synthetic)
    pub connection_source: Option<String>,

    /// Preferred process source (sysinfo, synthetic)
    pub process_source: Option<String>,

    pub poll_interval_ms: u64,
    pub activity_interval_ms: u64,
    pub stats_interval_ms: u64,

    /// Watchdog for a single snapshot call
    pub snapshot_timeout_ms: u64,

    /// Capacity of each telemetry buffer
    pub max_items: usize,

    /// Per-subscriber event backlog before the oldest events are dropped
    pub event_buffer: usize,

    pub dns: DnsConfig,
    pub activity: ActivityConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            connection_source: None,
            process_source: None,
            poll_interval_ms: 2_000,
            activity_interval_ms: 1_000,
            stats_interval_ms: 2_000,
            snapshot_timeout_ms: 10_000,
            max_items: 10_000,
            event_buffer: 1_024,
            dns: DnsConfig::default(),
            activity: ActivityConfig::default(),
        }
    }
}

impl Config {
    /// Get the default config file path
    pub fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .context("Could not determine the user config directory")?
            .join(CONFIG_DIR);

        Ok(config_dir.join(CONFIG_FILE))
    }

    /// Load configuration from the default location
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path()?)
    }

    /// Load configuration from `path`, falling back to defaults if it is missing
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            log::debug!("Config file {:?} not found, using defaults", path);
            return Ok(Config::default());
        }

        let contents =
            fs::read_to_string(path).context(format!("Failed to read config file: {:?}", path))?;

        let config: Config =
            serde_json::from_str(&contents).context("Failed to parse config file")?;

        config.validate()?;
        log::info!("Loaded configuration from {:?}", path);
        Ok(config)
    }

    /// Save configuration to the default location
    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_path()?)
    }

    /// Save configuration to `path`
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)
                .context(format!("Failed to create config directory: {:?}", dir))?;
        }

        let contents = serde_json::to_string_pretty(self).context("Failed to serialize config")?;
        fs::write(path, contents).context(format!("Failed to write config file: {:?}", path))?;

        log::info!("Saved configuration to {:?}", path);
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_items == 0 {
            anyhow::bail!("max_items must be at least 1");
        }
        if self.event_buffer == 0 {
            anyhow::bail!("event_buffer must be at least 1");
        }
        if self.poll_interval_ms == 0
            || self.activity_interval_ms == 0
            || self.stats_interval_ms == 0
        {
            anyhow::bail!("timer intervals must be non-zero");
        }
        if !(0.0..=1.0).contains(&self.activity.probability) {
            anyhow::bail!(
                "activity.probability must be within 0..=1, got {}",
                self.activity.probability
            );
        }
        if self.activity.min_size >= self.activity.max_size {
            anyhow::bail!("activity.min_size must be below activity.max_size");
        }
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn activity_interval(&self) -> Duration {
        Duration::from_millis(self.activity_interval_ms)
    }

    pub fn stats_interval(&self) -> Duration {
        Duration::from_millis(self.stats_interval_ms)
    }

    pub fn snapshot_timeout(&self) -> Duration {
        Duration::from_millis(self.snapshot_timeout_ms)
    }
}
