//! Intercom configuration
//!
//! All tunable parameters in one place. Loaded from TOML at startup,
//! falls back to defaults if no config file exists.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct IntercomConfig {
    pub registry: RegistryConfig,
    pub broker: BrokerConfig,
    pub orchestrator: OrchestratorConfig,
    pub gateway: GatewayConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RegistryConfig {
    /// An instance with no heartbeat for this long is unhealthy.
    pub staleness_window_secs: u64,
    /// How often the reaper removes unhealthy instances. 0 disables the reaper.
    pub reap_interval_secs: u64,
}

/// What a full topic queue does with a new message.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// Evict the oldest message of the lowest priority present.
    #[default]
    DropOldest,
    /// Drop the incoming message.
    DropNewest,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct BrokerConfig {
    /// Maximum queued messages per topic.
    pub queue_capacity: usize,
    pub overflow: OverflowPolicy,
    /// Upper bound on a single subscriber callback, in milliseconds.
    pub callback_timeout_ms: u64,
    /// How long an idle topic worker waits after waking before it dequeues,
    /// so messages published back to back are ordered by priority.
    pub wake_coalesce_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Where task snapshots are written. No snapshots when unset.
    pub snapshot_path: Option<PathBuf>,
    /// Finished tasks kept in history; the oldest are discarded first.
    pub history_limit: usize,
}

/// Gateway configuration
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct GatewayConfig {
    pub port: u16,
    pub bind: BindMode,
}

/// Bind mode for the gateway
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum BindMode {
    Loopback,
    #[default]
    Lan,
}

impl BindMode {
    pub fn to_addr(&self) -> &str {
        match self {
            BindMode::Loopback => "127.0.0.1",
            BindMode::Lan => "0.0.0.0",
        }
    }

    /// Parse a CLI value. Anything that names the local host means loopback.
    pub fn from_arg(s: &str) -> Self {
        match s {
            "loopback" | "localhost" | "127.0.0.1" => BindMode::Loopback,
            _ => BindMode::Lan,
        }
    }
}

// ============================================================
// Defaults
// ============================================================

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            staleness_window_secs: 30,
            reap_interval_secs: 5,
        }
    }
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 10_000,
            overflow: OverflowPolicy::DropOldest,
            callback_timeout_ms: 5_000,
            wake_coalesce_ms: 2,
        }
    }
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            snapshot_path: None,
            history_limit: 1_000,
        }
    }
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            port: 18800,
            bind: BindMode::default(),
        }
    }
}

impl RegistryConfig {
    pub fn staleness_window(&self) -> Duration {
        Duration::from_secs(self.staleness_window_secs)
    }

    pub fn reap_interval(&self) -> Option<Duration> {
        (self.reap_interval_secs > 0).then(|| Duration::from_secs(self.reap_interval_secs))
    }
}

impl BrokerConfig {
    pub fn callback_timeout(&self) -> Duration {
        Duration::from_millis(self.callback_timeout_ms)
    }

    pub fn wake_coalesce(&self) -> Duration {
        Duration::from_millis(self.wake_coalesce_ms)
    }
}

// ============================================================
// Loading
// ============================================================

impl IntercomConfig {
    /// Load config from a TOML file, falling back to defaults.
    pub fn load(path: &Path) -> Self {
        match std::fs::read_to_string(path) {
            Ok(content) => match Self::from_toml(&content) {
                Ok(config) => {
                    tracing::info!("Loaded config from {}", path.display());
                    config
                }
                Err(e) => {
                    tracing::warn!("Failed to parse {}: {} - using defaults", path.display(), e);
                    Self::default()
                }
            },
            Err(_) => {
                tracing::info!("No config at {} - using defaults", path.display());
                Self::default()
            }
        }
    }

    pub fn from_toml(content: &str) -> crate::Result<Self> {
        toml::from_str(content).map_err(|e| crate::Error::ConfigError(e.to_string()))
    }

    /// Render the config as TOML (for generating a default config file).
    pub fn to_toml(&self) -> crate::Result<String> {
        toml::to_string_pretty(self).map_err(|e| crate::Error::ConfigError(e.to_string()))
    }
}
