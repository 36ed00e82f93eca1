use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Timing knobs shared by the kernel and its hosts
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub scale_down_interval_secs: u64,
    pub keep_alive_interval_secs: u64,
    /// An object idle for `keep_alive_interval * multiplier` is treated as orphaned
    pub keep_alive_expiry_multiplier: u32,
    pub is_alive_interval_secs: u64,
    /// A host silent for `is_alive_interval * multiplier` is considered lost
    pub host_timeout_multiplier: u32,
    pub host_startup_timeout_secs: u64,
    pub request_timeout_secs: u64,
    pub migration_drain_timeout_secs: u64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            scale_down_interval_secs: 300,
            keep_alive_interval_secs: 30,
            keep_alive_expiry_multiplier: 3,
            is_alive_interval_secs: 5,
            host_timeout_multiplier: 3,
            host_startup_timeout_secs: 360,
            request_timeout_secs: 30,
            migration_drain_timeout_secs: 60,
        }
    }
}

impl RuntimeConfig {
    pub fn scale_down_interval(&self) -> Duration {
        Duration::from_secs(self.scale_down_interval_secs)
    }

    pub fn keep_alive_interval(&self) -> Duration {
        Duration::from_secs(self.keep_alive_interval_secs)
    }

    pub fn keep_alive_expiry(&self) -> Duration {
        self.keep_alive_interval() * self.keep_alive_expiry_multiplier
    }

    pub fn is_alive_interval(&self) -> Duration {
        Duration::from_secs(self.is_alive_interval_secs)
    }

    pub fn host_timeout(&self) -> Duration {
        self.is_alive_interval() * self.host_timeout_multiplier
    }

    pub fn host_startup_timeout(&self) -> Duration {
        Duration::from_secs(self.host_startup_timeout_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// Host-side view of the same settings
    pub fn registry_config(&self, scratch_dir: impl Into<PathBuf>) -> RegistryConfig {
        RegistryConfig {
            keep_alive_interval: self.keep_alive_interval(),
            keep_alive_expiry_multiplier: self.keep_alive_expiry_multiplier,
            migration_drain_timeout: Duration::from_secs(self.migration_drain_timeout_secs),
            scratch_dir: scratch_dir.into(),
        }
    }
}

/// Settings of one host's object registry
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    pub keep_alive_interval: Duration,
    pub keep_alive_expiry_multiplier: u32,
    /// How long a migration waits for in-flight invocations before giving up
    pub migration_drain_timeout: Duration,
    /// Per-host area where fetched file dependencies are written
    pub scratch_dir: PathBuf,
}

impl RegistryConfig {
    pub fn keep_alive_expiry(&self) -> Duration {
        self.keep_alive_interval * self.keep_alive_expiry_multiplier
    }
}

impl Default for RegistryConfig {
    fn default() -> Self {
        RuntimeConfig::default().registry_config(std::env::temp_dir().join("nimbus-host"))
    }
}
