//! Host configuration
//!
//! Read from `config.toml` in the OS config directory (or the file named by
//! `NIMBUS_HOST_CONFIG`). A kernel that spawns this process passes the host
//! identity and broker through environment variables, which win over the file.

use anyhow::{Context, Result};
use nimbus_core::transport::MqttSettings;
use nimbus_core::{HostId, RuntimeConfig};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HostConfig {
    pub mqtt: MqttConfig,
    pub host: HostInfo,
    pub runtime: RuntimeConfig,
    /// Where fetched file dependencies are written
    pub scratch_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MqttConfig {
    pub broker_host: String,
    pub broker_port: u16,
    pub keep_alive_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HostInfo {
    pub host_id: HostId,
    pub hostname: String,
    /// Address announced to the kernel, the hostname when unset
    pub address: Option<String>,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self { broker_host: "127.0.0.1".to_string(), broker_port: 1883, keep_alive_secs: 30 }
    }
}

impl Default for HostInfo {
    fn default() -> Self {
        Self {
            host_id: HostId::new(),
            hostname: gethostname::gethostname().to_string_lossy().to_string(),
            address: None,
        }
    }
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            mqtt: MqttConfig::default(),
            host: HostInfo::default(),
            runtime: RuntimeConfig::default(),
            scratch_dir: None,
        }
    }
}

impl HostConfig {
    /// Load config from the OS-specific location, then apply env overrides
    pub async fn load() -> Result<Self> {
        let config_path = match std::env::var("NIMBUS_HOST_CONFIG") {
            Ok(path) => PathBuf::from(path),
            Err(_) => Self::config_file_path()?,
        };

        let mut config = Self::load_from(&config_path).await?;
        config.apply_overrides(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    /// Defaults when `path` does not exist
    pub async fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read {}", path.display()))?;
        toml::from_str(&content).with_context(|| format!("Invalid config in {}", path.display()))
    }

    /// Applies `NIMBUS_HOST_ID`, `NIMBUS_MQTT_HOST` and `NIMBUS_MQTT_PORT`
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(id) = lookup("NIMBUS_HOST_ID") {
            self.host.host_id = id.parse().with_context(|| format!("NIMBUS_HOST_ID is not a uuid: {id}"))?;
        }
        if let Some(host) = lookup("NIMBUS_MQTT_HOST") {
            self.mqtt.broker_host = host;
        }
        if let Some(port) = lookup("NIMBUS_MQTT_PORT") {
            self.mqtt.broker_port = port.parse().with_context(|| format!("NIMBUS_MQTT_PORT is not a port: {port}"))?;
        }
        Ok(())
    }

    pub fn config_file_path() -> Result<PathBuf> {
        let mut path = dirs::config_dir().ok_or_else(|| anyhow::anyhow!("Could not find config directory"))?;
        path.push("nimbus-host");
        path.push("config.toml");
        Ok(path)
    }

    pub fn mqtt_settings(&self) -> MqttSettings {
        MqttSettings {
            host: self.mqtt.broker_host.clone(),
            port: self.mqtt.broker_port,
            keep_alive_secs: self.mqtt.keep_alive_secs,
        }
    }

    pub fn address(&self) -> String {
        self.host.address.clone().unwrap_or_else(|| self.host.hostname.clone())
    }

    pub fn scratch_dir(&self) -> PathBuf {
        self.scratch_dir
            .clone()
            .unwrap_or_else(|| std::env::temp_dir().join("nimbus-host"))
            .join(self.host.host_id.to_string())
    }
}
