use nimbus_core::policy::PolicyConfig;
use nimbus_core::transport::MqttSettings;
use nimbus_core::{HostId, RuntimeConfig};
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, path::Path, path::PathBuf};
use tokio::fs;
use tracing::warn;

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
#[serde(default)]
pub struct KernelConfig {
    pub mqtt: MqttSettings,
    pub http: HttpConf,
    pub runtime: RuntimeConfig,
    pub policy: PolicyConfig,
    /// One entry runs a plain pool, several an aggregated pool over them
    pub pools: Vec<PoolConf>,
    pub code: CodeConf,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct HttpConf {
    pub bind: String,
}

impl Default for HttpConf {
    fn default() -> Self {
        Self { bind: "0.0.0.0:8080".into() }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct PoolConf {
    pub name: String,
    #[serde(default)]
    pub provisioner: ProvisionerConf,
    #[serde(default)]
    pub max_hosts: Option<usize>,
    #[serde(default)]
    pub static_hosts: Vec<StaticHostConf>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Default)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ProvisionerConf {
    /// Hosts run as registries inside the kernel process
    #[default]
    InProcess,
    /// Hosts run as child processes, ex: "nimbus-host --quiet"
    Process { command: String },
}

/// A host started outside the kernel that must never be torn down
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct StaticHostConf {
    pub host_id: HostId,
    pub address: String,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
#[serde(default)]
pub struct CodeConf {
    /// Archives and file dependencies served to hosts
    pub artifact_dir: Option<PathBuf>,
    /// type name -> archive name
    pub archives: BTreeMap<String, String>,
    /// Scratch area of in-process hosts
    pub scratch_dir: Option<PathBuf>,
}

impl KernelConfig {
    /// The configured pools, or a single in-process pool
    pub fn pools(&self) -> Vec<PoolConf> {
        if !self.pools.is_empty() {
            return self.pools.clone();
        }
        vec![PoolConf {
            name: "local".into(),
            provisioner: ProvisionerConf::InProcess,
            max_hosts: None,
            static_hosts: Vec::new(),
        }]
    }

    pub fn scratch_dir(&self) -> PathBuf {
        self.code.scratch_dir.clone().unwrap_or_else(|| std::env::temp_dir().join("nimbus-kernel"))
    }
}

pub fn parse_config(txt: &str) -> KernelConfig {
    if txt.trim().is_empty() {
        return KernelConfig::default();
    }
    serde_yaml::from_str(txt).unwrap_or_else(|e| {
        warn!("invalid kernel config, using defaults: {e}");
        KernelConfig::default()
    })
}

pub async fn load_config() -> KernelConfig {
    let path = std::env::var("NIMBUS_KERNEL_CONFIG").unwrap_or_else(|_| "kernel.yaml".into());
    if Path::new(&path).exists() {
        let txt = fs::read_to_string(&path).await.unwrap_or_default();
        parse_config(&txt)
    } else {
        warn!(path = %path, "no kernel config found, using defaults");
        KernelConfig::default()
    }
}
