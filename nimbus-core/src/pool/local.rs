use super::{HostEndpoint, HostSpec, ProvisionedHost, Provisioner};
use crate::classloading::{ClassTransfer, CodeSource};
use crate::config::RuntimeConfig;
use crate::error::{NimbusError, Result};
use crate::ids::HostId;
use crate::messages::{HostCommand, HostReply};
use crate::registry::{CloudObjectRegistry, HostOutbox};
use crate::state::{new_state, Shared};
use crate::types::TypeCatalog;
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// Calls a registry living in the same process
pub struct LocalEndpoint {
    registry: Arc<CloudObjectRegistry>,
}

impl LocalEndpoint {
    pub fn new(registry: Arc<CloudObjectRegistry>) -> Self {
        Self { registry }
    }
}

#[async_trait]
impl HostEndpoint for LocalEndpoint {
    async fn call(&self, command: HostCommand) -> Result<HostReply> {
        self.registry.handle(command).await
    }
}

struct LocalHost {
    registry: Arc<CloudObjectRegistry>,
    reaper: JoinHandle<()>,
}

/// Runs every host as a registry inside the current process.
///
/// Used for development, single-machine deployments and tests. Each host
/// gets its own class transfer cache and scratch directory.
pub struct InProcessProvisioner {
    catalog: Arc<TypeCatalog>,
    code: Arc<dyn CodeSource>,
    outbox: Arc<dyn HostOutbox>,
    config: RuntimeConfig,
    scratch_root: PathBuf,
    /// Provider-side limit on concurrently provisioned hosts
    quota: Option<usize>,
    hosts: Shared<HashMap<HostId, LocalHost>>,
    provisioned: AtomicUsize,
}

impl InProcessProvisioner {
    pub fn new(
        catalog: Arc<TypeCatalog>,
        code: Arc<dyn CodeSource>,
        outbox: Arc<dyn HostOutbox>,
        config: RuntimeConfig,
        scratch_root: impl Into<PathBuf>,
    ) -> Self {
        Self {
            catalog,
            code,
            outbox,
            config,
            scratch_root: scratch_root.into(),
            quota: None,
            hosts: new_state(HashMap::new()),
            provisioned: AtomicUsize::new(0),
        }
    }

    pub fn with_quota(mut self, quota: usize) -> Self {
        self.quota = Some(quota);
        self
    }

    pub fn registry(&self, host: HostId) -> Option<Arc<CloudObjectRegistry>> {
        self.hosts.lock().get(&host).map(|h| h.registry.clone())
    }

    pub fn registries(&self) -> Vec<Arc<CloudObjectRegistry>> {
        self.hosts.lock().values().map(|h| h.registry.clone()).collect()
    }

    /// Hosts provisioned over the provisioner's lifetime
    pub fn provisioned_count(&self) -> usize {
        self.provisioned.load(Ordering::SeqCst)
    }

    /// Builds a host that is not provisioned through a pool, such as a static one
    pub fn spawn_host(&self, host: HostId) -> ProvisionedHost {
        let scratch = self.scratch_root.join(host.to_string());
        let transfer = Arc::new(ClassTransfer::new(host, self.code.clone(), scratch.clone()));
        let registry = Arc::new(CloudObjectRegistry::new(
            host,
            self.catalog.clone(),
            transfer,
            self.outbox.clone(),
            self.config.registry_config(scratch),
        ));
        let reaper = CloudObjectRegistry::spawn_keep_alive_reaper(registry.clone());
        self.hosts.lock().insert(host, LocalHost { registry: registry.clone(), reaper });
        self.provisioned.fetch_add(1, Ordering::SeqCst);

        ProvisionedHost {
            address: format!("local://{host}"),
            endpoint: Arc::new(LocalEndpoint::new(registry)),
        }
    }
}

#[async_trait]
impl Provisioner for InProcessProvisioner {
    async fn provision(&self, host: HostId, spec: &HostSpec) -> Result<ProvisionedHost> {
        if let Some(quota) = self.quota {
            if self.hosts.lock().len() >= quota {
                return Err(NimbusError::PoolMutation(format!("quota of {quota} hosts exhausted")));
            }
        }
        debug!(host = %host, flavor = ?spec.flavor, "provisioning in-process host");
        Ok(self.spawn_host(host))
    }

    async fn release(&self, host: HostId) -> Result<()> {
        let removed = self.hosts.lock().remove(&host);
        if let Some(local) = removed {
            local.reaper.abort();
            if !local.registry.is_shut_down() {
                local.registry.shutdown();
            }
            info!(host = %host, "in-process host released");
        }
        Ok(())
    }
}
