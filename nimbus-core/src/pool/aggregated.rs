use super::{HostEndpoint, HostPool, HostSnapshot, HostSpec};
use crate::error::{NimbusError, Result};
use crate::ids::{HostId, ObjectId};
use crate::migration::{MigrationEngine, MigrationRecord};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Presents several child pools, typically one per cloud provider, as one.
///
/// Every host belongs to exactly one child; operations on a host are routed
/// to that child. New hosts go to the child named by [`HostSpec::pool`], or
/// to the first child that still has capacity.
pub struct AggregatedHostPool {
    name: String,
    children: Vec<Arc<dyn HostPool>>,
    placement: tokio::sync::Mutex<()>,
    engine: MigrationEngine,
}

impl AggregatedHostPool {
    pub fn new(name: impl Into<String>, children: Vec<Arc<dyn HostPool>>, ready_timeout: Duration) -> Self {
        Self {
            name: name.into(),
            children,
            placement: tokio::sync::Mutex::new(()),
            engine: MigrationEngine::new(ready_timeout),
        }
    }

    pub fn child_pools(&self) -> &[Arc<dyn HostPool>] {
        &self.children
    }

    pub fn child(&self, name: &str) -> Option<&Arc<dyn HostPool>> {
        self.children.iter().find(|c| c.name() == name)
    }

    fn child_of_host(&self, host: HostId) -> Result<&Arc<dyn HostPool>> {
        self.children
            .iter()
            .find(|c| c.host(host).is_some())
            .ok_or_else(|| NimbusError::host_not_found(host))
    }

    fn child_for_new_host(&self, spec: &HostSpec) -> Result<&Arc<dyn HostPool>> {
        let child = match &spec.pool {
            Some(name) => self
                .child(name)
                .ok_or_else(|| NimbusError::Config(format!("pool {} has no child named {name}", self.name)))?,
            None => self.children.iter().find(|c| c.can_start_host()).ok_or_else(|| {
                NimbusError::PoolMutation(format!("every child pool of {} is at capacity", self.name))
            })?,
        };
        debug!(pool = %self.name, child = child.name(), "child pool selected for new host");
        Ok(child)
    }
}

#[async_trait]
impl HostPool for AggregatedHostPool {
    fn name(&self) -> &str {
        &self.name
    }

    fn hosts(&self) -> Vec<HostSnapshot> {
        self.children.iter().flat_map(|c| c.hosts()).collect()
    }

    fn hosts_count(&self) -> usize {
        self.children.iter().map(|c| c.hosts_count()).sum()
    }

    fn cloud_objects(&self) -> HashMap<ObjectId, HostId> {
        self.children.iter().flat_map(|c| c.cloud_objects()).collect()
    }

    fn host(&self, id: HostId) -> Option<HostSnapshot> {
        self.children.iter().find_map(|c| c.host(id))
    }

    fn owner_of(&self, object: ObjectId) -> Option<HostId> {
        self.children.iter().find_map(|c| c.owner_of(object))
    }

    fn endpoint(&self, host: HostId) -> Result<Arc<dyn HostEndpoint>> {
        self.child_of_host(host)?.endpoint(host)
    }

    fn can_start_host(&self) -> bool {
        self.children.iter().any(|c| c.can_start_host())
    }

    async fn start_new_host(&self, spec: &HostSpec) -> Result<HostSnapshot> {
        self.child_for_new_host(spec)?.start_new_host(spec).await
    }

    async fn start_new_host_async(&self, spec: &HostSpec) -> Result<HostSnapshot> {
        self.child_for_new_host(spec)?.start_new_host_async(spec).await
    }

    async fn await_ready(&self, host: HostId, timeout: Duration) -> Result<HostSnapshot> {
        self.child_of_host(host)?.await_ready(host, timeout).await
    }

    async fn shutdown_host(&self, host: HostId) -> Result<()> {
        self.child_of_host(host)?.shutdown_host(host).await
    }

    async fn host_lost(&self, host: HostId) -> Vec<ObjectId> {
        match self.child_of_host(host) {
            Ok(child) => child.host_lost(host).await,
            Err(_) => Vec::new(),
        }
    }

    fn mark_draining(&self, host: HostId) -> Result<()> {
        self.child_of_host(host)?.mark_draining(host)
    }

    fn reserve_slot(&self, host: HostId) -> Result<()> {
        self.child_of_host(host)?.reserve_slot(host)
    }

    fn commit_slot(&self, host: HostId, object: ObjectId) -> Result<()> {
        self.child_of_host(host)?.commit_slot(host, object)
    }

    fn cancel_slot(&self, host: HostId) {
        if let Ok(child) = self.child_of_host(host) {
            child.cancel_slot(host);
        }
    }

    fn release_object(&self, object: ObjectId) -> Option<HostId> {
        self.children.iter().find_map(|c| c.release_object(object))
    }

    fn placement_lock(&self) -> &tokio::sync::Mutex<()> {
        &self.placement
    }

    async fn migrate_object(&self, object: ObjectId, target: HostId) -> Result<()> {
        self.engine.migrate(self, object, target).await
    }

    fn is_migrating(&self, object: ObjectId) -> bool {
        self.engine.is_migrating(object) || self.children.iter().any(|c| c.is_migrating(object))
    }

    fn migrations(&self) -> Vec<MigrationRecord> {
        let mut records = self.engine.history();
        records.extend(self.engine.active());
        for child in &self.children {
            records.extend(child.migrations());
        }
        records
    }
}
