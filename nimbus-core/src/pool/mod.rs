//! Host pools: the elastic set of hosts a scaling policy governs.
//!
//! A pool owns its host map and the object-to-host bookkeeping. Placement
//! (policy decision plus slot reservation) is serialized by the pool's
//! placement lock; everything else takes the host-map mutex briefly.

mod aggregated;
mod local;
mod virtual_pool;

pub use aggregated::AggregatedHostPool;
pub use local::{InProcessProvisioner, LocalEndpoint};
pub use virtual_pool::VirtualHostPool;

use crate::error::{NimbusError, Result};
use crate::ids::{HostId, ObjectId};
use crate::messages::{HostCommand, HostReply};
use crate::migration::MigrationRecord;
use crate::model::{HostState, HostView};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

/// Read-only view of one host at the time it was taken
#[derive(Debug, Clone, Serialize)]
pub struct HostSnapshot {
    pub id: HostId,
    pub address: String,
    pub state: HostState,
    pub is_static: bool,
    /// Name of the (child) pool owning the host
    pub pool: String,
    pub objects: Vec<ObjectId>,
    /// Slots reserved by placements not yet committed
    pub pending: usize,
    pub started_at: DateTime<Utc>,
}

impl HostSnapshot {
    /// Objects placed plus placements in flight
    pub fn object_count(&self) -> usize {
        self.objects.len() + self.pending
    }

    pub fn accepts_objects(&self) -> bool {
        self.state.accepts_objects()
    }

    pub fn view(&self) -> HostView {
        HostView { id: self.id, address: self.address.clone(), is_static: self.is_static }
    }
}

/// What to provision when a pool starts a host
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct HostSpec {
    /// Child pool to start the host in, when the pool is aggregated
    pub pool: Option<String>,
    pub flavor: Option<String>,
    pub image: Option<String>,
    pub labels: BTreeMap<String, String>,
}

impl HostSpec {
    pub fn in_pool(name: impl Into<String>) -> Self {
        Self { pool: Some(name.into()), ..Self::default() }
    }
}

/// Remote invocation surface of one host
#[async_trait]
pub trait HostEndpoint: Send + Sync {
    async fn call(&self, command: HostCommand) -> Result<HostReply>;
}

pub struct ProvisionedHost {
    pub address: String,
    pub endpoint: Arc<dyn HostEndpoint>,
}

/// Starts and stops the machines (or processes) hosts run on
#[async_trait]
pub trait Provisioner: Send + Sync {
    async fn provision(&self, host: HostId, spec: &HostSpec) -> Result<ProvisionedHost>;

    async fn release(&self, host: HostId) -> Result<()>;
}

#[async_trait]
pub trait HostPool: Send + Sync {
    fn name(&self) -> &str;

    fn hosts(&self) -> Vec<HostSnapshot>;

    fn hosts_count(&self) -> usize {
        self.hosts().len()
    }

    /// Every placed object and the host that owns it
    fn cloud_objects(&self) -> HashMap<ObjectId, HostId>;

    fn object_count(&self) -> usize {
        self.cloud_objects().len()
    }

    fn host(&self, id: HostId) -> Option<HostSnapshot>;

    fn owner_of(&self, object: ObjectId) -> Option<HostId>;

    fn endpoint(&self, host: HostId) -> Result<Arc<dyn HostEndpoint>>;

    /// Whether another host may be started without exceeding capacity
    fn can_start_host(&self) -> bool;

    /// Starts a host and waits until it runs
    async fn start_new_host(&self, spec: &HostSpec) -> Result<HostSnapshot>;

    /// Starts a host in the background; the snapshot is still `Starting`
    async fn start_new_host_async(&self, spec: &HostSpec) -> Result<HostSnapshot>;

    /// Waits until a starting host runs
    async fn await_ready(&self, host: HostId, timeout: Duration) -> Result<HostSnapshot>;

    /// Tears down an empty, non-static host
    async fn shutdown_host(&self, host: HostId) -> Result<()>;

    /// Forgets a host that stopped answering; returns the objects it owned
    async fn host_lost(&self, host: HostId) -> Vec<ObjectId>;

    fn mark_draining(&self, host: HostId) -> Result<()>;

    /// Holds one slot on `host` for a placement about to happen
    fn reserve_slot(&self, host: HostId) -> Result<()>;

    /// Turns a reserved slot into an owned object
    fn commit_slot(&self, host: HostId, object: ObjectId) -> Result<()>;

    fn cancel_slot(&self, host: HostId);

    fn release_object(&self, object: ObjectId) -> Option<HostId>;

    /// Serializes host selection with the membership update that follows it
    fn placement_lock(&self) -> &tokio::sync::Mutex<()>;

    async fn migrate_object(&self, object: ObjectId, target: HostId) -> Result<()>;

    fn is_migrating(&self, object: ObjectId) -> bool;

    /// Live and recently finished migrations
    fn migrations(&self) -> Vec<MigrationRecord>;
}

pub(crate) fn unexpected_reply(action: &str, reply: &HostReply) -> NimbusError {
    NimbusError::Transport(format!("unexpected reply to {action}: {reply:?}"))
}
