use super::{HostEndpoint, HostPool, HostSnapshot, HostSpec, Provisioner};
use crate::error::{NimbusError, Result};
use crate::ids::{HostId, ObjectId};
use crate::messages::HostCommand;
use crate::migration::{MigrationEngine, MigrationRecord};
use crate::model::HostState;
use crate::state::{new_state, Shared};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};

struct HostEntry {
    /// Start order inside the pool
    seq: u64,
    address: String,
    state: HostState,
    is_static: bool,
    objects: BTreeSet<ObjectId>,
    pending: usize,
    started_at: DateTime<Utc>,
    endpoint: Option<Arc<dyn HostEndpoint>>,
    status: watch::Sender<HostState>,
}

impl HostEntry {
    fn new(seq: u64, address: String, state: HostState, is_static: bool, endpoint: Option<Arc<dyn HostEndpoint>>) -> Self {
        let (status, _) = watch::channel(state);
        Self {
            seq,
            address,
            state,
            is_static,
            objects: BTreeSet::new(),
            pending: 0,
            started_at: Utc::now(),
            endpoint,
            status,
        }
    }

    fn set_state(&mut self, state: HostState) {
        self.state = state;
        self.status.send_replace(state);
    }

    fn snapshot(&self, id: HostId, pool: &str) -> HostSnapshot {
        HostSnapshot {
            id,
            address: self.address.clone(),
            state: self.state,
            is_static: self.is_static,
            pool: pool.to_string(),
            objects: self.objects.iter().copied().collect(),
            pending: self.pending,
            started_at: self.started_at,
        }
    }
}

#[derive(Default)]
struct PoolState {
    hosts: HashMap<HostId, HostEntry>,
    owners: HashMap<ObjectId, HostId>,
    next_seq: u64,
}

impl PoolState {
    fn next_seq(&mut self) -> u64 {
        self.next_seq += 1;
        self.next_seq
    }
}

struct PoolInner {
    name: String,
    provisioner: Arc<dyn Provisioner>,
    max_hosts: Option<usize>,
    state: Shared<PoolState>,
}

impl PoolInner {
    fn snapshot(&self, id: HostId) -> Option<HostSnapshot> {
        self.state.lock().hosts.get(&id).map(|h| h.snapshot(id, &self.name))
    }

    /// Registers a `Starting` host, refusing when the pool is full
    fn begin_start(&self) -> Result<HostSnapshot> {
        let mut state = self.state.lock();
        if let Some(max) = self.max_hosts {
            if state.hosts.len() >= max {
                return Err(NimbusError::PoolMutation(format!(
                    "pool {} already runs its maximum of {max} hosts",
                    self.name
                )));
            }
        }
        let id = HostId::new();
        let seq = state.next_seq();
        let entry = HostEntry::new(seq, String::new(), HostState::Starting, false, None);
        let snapshot = entry.snapshot(id, &self.name);
        state.hosts.insert(id, entry);
        Ok(snapshot)
    }

    async fn provision(&self, id: HostId, spec: &HostSpec) -> Result<HostSnapshot> {
        match self.provisioner.provision(id, spec).await {
            Ok(provisioned) => {
                let snapshot = {
                    let mut state = self.state.lock();
                    state.hosts.get_mut(&id).map(|entry| {
                        entry.address = provisioned.address.clone();
                        entry.endpoint = Some(provisioned.endpoint.clone());
                        entry.set_state(HostState::Running);
                        entry.snapshot(id, &self.name)
                    })
                };
                match snapshot {
                    Some(snapshot) => {
                        info!(pool = %self.name, host = %id, address = %snapshot.address, "host running");
                        Ok(snapshot)
                    }
                    None => {
                        // forgotten while starting (lost or torn down); do not leak it
                        let _ = self.provisioner.release(id).await;
                        Err(NimbusError::PoolMutation(format!("host {id} was removed while starting")))
                    }
                }
            }
            Err(e) => {
                if let Some(mut entry) = self.state.lock().hosts.remove(&id) {
                    entry.set_state(HostState::Terminated);
                }
                error!(pool = %self.name, host = %id, error = %e, "host provisioning failed");
                Err(match e {
                    e @ NimbusError::PoolMutation(_) => e,
                    other => NimbusError::PoolMutation(format!("could not start host {id}: {other}")),
                })
            }
        }
    }
}

/// Pool of hosts started on demand through one [`Provisioner`]
pub struct VirtualHostPool {
    inner: Arc<PoolInner>,
    placement: tokio::sync::Mutex<()>,
    engine: MigrationEngine,
}

impl VirtualHostPool {
    /// `max_hosts` bounds started and static hosts together
    pub fn new(
        name: impl Into<String>,
        provisioner: Arc<dyn Provisioner>,
        ready_timeout: Duration,
        max_hosts: Option<usize>,
    ) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                name: name.into(),
                provisioner,
                max_hosts,
                state: new_state(PoolState::default()),
            }),
            placement: tokio::sync::Mutex::new(()),
            engine: MigrationEngine::new(ready_timeout),
        }
    }

    /// Adds a host that already runs and must never be torn down
    pub fn add_static_host(&self, address: impl Into<String>, endpoint: Arc<dyn HostEndpoint>) -> HostSnapshot {
        self.add_static_host_with_id(HostId::new(), address, endpoint)
    }

    pub fn add_static_host_with_id(
        &self,
        id: HostId,
        address: impl Into<String>,
        endpoint: Arc<dyn HostEndpoint>,
    ) -> HostSnapshot {
        let mut state = self.inner.state.lock();
        let seq = state.next_seq();
        let entry = HostEntry::new(seq, address.into(), HostState::Running, true, Some(endpoint));
        let snapshot = entry.snapshot(id, &self.inner.name);
        state.hosts.insert(id, entry);
        drop(state);
        info!(pool = %self.inner.name, host = %id, address = %snapshot.address, "static host added");
        snapshot
    }

    fn with_host<T>(&self, host: HostId, f: impl FnOnce(&mut HostEntry) -> Result<T>) -> Result<T> {
        let mut state = self.inner.state.lock();
        let entry = state.hosts.get_mut(&host).ok_or_else(|| NimbusError::host_not_found(host))?;
        f(entry)
    }
}

#[async_trait]
impl HostPool for VirtualHostPool {
    fn name(&self) -> &str {
        &self.inner.name
    }

    fn hosts(&self) -> Vec<HostSnapshot> {
        let state = self.inner.state.lock();
        let mut entries: Vec<_> = state.hosts.iter().collect();
        entries.sort_by_key(|(_, entry)| entry.seq);
        entries
            .into_iter()
            .map(|(id, entry)| entry.snapshot(*id, &self.inner.name))
            .collect()
    }

    fn hosts_count(&self) -> usize {
        self.inner.state.lock().hosts.len()
    }

    fn cloud_objects(&self) -> HashMap<ObjectId, HostId> {
        self.inner.state.lock().owners.clone()
    }

    fn host(&self, id: HostId) -> Option<HostSnapshot> {
        self.inner.snapshot(id)
    }

    fn owner_of(&self, object: ObjectId) -> Option<HostId> {
        self.inner.state.lock().owners.get(&object).copied()
    }

    fn endpoint(&self, host: HostId) -> Result<Arc<dyn HostEndpoint>> {
        let state = self.inner.state.lock();
        let entry = state.hosts.get(&host).ok_or_else(|| NimbusError::host_not_found(host))?;
        entry
            .endpoint
            .clone()
            .ok_or_else(|| NimbusError::Transport(format!("host {host} is still starting")))
    }

    fn can_start_host(&self) -> bool {
        match self.inner.max_hosts {
            Some(max) => self.inner.state.lock().hosts.len() < max,
            None => true,
        }
    }

    async fn start_new_host(&self, spec: &HostSpec) -> Result<HostSnapshot> {
        let starting = self.inner.begin_start()?;
        info!(pool = %self.inner.name, host = %starting.id, "starting host");
        self.inner.provision(starting.id, spec).await
    }

    async fn start_new_host_async(&self, spec: &HostSpec) -> Result<HostSnapshot> {
        let starting = self.inner.begin_start()?;
        info!(pool = %self.inner.name, host = %starting.id, "starting host in background");

        let inner = Arc::clone(&self.inner);
        let spec = spec.clone();
        let id = starting.id;
        tokio::spawn(async move {
            // failure is logged and observed by await_ready
            let _ = inner.provision(id, &spec).await;
        });
        Ok(starting)
    }

    async fn await_ready(&self, host: HostId, timeout: Duration) -> Result<HostSnapshot> {
        let mut status = {
            let state = self.inner.state.lock();
            let entry = state.hosts.get(&host).ok_or_else(|| NimbusError::host_not_found(host))?;
            entry.status.subscribe()
        };
        let settled = tokio::time::timeout(timeout, status.wait_for(|s| *s != HostState::Starting))
            .await
            .map_err(|_| NimbusError::Timeout(format!("host {host} to start")))?
            .map(|state| *state);

        match settled {
            Ok(HostState::Terminated) | Err(_) => Err(NimbusError::PoolMutation(format!("host {host} failed to start"))),
            Ok(_) => self.host(host).ok_or_else(|| NimbusError::host_not_found(host)),
        }
    }

    async fn shutdown_host(&self, host: HostId) -> Result<()> {
        let endpoint = {
            let mut state = self.inner.state.lock();
            let entry = state.hosts.get(&host).ok_or_else(|| NimbusError::host_not_found(host))?;
            if entry.is_static {
                return Err(NimbusError::PoolMutation(format!("host {host} is static")));
            }
            if entry.objects.len() + entry.pending > 0 {
                return Err(NimbusError::PoolMutation(format!(
                    "host {host} still owns {} objects",
                    entry.objects.len() + entry.pending
                )));
            }
            let mut entry = state.hosts.remove(&host).ok_or_else(|| NimbusError::host_not_found(host))?;
            entry.set_state(HostState::Terminated);
            entry.endpoint
        };

        if let Some(endpoint) = endpoint {
            if let Err(e) = endpoint.call(HostCommand::Shutdown).await {
                warn!(pool = %self.inner.name, host = %host, error = %e, "host did not acknowledge shutdown");
            }
        }
        self.inner
            .provisioner
            .release(host)
            .await
            .map_err(|e| NimbusError::PoolMutation(format!("could not release host {host}: {e}")))?;
        info!(pool = %self.inner.name, host = %host, "host torn down");
        Ok(())
    }

    async fn host_lost(&self, host: HostId) -> Vec<ObjectId> {
        let removed = {
            let mut state = self.inner.state.lock();
            let removed = state.hosts.remove(&host);
            if let Some(entry) = &removed {
                for object in &entry.objects {
                    state.owners.remove(object);
                }
            }
            removed
        };
        let Some(mut entry) = removed else {
            return Vec::new();
        };
        entry.set_state(HostState::Terminated);
        let objects: Vec<_> = entry.objects.into_iter().collect();
        warn!(pool = %self.inner.name, host = %host, objects = objects.len(), "host lost");

        if !entry.is_static {
            if let Err(e) = self.inner.provisioner.release(host).await {
                warn!(pool = %self.inner.name, host = %host, error = %e, "could not release lost host");
            }
        }
        objects
    }

    fn mark_draining(&self, host: HostId) -> Result<()> {
        self.with_host(host, |entry| {
            if entry.state != HostState::Draining {
                entry.set_state(HostState::Draining);
                info!(host = %host, objects = entry.objects.len(), "host draining");
            }
            Ok(())
        })
    }

    fn reserve_slot(&self, host: HostId) -> Result<()> {
        self.with_host(host, |entry| {
            if !entry.state.accepts_objects() {
                return Err(NimbusError::PoolMutation(format!(
                    "host {host} does not accept objects while {:?}",
                    entry.state
                )));
            }
            entry.pending += 1;
            Ok(())
        })
    }

    fn commit_slot(&self, host: HostId, object: ObjectId) -> Result<()> {
        let mut state = self.inner.state.lock();
        let entry = state.hosts.get_mut(&host).ok_or_else(|| NimbusError::host_not_found(host))?;
        entry.pending = entry.pending.saturating_sub(1);
        entry.objects.insert(object);
        state.owners.insert(object, host);
        Ok(())
    }

    fn cancel_slot(&self, host: HostId) {
        if let Some(entry) = self.inner.state.lock().hosts.get_mut(&host) {
            entry.pending = entry.pending.saturating_sub(1);
        }
    }

    fn release_object(&self, object: ObjectId) -> Option<HostId> {
        let mut state = self.inner.state.lock();
        let host = state.owners.remove(&object)?;
        if let Some(entry) = state.hosts.get_mut(&host) {
            entry.objects.remove(&object);
        }
        Some(host)
    }

    fn placement_lock(&self) -> &tokio::sync::Mutex<()> {
        &self.placement
    }

    async fn migrate_object(&self, object: ObjectId, target: HostId) -> Result<()> {
        self.engine.migrate(self, object, target).await
    }

    fn is_migrating(&self, object: ObjectId) -> bool {
        self.engine.is_migrating(object)
    }

    fn migrations(&self) -> Vec<MigrationRecord> {
        let mut records = self.engine.history();
        records.extend(self.engine.active());
        records
    }
}
