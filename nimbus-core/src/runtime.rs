//! The runtime context a client works through.
//!
//! Pairs one pool (plain or aggregated) with the active scaling policy, the
//! result collector and the timing configuration. It is created on startup
//! and passed explicitly to everything that places, calls or moves objects.

use crate::config::RuntimeConfig;
use crate::error::{Missing, NimbusError, Result};
use crate::ids::{HostId, ObjectId, RequestId};
use crate::messages::{HostCommand, HostReply, InvocationRequest, InvocationResult, MetricsEvent};
use crate::model::{HostState, HostView, ObjectView};
use crate::policy::{PlacementRequest, ScalingPolicy};
use crate::pool::{unexpected_reply, HostPool};
use crate::results::ResultCollector;
use crate::state::{new_state, RecentSet, Shared};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

pub struct CloudRuntime {
    pool: Arc<dyn HostPool>,
    policy: Arc<dyn ScalingPolicy>,
    collector: Arc<ResultCollector>,
    config: RuntimeConfig,
    destroyed: Shared<RecentSet<ObjectId>>,
}

/// Destroyed ids remembered for idempotent destroys
const DESTROYED_MEMORY: usize = 4096;

impl CloudRuntime {
    pub fn new(
        pool: Arc<dyn HostPool>,
        policy: Arc<dyn ScalingPolicy>,
        collector: Arc<ResultCollector>,
        config: RuntimeConfig,
    ) -> Self {
        info!(pool = pool.name(), policy = policy.name(), "cloud runtime ready");
        Self { pool, policy, collector, config, destroyed: new_state(RecentSet::new(DESTROYED_MEMORY)) }
    }

    pub fn pool(&self) -> &Arc<dyn HostPool> {
        &self.pool
    }

    pub fn policy(&self) -> &Arc<dyn ScalingPolicy> {
        &self.policy
    }

    pub fn collector(&self) -> &Arc<ResultCollector> {
        &self.collector
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    async fn call(&self, host: HostId, command: HostCommand) -> Result<HostReply> {
        self.pool.endpoint(host)?.call(command).await
    }

    /// Calls the host owning `object`. A host that no longer knows the object
    /// may have just migrated it away: the call then follows the new owner
    /// once, or reports `Busy` while the move is still in flight.
    async fn call_owner(&self, object: ObjectId, command: HostCommand) -> Result<HostReply> {
        let host = self.pool.owner_of(object).ok_or_else(|| NimbusError::object_not_found(object))?;
        match self.call(host, command.clone()).await {
            Err(NimbusError::NotFound { what: Missing::Object, id }) => {
                if self.pool.is_migrating(object) {
                    return Err(NimbusError::Busy(object));
                }
                match self.pool.owner_of(object) {
                    Some(moved) if moved != host => {
                        debug!(object = %object, from = %host, to = %moved, "object moved, following it");
                        self.call(moved, command).await
                    }
                    _ => Err(NimbusError::NotFound { what: Missing::Object, id }),
                }
            }
            other => other,
        }
    }

    /// Places a new object on the host the policy selects
    pub async fn create_object(
        &self,
        type_name: &str,
        params: Vec<Vec<u8>>,
        param_names: Vec<String>,
    ) -> Result<ObjectId> {
        let host = {
            let _placement = self.pool.placement_lock().lock().await;
            let host = self
                .policy
                .select_host(&PlacementRequest::new(type_name), self.pool.as_ref())
                .await?;
            self.pool.reserve_slot(host.id)?;
            host
        };

        match self.create_on(host.id, type_name, params, param_names).await {
            Ok(object) => {
                self.pool.commit_slot(host.id, object)?;
                info!(object = %object, host = %host.id, type_name, "object placed");
                Ok(object)
            }
            Err(e) => {
                self.pool.cancel_slot(host.id);
                warn!(host = %host.id, type_name, error = %e, "object creation failed");
                Err(e)
            }
        }
    }

    async fn create_on(
        &self,
        host: HostId,
        type_name: &str,
        params: Vec<Vec<u8>>,
        param_names: Vec<String>,
    ) -> Result<ObjectId> {
        self.pool.await_ready(host, self.config.host_startup_timeout()).await?;
        let command = HostCommand::CreateObject { type_name: type_name.to_string(), params, param_names };
        match self.call(host, command).await? {
            HostReply::Created { object_id } => Ok(object_id),
            other => Err(unexpected_reply("create_object", &other)),
        }
    }

    /// Starts an invocation; the result arrives through the collector
    pub async fn invoke(&self, request: InvocationRequest) -> Result<RequestId> {
        let object = request.object_id;
        if self.pool.is_migrating(object) {
            return Err(NimbusError::Busy(object));
        }
        match self.call_owner(object, HostCommand::StartInvocation { request }).await? {
            HostReply::InvocationStarted { request_id } => Ok(request_id),
            other => Err(unexpected_reply("start_invocation", &other)),
        }
    }

    pub async fn invoke_and_wait(&self, request: InvocationRequest) -> Result<InvocationResult> {
        let request_id = request.request_id;
        let result = self.collector.expect(request_id);
        if let Err(e) = self.invoke(request).await {
            self.collector.forget(request_id);
            return Err(e);
        }
        result
            .await
            .map_err(|_| NimbusError::Transport(format!("result of {request_id} was dropped")))
    }

    pub async fn get_field(&self, object: ObjectId, field: &str) -> Result<Vec<u8>> {
        let command = HostCommand::GetField { object_id: object, field: field.to_string() };
        match self.call_owner(object, command).await? {
            HostReply::Field { value } => Ok(value),
            other => Err(unexpected_reply("get_field", &other)),
        }
    }

    pub async fn set_field(&self, object: ObjectId, field: &str, value: Vec<u8>) -> Result<()> {
        if self.pool.is_migrating(object) {
            return Err(NimbusError::Busy(object));
        }
        let command = HostCommand::SetField { object_id: object, field: field.to_string(), value };
        self.call_owner(object, command).await.map(|_| ())
    }

    pub async fn suspend(&self, object: ObjectId, request: RequestId) -> Result<()> {
        let command = HostCommand::SuspendInvocation { object_id: object, request_id: request };
        self.call_owner(object, command).await.map(|_| ())
    }

    pub async fn resume(&self, object: ObjectId, request: RequestId) -> Result<()> {
        let command = HostCommand::ResumeInvocation { object_id: object, request_id: request };
        self.call_owner(object, command).await.map(|_| ())
    }

    /// Idempotent on objects this runtime already destroyed
    pub async fn destroy(&self, object: ObjectId) -> Result<()> {
        if self.destroyed.lock().contains(&object) {
            return Ok(());
        }
        if self.pool.is_migrating(object) {
            return Err(NimbusError::Busy(object));
        }
        self.call_owner(object, HostCommand::DestroyObject { object_id: object }).await?;
        self.pool.release_object(object);
        self.destroyed.lock().insert(object);
        info!(object = %object, "object destroyed");
        Ok(())
    }

    pub async fn object_type(&self, object: ObjectId) -> Result<String> {
        match self.call_owner(object, HostCommand::GetObjectType { object_id: object }).await? {
            HostReply::TypeName { type_name } => Ok(type_name),
            other => Err(unexpected_reply("get_object_type", &other)),
        }
    }

    pub async fn keep_alive(&self, object: ObjectId) -> Result<()> {
        self.call_owner(object, HostCommand::KeepAlive { object_id: object }).await.map(|_| ())
    }

    pub async fn migrate(&self, object: ObjectId, target: HostId) -> Result<()> {
        self.pool.migrate_object(object, target).await
    }

    /// One pass of the periodic scale-down: asks the policy about every
    /// dynamic host, tears down the empty authorized ones and drains the rest.
    pub async fn scale_down_sweep(&self) -> Vec<HostId> {
        let _placement = self.pool.placement_lock().lock().await;
        let mut torn_down = Vec::new();

        for id in self.pool.hosts().into_iter().map(|h| h.id) {
            let Some(host) = self.pool.host(id) else {
                continue;
            };
            if host.is_static {
                continue;
            }
            let teardown = match host.state {
                HostState::Draining => host.object_count() == 0,
                HostState::Running => {
                    if !self.policy.scale_down(&host, self.pool.as_ref()).await {
                        continue;
                    }
                    if host.object_count() > 0 {
                        if let Err(e) = self.pool.mark_draining(id) {
                            warn!(host = %id, error = %e, "could not mark host draining");
                        }
                        continue;
                    }
                    true
                }
                HostState::Starting | HostState::Terminated => false,
            };
            if !teardown {
                continue;
            }
            match self.pool.shutdown_host(id).await {
                Ok(()) => torn_down.push(id),
                Err(e) => error!(host = %id, error = %e, "scale-down teardown failed"),
            }
        }

        if !torn_down.is_empty() {
            info!(hosts = torn_down.len(), remaining = self.pool.hosts_count(), "scale-down sweep");
        }
        torn_down
    }

    /// Sends a keep-alive for every placed object; returns how many went out.
    /// Objects their host no longer knows (reaped after missed keep-alives)
    /// are released so the host can empty out.
    pub async fn send_keep_alives(&self) -> usize {
        let mut sent = 0;
        for (object, host) in self.pool.cloud_objects() {
            match self.call(host, HostCommand::KeepAlive { object_id: object }).await {
                Ok(_) => sent += 1,
                Err(NimbusError::NotFound { what: Missing::Object, .. }) => self.forget_vanished(object, host),
                Err(e) => debug!(object = %object, host = %host, error = %e, "keep-alive not delivered"),
            }
        }
        sent
    }

    fn forget_vanished(&self, object: ObjectId, host: HostId) {
        if self.pool.is_migrating(object) || self.pool.owner_of(object) != Some(host) {
            return;
        }
        self.pool.release_object(object);
        self.destroyed.lock().insert(object);
        warn!(object = %object, host = %host, "object vanished from its host, released");
    }

    /// Hands a metrics event to the policy's event handler, if it subscribes
    pub async fn on_metrics_event(&self, event: MetricsEvent) {
        let Some(handler) = self.policy.event_handler() else {
            return;
        };
        let types = handler.event_types();
        if !types.is_empty() && !types.contains(&event.event_type) {
            return;
        }
        if let Err(e) = handler.on_event(self.pool.as_ref(), &event).await {
            error!(event = %event.event_type, error = %e, "scaling event handler failed");
        }
    }

    /// Drops a host that stopped announcing itself, with its objects
    pub async fn host_lost(&self, host: HostId) -> Vec<ObjectId> {
        let objects = self.pool.host_lost(host).await;
        if !objects.is_empty() {
            warn!(host = %host, objects = objects.len(), "objects lost with their host");
        }
        objects
    }

    pub fn host_views(&self) -> Vec<HostView> {
        self.pool.hosts().iter().map(|h| h.view()).collect()
    }

    /// Object projections as reported by the hosts themselves
    pub async fn object_views(&self) -> Vec<ObjectView> {
        let mut views = Vec::new();
        for host in self.pool.hosts() {
            if host.state == HostState::Starting {
                continue;
            }
            match self.call(host.id, HostCommand::DescribeObjects).await {
                Ok(HostReply::Objects { objects }) => views.extend(objects.iter().map(ObjectView::from)),
                Ok(other) => debug!(host = %host.id, reply = ?other, "unexpected describe reply"),
                Err(e) => debug!(host = %host.id, error = %e, "host did not describe its objects"),
            }
        }
        views
    }

    /// Shuts every host's registry down and tears down the dynamic hosts
    pub async fn shutdown(&self) {
        for host in self.pool.hosts() {
            if let Err(e) = self.call(host.id, HostCommand::Shutdown).await {
                warn!(host = %host.id, error = %e, "host did not acknowledge shutdown");
            }
        }
        for object in self.pool.cloud_objects().into_keys() {
            self.pool.release_object(object);
        }
        for host in self.pool.hosts().into_iter().filter(|h| !h.is_static) {
            if let Err(e) = self.pool.shutdown_host(host.id).await {
                warn!(host = %host.id, error = %e, "host teardown failed during shutdown");
            }
        }
        info!(pool = self.pool.name(), "cloud runtime shut down");
    }

    pub fn spawn_scale_down_sweep(runtime: Arc<Self>) -> JoinHandle<()> {
        let period = runtime.config.scale_down_interval();
        info!(?period, "starting scale-down sweep");
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.tick().await;
            loop {
                interval.tick().await;
                runtime.scale_down_sweep().await;
            }
        })
    }

    pub fn spawn_keep_alive_sender(runtime: Arc<Self>) -> JoinHandle<()> {
        let period = runtime.config.keep_alive_interval();
        info!(?period, "starting keep-alive sender");
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            loop {
                interval.tick().await;
                let sent = runtime.send_keep_alives().await;
                debug!(sent, "keep-alives sent");
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::{CapacityPolicy, HostPerObject};
    use crate::pool::{HostSpec, InProcessProvisioner, VirtualHostPool};
    use crate::testing::{cell_catalog, cell_code, in_process, CommandGate, GatedProvisioner};
    use crate::messages::InvocationStatus;
    use std::time::{Duration, Instant};

    fn gated_runtime(
        scratch: &tempfile::TempDir,
        policy: Arc<dyn ScalingPolicy>,
        gate: Arc<CommandGate>,
    ) -> (Arc<CloudRuntime>, Arc<GatedProvisioner>) {
        let (inner, _events) = in_process(scratch.path());
        let provisioner = Arc::new(GatedProvisioner::new(inner, gate));
        let pool = VirtualHostPool::new("local", provisioner.clone(), Duration::from_secs(5), None);
        let collector = Arc::new(ResultCollector::default());
        let rt = CloudRuntime::new(Arc::new(pool), policy, collector, RuntimeConfig::default());
        (Arc::new(rt), provisioner)
    }

    fn runtime(scratch: &tempfile::TempDir, policy: Arc<dyn ScalingPolicy>) -> CloudRuntime {
        let collector = Arc::new(ResultCollector::default());
        let config = RuntimeConfig::default();
        let provisioner = InProcessProvisioner::new(
            cell_catalog(),
            cell_code(),
            collector.clone(),
            config.clone(),
            scratch.path(),
        );
        let pool = VirtualHostPool::new("local", Arc::new(provisioner), Duration::from_secs(5), None);
        CloudRuntime::new(Arc::new(pool), policy, collector, config)
    }

    #[tokio::test]
    async fn objects_are_placed_and_invoked() {
        let scratch = tempfile::tempdir().unwrap();
        let rt = runtime(&scratch, Arc::new(HostPerObject));

        let a = rt.create_object("Cell", Vec::new(), Vec::new()).await.unwrap();
        let b = rt.create_object("Cell", Vec::new(), Vec::new()).await.unwrap();
        assert_eq!(rt.pool().hosts_count(), 2);
        assert_ne!(rt.pool().owner_of(a), rt.pool().owner_of(b));
        assert_eq!(rt.object_type(a).await.unwrap(), "Cell");

        let put = InvocationRequest::new(a, "put").with_param("v", b"42".to_vec());
        let result = rt.invoke_and_wait(put).await.unwrap();
        assert_eq!(result.status, InvocationStatus::Success);
        assert_eq!(rt.get_field(a, "value").await.unwrap(), b"42");

        let views = rt.object_views().await;
        assert_eq!(views.len(), 2);
    }

    #[tokio::test]
    async fn failed_creation_releases_the_slot() {
        let scratch = tempfile::tempdir().unwrap();
        let rt = runtime(&scratch, Arc::new(HostPerObject));

        let err = rt.create_object("Unknown", Vec::new(), Vec::new()).await.unwrap_err();
        assert!(matches!(err, NimbusError::ClassLoading { .. } | NimbusError::Instantiation { .. }));
        assert_eq!(rt.pool().hosts()[0].object_count(), 0);

        rt.create_object("Cell", Vec::new(), Vec::new()).await.unwrap();
        assert_eq!(rt.pool().hosts_count(), 1);
    }

    #[tokio::test]
    async fn destroy_is_idempotent() {
        let scratch = tempfile::tempdir().unwrap();
        let rt = runtime(&scratch, Arc::new(HostPerObject));
        let object = rt.create_object("Cell", Vec::new(), Vec::new()).await.unwrap();

        rt.destroy(object).await.unwrap();
        rt.destroy(object).await.unwrap();
        assert_eq!(rt.pool().object_count(), 0);
        assert!(matches!(rt.keep_alive(object).await, Err(NimbusError::NotFound { .. })));
    }

    #[tokio::test]
    async fn sweep_drains_then_tears_down() {
        let scratch = tempfile::tempdir().unwrap();
        let rt = runtime(&scratch, Arc::new(CapacityPolicy::new(1)));
        let a = rt.create_object("Cell", Vec::new(), Vec::new()).await.unwrap();
        let spare = rt.pool().start_new_host(&HostSpec::default()).await.unwrap();
        let third = rt.pool().start_new_host(&HostSpec::default()).await.unwrap();

        // two unused hosts: the first one retires, the last stays as a spare
        let torn_down = rt.scale_down_sweep().await;
        assert_eq!(torn_down, vec![spare.id]);
        assert!(rt.pool().host(third.id).is_some());

        rt.destroy(a).await.unwrap();
        assert_eq!(rt.scale_down_sweep().await.len(), 1);
        assert_eq!(rt.pool().hosts_count(), 1);
    }

    #[tokio::test]
    async fn keep_alives_reach_every_object() {
        let scratch = tempfile::tempdir().unwrap();
        let rt = runtime(&scratch, Arc::new(HostPerObject));
        for _ in 0..3 {
            rt.create_object("Cell", Vec::new(), Vec::new()).await.unwrap();
        }
        assert_eq!(rt.send_keep_alives().await, 3);
    }

    #[tokio::test]
    async fn sweep_keeps_a_migration_target_until_the_object_lands() {
        let scratch = tempfile::tempdir().unwrap();
        let gate = CommandGate::new(|c| matches!(c, HostCommand::CompleteMigration { .. }));
        let (rt, _provisioner) = gated_runtime(&scratch, Arc::new(CapacityPolicy::new(1)), gate.clone());
        let object = rt.create_object("Cell", Vec::new(), Vec::new()).await.unwrap();
        rt.set_field(object, "value", b"kept".to_vec()).await.unwrap();
        let target = rt.pool().start_new_host(&HostSpec::default()).await.unwrap().id;
        rt.pool().start_new_host(&HostSpec::default()).await.unwrap();

        let migrating = tokio::spawn({
            let rt = rt.clone();
            async move { rt.migrate(object, target).await }
        });
        gate.reached().await;
        assert_eq!(rt.pool().host(target).unwrap().object_count(), 1);
        let torn_down = rt.scale_down_sweep().await;
        assert!(!torn_down.contains(&target));

        gate.open();
        migrating.await.unwrap().unwrap();
        assert_eq!(rt.pool().owner_of(object), Some(target));
        assert_eq!(rt.pool().host(target).unwrap().object_count(), 1);
        assert_eq!(rt.get_field(object, "value").await.unwrap(), b"kept");
    }

    #[tokio::test]
    async fn objects_reaped_by_their_host_are_released() {
        let scratch = tempfile::tempdir().unwrap();
        let gate = CommandGate::new(|_| false);
        let (rt, provisioner) = gated_runtime(&scratch, Arc::new(CapacityPolicy::new(1)), gate);
        let object = rt.create_object("Cell", Vec::new(), Vec::new()).await.unwrap();
        let host = rt.pool().owner_of(object).unwrap();
        rt.pool().start_new_host(&HostSpec::default()).await.unwrap();

        let registry = provisioner.inner().registry(host).unwrap();
        assert_eq!(registry.reap_expired(Instant::now() + Duration::from_secs(3600)), vec![object]);

        assert_eq!(rt.send_keep_alives().await, 0);
        assert_eq!(rt.pool().owner_of(object), None);
        assert_eq!(rt.scale_down_sweep().await, vec![host]);
        rt.destroy(object).await.unwrap();
    }

    #[tokio::test]
    async fn calls_follow_an_object_that_moved_meanwhile() {
        let scratch = tempfile::tempdir().unwrap();
        let gate = CommandGate::new(|c| matches!(c, HostCommand::GetField { .. }));
        let (rt, _provisioner) = gated_runtime(&scratch, Arc::new(HostPerObject), gate.clone());
        let object = rt.create_object("Cell", Vec::new(), Vec::new()).await.unwrap();
        rt.set_field(object, "value", b"moved".to_vec()).await.unwrap();
        let target = rt.pool().start_new_host(&HostSpec::default()).await.unwrap().id;

        // the read resolved the old owner before the migration started
        let reading = tokio::spawn({
            let rt = rt.clone();
            async move { rt.get_field(object, "value").await }
        });
        gate.reached().await;
        rt.migrate(object, target).await.unwrap();

        gate.open();
        assert_eq!(reading.await.unwrap().unwrap(), b"moved");
        assert_eq!(rt.pool().owner_of(object), Some(target));
    }
}
