//! Per-host table of live cloud objects and their invocation state machine.
//!
//! States: `Active -> Invoking -> Active` for a normal call, `Invoking <->
//! Suspended` for an explicitly paused call, `Migrating` while a migration
//! holds the object, and `Destroyed` as the terminal state. Invocations run on
//! the blocking pool and report back through the [`HostOutbox`].

mod dispatch;
mod invocation;

pub use invocation::{HostOutbox, InvocationContext, InvocationControl, OutboundEvent};

use crate::classloading::{ClassTransfer, CodeArtifact};
use crate::config::RegistryConfig;
use crate::error::{NimbusError, Result};
use crate::ids::{HostId, ObjectId, RequestId};
use crate::messages::{
    InvocationRequest, InvocationResult, InvocationStatus, MigrationDeployRequest, MigrationPayload,
};
use crate::migration::MigrationPhase;
use crate::model::{CloudObjectDescriptor, ObjectState};
use crate::state::{new_state, RecentSet, Shared};
use crate::types::{CloudObject, FieldError, TypeCatalog, TypeDescriptor, TypeRegistration};
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Destroyed ids remembered so repeated destroys stay idempotent
const DESTROYED_MEMORY: usize = 4096;

struct RunningInvocation {
    method: String,
    control: Arc<InvocationControl>,
}

struct HostedObject {
    descriptor: CloudObjectDescriptor,
    instance: Arc<dyn CloudObject>,
    registration: Arc<TypeRegistration>,
    invocations: HashMap<RequestId, RunningInvocation>,
    last_keep_alive: Instant,
    /// Source-side phase while a migration holds the object
    migration: Option<MigrationPhase>,
}

impl HostedObject {
    fn touch(&mut self) {
        self.last_keep_alive = Instant::now();
    }

    fn refresh(&mut self) {
        self.descriptor.executing_method_names =
            self.invocations.values().map(|i| i.method.clone()).collect();
        self.descriptor.state = if self.migration.is_some() {
            ObjectState::Migrating
        } else if self.invocations.is_empty() {
            ObjectState::Active
        } else if self.invocations.values().all(|i| i.control.is_suspended()) {
            ObjectState::Suspended
        } else {
            ObjectState::Invoking
        };
    }

    fn cancel_invocations(&self) {
        for invocation in self.invocations.values() {
            invocation.control.cancel();
        }
    }
}

pub struct CloudObjectRegistry {
    host_id: HostId,
    catalog: Arc<TypeCatalog>,
    transfer: Arc<ClassTransfer>,
    outbox: Arc<dyn HostOutbox>,
    config: RegistryConfig,
    objects: Shared<HashMap<ObjectId, HostedObject>>,
    destroyed: Shared<RecentSet<ObjectId>>,
    /// Signalled whenever an invocation finishes
    drained: Notify,
    shut_down: AtomicBool,
}

impl CloudObjectRegistry {
    pub fn new(
        host_id: HostId,
        catalog: Arc<TypeCatalog>,
        transfer: Arc<ClassTransfer>,
        outbox: Arc<dyn HostOutbox>,
        config: RegistryConfig,
    ) -> Self {
        Self {
            host_id,
            catalog,
            transfer,
            outbox,
            config,
            objects: new_state(HashMap::new()),
            destroyed: new_state(RecentSet::new(DESTROYED_MEMORY)),
            drained: Notify::new(),
            shut_down: AtomicBool::new(false),
        }
    }

    pub fn host_id(&self) -> HostId {
        self.host_id
    }

    pub fn transfer(&self) -> &ClassTransfer {
        &self.transfer
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::SeqCst)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_shut_down() {
            return Err(NimbusError::ShutDown);
        }
        Ok(())
    }

    /// Code and files of a type, fetched through class transfer when not resident
    async fn load_code(&self, registration: &TypeRegistration) -> Result<Arc<CodeArtifact>> {
        let descriptor = &registration.descriptor;
        let code = self.transfer.resolve_type(descriptor).await?;
        self.transfer
            .resolve_files(&descriptor.type_name, &descriptor.file_dependencies)
            .await?;
        Ok(code)
    }

    fn registration(&self, type_name: &str) -> Result<Arc<TypeRegistration>> {
        self.catalog.get(type_name).ok_or_else(|| NimbusError::ClassLoading {
            name: type_name.to_string(),
            reason: "type is not registered on this host".into(),
        })
    }

    fn insert(&self, id: ObjectId, registration: Arc<TypeRegistration>, instance: Arc<dyn CloudObject>) -> Result<()> {
        let mut objects = self.objects.lock();
        if objects.contains_key(&id) {
            return Err(NimbusError::Migration {
                object: id,
                phase: MigrationPhase::Transferring,
                reason: format!("object already registered on host {}", self.host_id),
            });
        }
        let descriptor = CloudObjectDescriptor {
            id,
            type_name: registration.descriptor.type_name.clone(),
            owner_host_id: self.host_id,
            state: ObjectState::Active,
            executing_method_names: BTreeSet::new(),
        };
        objects.insert(
            id,
            HostedObject {
                descriptor,
                instance,
                registration,
                invocations: HashMap::new(),
                last_keep_alive: Instant::now(),
                migration: None,
            },
        );
        self.destroyed.lock().remove(&id);
        Ok(())
    }

    fn instance(&self, id: ObjectId) -> Result<Arc<dyn CloudObject>> {
        let mut objects = self.objects.lock();
        let entry = objects.get_mut(&id).ok_or_else(|| NimbusError::object_not_found(id))?;
        entry.touch();
        Ok(entry.instance.clone())
    }

    pub async fn create_new_cloud_object(
        &self,
        type_name: &str,
        params: Vec<Vec<u8>>,
        param_names: Vec<String>,
    ) -> Result<ObjectId> {
        self.ensure_open()?;
        let registration = self.registration(type_name)?;
        let code = self.load_code(&registration).await?;

        let instance = registration
            .factory
            .instantiate(&code, &params, &param_names)
            .map_err(|reason| NimbusError::Instantiation { type_name: type_name.to_string(), reason })?;

        self.ensure_open()?;
        let id = ObjectId::new();
        self.insert(id, registration, instance)?;
        info!(host = %self.host_id, object = %id, type_name, "cloud object created");
        Ok(id)
    }

    /// Starts `request` in the background and returns its request id at once.
    /// A request id already running on the object is acknowledged, not re-run.
    pub fn start_invoking_cloud_object(self: &Arc<Self>, request: InvocationRequest) -> Result<RequestId> {
        self.ensure_open()?;
        let object_id = request.object_id;
        let request_id = request.request_id;

        let (instance, control) = {
            let mut objects = self.objects.lock();
            let entry = objects
                .get_mut(&object_id)
                .ok_or_else(|| NimbusError::object_not_found(object_id))?;
            if entry.migration.is_some() {
                return Err(NimbusError::Busy(object_id));
            }
            if entry.invocations.contains_key(&request_id) {
                debug!(object = %object_id, request = %request_id, "duplicate invocation start ignored");
                return Ok(request_id);
            }
            let control = Arc::new(InvocationControl::default());
            entry.invocations.insert(
                request_id,
                RunningInvocation { method: request.method_name.clone(), control: control.clone() },
            );
            entry.touch();
            entry.refresh();
            (entry.instance.clone(), control)
        };

        debug!(object = %object_id, request = %request_id, method = %request.method_name, "invocation started");
        let registry = Arc::clone(self);
        tokio::spawn(async move {
            let ctx = InvocationContext::new(
                object_id,
                request_id,
                request.method_name.clone(),
                control,
                registry.outbox.clone(),
            );
            let outcome = tokio::task::spawn_blocking(move || {
                instance.invoke(&request.method_name, &request.params, &request.param_names, &ctx)
            })
            .await
            .unwrap_or_else(|e| Err(format!("invocation aborted: {e}")));
            registry.finish_invocation(object_id, request_id, outcome);
        });

        Ok(request_id)
    }

    fn finish_invocation(&self, object_id: ObjectId, request_id: RequestId, outcome: Result<Vec<u8>, String>) {
        {
            let mut objects = self.objects.lock();
            if let Some(entry) = objects.get_mut(&object_id) {
                entry.invocations.remove(&request_id);
                entry.touch();
                entry.refresh();
            }
        }
        self.drained.notify_waiters();

        let (status, result) = match outcome {
            Ok(bytes) => (InvocationStatus::Success, bytes),
            Err(message) => {
                debug!(object = %object_id, request = %request_id, %message, "invocation failed");
                (InvocationStatus::Failed, message.into_bytes())
            }
        };
        self.outbox.deliver_result(InvocationResult { request_id, object_id, result, status });
    }

    pub fn get_cloud_object_field(&self, id: ObjectId, field: &str) -> Result<Vec<u8>> {
        self.ensure_open()?;
        let instance = self.instance(id)?;
        instance.field(field).ok_or_else(|| NimbusError::field_not_found(id, field))
    }

    pub fn set_cloud_object_field(&self, id: ObjectId, field: &str, value: &[u8]) -> Result<()> {
        self.ensure_open()?;
        let instance = {
            let mut objects = self.objects.lock();
            let entry = objects.get_mut(&id).ok_or_else(|| NimbusError::object_not_found(id))?;
            if entry.migration.is_some() {
                return Err(NimbusError::Busy(id));
            }
            entry.touch();
            entry.instance.clone()
        };
        instance.set_field(field, value).map_err(|e| match e {
            FieldError::Unknown => NimbusError::field_not_found(id, field),
            FieldError::Rejected(reason) => {
                NimbusError::Serialization(format!("value for {id}.{field} rejected: {reason}"))
            }
        })
    }

    pub fn suspend_invocation(&self, id: ObjectId, request_id: RequestId) -> Result<()> {
        self.ensure_open()?;
        {
            let mut objects = self.objects.lock();
            let entry = objects.get_mut(&id).ok_or_else(|| NimbusError::object_not_found(id))?;
            let invocation = entry
                .invocations
                .get(&request_id)
                .ok_or_else(|| NimbusError::invocation_not_found(request_id))?;
            if !invocation.control.suspend() {
                return Err(NimbusError::InvalidState {
                    object: id,
                    reason: format!("invocation {request_id} is not running"),
                });
            }
            entry.refresh();
        }
        info!(object = %id, request = %request_id, "invocation suspended");
        self.outbox.deliver_result(InvocationResult {
            request_id,
            object_id: id,
            result: Vec::new(),
            status: InvocationStatus::Suspended,
        });
        Ok(())
    }

    pub fn resume_invocation(&self, id: ObjectId, request_id: RequestId) -> Result<()> {
        self.ensure_open()?;
        let mut objects = self.objects.lock();
        let entry = objects.get_mut(&id).ok_or_else(|| NimbusError::object_not_found(id))?;
        let invocation = entry
            .invocations
            .get(&request_id)
            .ok_or_else(|| NimbusError::invocation_not_found(request_id))?;
        if !invocation.control.resume() {
            return Err(NimbusError::InvalidState {
                object: id,
                reason: format!("invocation {request_id} is not suspended"),
            });
        }
        entry.refresh();
        info!(object = %id, request = %request_id, "invocation resumed");
        Ok(())
    }

    /// Idempotent on ids that were already destroyed
    pub fn destroy_cloud_object(&self, id: ObjectId) -> Result<()> {
        let mut objects = self.objects.lock();
        match objects.get(&id) {
            None => {
                if self.destroyed.lock().contains(&id) {
                    return Ok(());
                }
                return Err(NimbusError::object_not_found(id));
            }
            Some(entry) if entry.migration.is_some() => return Err(NimbusError::Busy(id)),
            Some(_) => {}
        }
        if let Some(entry) = objects.remove(&id) {
            entry.cancel_invocations();
        }
        self.destroyed.lock().insert(id);
        info!(host = %self.host_id, object = %id, "cloud object destroyed");
        Ok(())
    }

    pub fn get_cloud_object_type(&self, id: ObjectId) -> Result<String> {
        let objects = self.objects.lock();
        objects
            .get(&id)
            .map(|entry| entry.descriptor.type_name.clone())
            .ok_or_else(|| NimbusError::object_not_found(id))
    }

    pub fn keep_alive_cloud_object(&self, id: ObjectId) -> Result<()> {
        self.ensure_open()?;
        let mut objects = self.objects.lock();
        let entry = objects.get_mut(&id).ok_or_else(|| NimbusError::object_not_found(id))?;
        entry.touch();
        Ok(())
    }

    pub fn describe(&self, id: ObjectId) -> Result<CloudObjectDescriptor> {
        let objects = self.objects.lock();
        objects
            .get(&id)
            .map(|entry| entry.descriptor.clone())
            .ok_or_else(|| NimbusError::object_not_found(id))
    }

    pub fn descriptors(&self) -> Vec<CloudObjectDescriptor> {
        let mut list: Vec<_> = self.objects.lock().values().map(|e| e.descriptor.clone()).collect();
        list.sort_by_key(|d| d.id);
        list
    }

    pub fn object_count(&self) -> usize {
        self.objects.lock().len()
    }

    pub fn is_destroyed(&self, id: ObjectId) -> bool {
        self.destroyed.lock().contains(&id)
    }

    /// Destroys every hosted object; the registry refuses all later work
    pub fn shutdown(&self) -> usize {
        self.shut_down.store(true, Ordering::SeqCst);
        let removed: Vec<_> = {
            let mut objects = self.objects.lock();
            objects.drain().collect()
        };
        let mut destroyed = self.destroyed.lock();
        for (id, entry) in &removed {
            entry.cancel_invocations();
            destroyed.insert(*id);
        }
        info!(host = %self.host_id, objects = removed.len(), "registry shut down");
        removed.len()
    }

    /// Destroys objects whose keep-alive expired. Objects with running
    /// invocations or held by a migration are never reaped.
    pub fn reap_expired(&self, now: Instant) -> Vec<ObjectId> {
        let expiry = self.config.keep_alive_expiry();
        let mut objects = self.objects.lock();
        let expired: Vec<ObjectId> = objects
            .values()
            .filter(|e| e.migration.is_none() && e.invocations.is_empty())
            .filter(|e| now.saturating_duration_since(e.last_keep_alive) > expiry)
            .map(|e| e.descriptor.id)
            .collect();

        let mut destroyed = self.destroyed.lock();
        for id in &expired {
            objects.remove(id);
            destroyed.insert(*id);
            warn!(host = %self.host_id, object = %id, "no keep-alive received, object destroyed");
        }
        expired
    }

    pub fn spawn_keep_alive_reaper(registry: Arc<Self>) -> JoinHandle<()> {
        let period = registry.config.keep_alive_interval;
        info!(host = %registry.host_id, ?period, expiry = ?registry.config.keep_alive_expiry(), "starting keep-alive reaper");

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            loop {
                interval.tick().await;
                if registry.is_shut_down() {
                    break;
                }
                registry.reap_expired(Instant::now());
            }
        })
    }

    /// Source side of a migration: lock, drain running invocations, run the
    /// type's hooks, reset transient fields and serialize.
    pub async fn prepare_migration(&self, id: ObjectId) -> Result<MigrationPayload> {
        self.ensure_open()?;
        {
            let mut objects = self.objects.lock();
            let entry = objects.get_mut(&id).ok_or_else(|| NimbusError::object_not_found(id))?;
            if entry.migration.is_some() {
                return Err(NimbusError::Busy(id));
            }
            entry.migration = Some(MigrationPhase::Locked);
            entry.refresh();
        }
        debug!(object = %id, "object locked for migration");

        let deadline = tokio::time::Instant::now() + self.config.migration_drain_timeout;
        loop {
            let notified = self.drained.notified();
            let running = self.objects.lock().get(&id).map(|e| e.invocations.len());
            match running {
                None => return Err(NimbusError::object_not_found(id)),
                Some(0) => break,
                Some(n) => {
                    debug!(object = %id, running = n, "waiting for invocations before migrating");
                    if tokio::time::timeout_at(deadline, notified).await.is_err() {
                        self.abort_migration(id)?;
                        return Err(NimbusError::Busy(id));
                    }
                }
            }
        }

        let (instance, registration) = {
            let objects = self.objects.lock();
            let entry = objects.get(&id).ok_or_else(|| NimbusError::object_not_found(id))?;
            (entry.instance.clone(), entry.registration.clone())
        };

        let descriptor = registration.descriptor.clone();
        let outcome = tokio::task::spawn_blocking(move || {
            run_migration_hooks(instance.as_ref(), &descriptor)
                .map_err(|reason| (MigrationPhase::HooksRun, reason))?;
            descriptor
                .serialization
                .serialize(&descriptor.type_name, instance.as_ref())
                .map_err(|e| (MigrationPhase::Serialized, e.to_string()))
        })
        .await
        .unwrap_or_else(|e| Err((MigrationPhase::HooksRun, format!("preparation aborted: {e}"))));

        match outcome {
            Ok(payload) => {
                if let Some(entry) = self.objects.lock().get_mut(&id) {
                    entry.migration = Some(MigrationPhase::Serialized);
                }
                let descriptor = &registration.descriptor;
                info!(object = %id, bytes = payload.len(), strategy = descriptor.serialization.name(), "object serialized for migration");
                Ok(MigrationPayload {
                    object_id: id,
                    type_name: descriptor.type_name.clone(),
                    archive_name: descriptor.archive_name.clone(),
                    payload,
                })
            }
            Err((phase, reason)) => {
                self.abort_migration(id)?;
                Err(NimbusError::Migration { object: id, phase, reason })
            }
        }
    }

    /// Source side after the target registered the object: drop the local copy
    pub fn complete_migration(&self, id: ObjectId) -> Result<()> {
        let mut objects = self.objects.lock();
        match objects.get(&id) {
            None => return Err(NimbusError::object_not_found(id)),
            Some(entry) if entry.migration.is_none() => {
                return Err(NimbusError::InvalidState {
                    object: id,
                    reason: "object is not being migrated".into(),
                })
            }
            Some(_) => {}
        }
        objects.remove(&id);
        info!(host = %self.host_id, object = %id, "object handed over to its new host");
        Ok(())
    }

    /// Releases a migration lock and makes the object active again here
    pub fn abort_migration(&self, id: ObjectId) -> Result<()> {
        let mut objects = self.objects.lock();
        if let Some(entry) = objects.get_mut(&id) {
            if entry.migration.take().is_some() {
                entry.touch();
                entry.refresh();
                info!(host = %self.host_id, object = %id, "migration rolled back, object stays here");
            }
        }
        Ok(())
    }

    /// Target side: rebuild the object from its payload and register it `Active`
    pub async fn deploy_migrated(&self, request: MigrationDeployRequest) -> Result<()> {
        self.ensure_open()?;
        let id = request.object_id;
        if self.objects.lock().contains_key(&id) {
            return Err(NimbusError::Migration {
                object: id,
                phase: MigrationPhase::Transferring,
                reason: format!("object already registered on host {}", self.host_id),
            });
        }

        let registration = self.registration(&request.type_name)?;
        if request.archive_name != registration.descriptor.archive_name {
            warn!(
                object = %id,
                sent = ?request.archive_name,
                local = ?registration.descriptor.archive_name,
                "archive name of migrated object differs from local registration"
            );
        }
        let code = self.load_code(&registration).await?;
        let instance = registration
            .factory
            .instantiate(&code, &[], &[])
            .map_err(|reason| NimbusError::Instantiation { type_name: request.type_name.clone(), reason })?;
        registration
            .descriptor
            .serialization
            .deserialize(&request.type_name, &request.payload, instance.as_ref())?;

        self.insert(id, registration, instance)?;
        info!(host = %self.host_id, object = %id, type_name = %request.type_name, "migrated object deployed");
        Ok(())
    }

    /// Purges a copy that must not stay here; fine if there is none
    pub fn remove_migrated(&self, id: ObjectId) -> Result<()> {
        if let Some(entry) = self.objects.lock().remove(&id) {
            entry.cancel_invocations();
            info!(host = %self.host_id, object = %id, "stale migrated copy removed");
        }
        Ok(())
    }
}

fn run_migration_hooks(instance: &dyn CloudObject, descriptor: &TypeDescriptor) -> Result<(), String> {
    for hook in &descriptor.migration_hooks {
        instance
            .run_hook(&hook.name)
            .map_err(|e| format!("hook {} failed: {e}", hook.name))?;
    }
    for field in &descriptor.transient_fields {
        match &field.initializer {
            Some(init) => instance
                .set_field(&field.name, &init())
                .map_err(|e| format!("cannot re-initialize transient field {}: {e:?}", field.name))?,
            None => {
                if !instance.reset_field(&field.name) {
                    return Err(format!("transient field {} does not exist", field.name));
                }
            }
        }
    }
    Ok(())
}
