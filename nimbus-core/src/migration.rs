//! Live relocation of a cloud object between two hosts of a pool.
//!
//! The engine drives both registries through host commands: the source
//! prepares (lock, drain, hooks, serialize), the target deploys, and only
//! after a successful deploy does the source drop its copy. Any failure past
//! the lock rolls back to the source.

use crate::error::{NimbusError, Result};
use crate::ids::{HostId, ObjectId};
use crate::messages::{HostCommand, HostReply, MigrationPayload, MigrationRemoveRequest};
use crate::pool::{unexpected_reply, HostPool};
use crate::state::{new_state, Shared};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use tracing::{debug, error, info, warn};

const HISTORY_LEN: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MigrationPhase {
    Locked,
    HooksRun,
    Serialized,
    Transferring,
    Deployed,
    RolledBack,
}

impl MigrationPhase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, MigrationPhase::Deployed | MigrationPhase::RolledBack)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationRecord {
    pub object_id: ObjectId,
    pub source_host_id: HostId,
    pub target_host_id: HostId,
    pub phase: MigrationPhase,
    pub started_at: DateTime<Utc>,
}

pub struct MigrationEngine {
    live: Shared<HashMap<ObjectId, MigrationRecord>>,
    history: Shared<VecDeque<MigrationRecord>>,
    /// How long a target still starting up may take to become ready
    ready_timeout: Duration,
}

impl MigrationEngine {
    pub fn new(ready_timeout: Duration) -> Self {
        Self {
            live: new_state(HashMap::new()),
            history: new_state(VecDeque::new()),
            ready_timeout,
        }
    }

    pub fn is_migrating(&self, object: ObjectId) -> bool {
        self.live.lock().contains_key(&object)
    }

    pub fn active(&self) -> Vec<MigrationRecord> {
        self.live.lock().values().cloned().collect()
    }

    /// Most recent finished migrations, newest last
    pub fn history(&self) -> Vec<MigrationRecord> {
        self.history.lock().iter().cloned().collect()
    }

    fn begin(&self, object: ObjectId, source: HostId, target: HostId) -> Result<()> {
        let mut live = self.live.lock();
        if live.contains_key(&object) {
            return Err(NimbusError::Busy(object));
        }
        live.insert(
            object,
            MigrationRecord {
                object_id: object,
                source_host_id: source,
                target_host_id: target,
                phase: MigrationPhase::Locked,
                started_at: Utc::now(),
            },
        );
        Ok(())
    }

    fn set_phase(&self, object: ObjectId, phase: MigrationPhase) {
        if let Some(record) = self.live.lock().get_mut(&object) {
            debug!(object = %object, ?phase, "migration phase");
            record.phase = phase;
        }
    }

    fn finish(&self, object: ObjectId, phase: MigrationPhase) {
        let record = self.live.lock().remove(&object);
        if let Some(mut record) = record {
            record.phase = phase;
            let mut history = self.history.lock();
            if history.len() == HISTORY_LEN {
                history.pop_front();
            }
            history.push_back(record);
        }
    }

    /// Moves `object` from its current owner in `pool` to `target`
    pub async fn migrate(&self, pool: &dyn HostPool, object: ObjectId, target: HostId) -> Result<()> {
        let source = pool.owner_of(object).ok_or_else(|| NimbusError::object_not_found(object))?;
        if pool.host(target).is_none() {
            return Err(NimbusError::host_not_found(target));
        }
        if source == target {
            debug!(object = %object, host = %target, "object already lives on the target host");
            return Ok(());
        }

        // the target holds a slot until the bookkeeping lands on it, so a
        // scale-down never sees it empty while the object is in transit
        pool.reserve_slot(target)?;
        if let Err(e) = self.begin(object, source, target) {
            pool.cancel_slot(target);
            return Err(e);
        }
        info!(object = %object, %source, %target, "migration started");
        match self.run(pool, object, source, target).await {
            Ok(()) => {
                self.finish(object, MigrationPhase::Deployed);
                info!(object = %object, %source, %target, "migration complete");
                Ok(())
            }
            Err(e) => {
                pool.cancel_slot(target);
                self.finish(object, MigrationPhase::RolledBack);
                warn!(object = %object, %source, %target, error = %e, "migration rolled back");
                Err(e)
            }
        }
    }

    async fn run(&self, pool: &dyn HostPool, object: ObjectId, source: HostId, target: HostId) -> Result<()> {
        let source_endpoint = pool.endpoint(source)?;

        self.set_phase(object, MigrationPhase::HooksRun);
        let prepared = source_endpoint
            .call(HostCommand::PrepareMigration { object_id: object })
            .await
            .and_then(|reply| match reply {
                HostReply::Prepared { payload } => Ok(payload),
                other => Err(unexpected_reply("prepare_migration", &other)),
            });
        let payload: MigrationPayload = match prepared {
            Ok(payload) => payload,
            // the registry already released its own lock; a busy answer may
            // also mean another migration holds it, which must stay untouched
            Err(e @ NimbusError::Busy(_)) => return Err(e),
            Err(e) => {
                self.abort_on_source(pool, object, source).await;
                return Err(e);
            }
        };
        self.set_phase(object, MigrationPhase::Serialized);

        self.set_phase(object, MigrationPhase::Transferring);
        if let Err(e) = self.transfer(pool, payload, target).await {
            self.discard_on_target(pool, object, target).await;
            self.abort_on_source(pool, object, source).await;
            return Err(as_migration_failure(object, MigrationPhase::Transferring, e));
        }

        let completed = source_endpoint
            .call(HostCommand::CompleteMigration { object_id: object })
            .await;
        if let Err(e) = completed {
            self.discard_on_target(pool, object, target).await;
            self.abort_on_source(pool, object, source).await;
            return Err(as_migration_failure(object, MigrationPhase::Deployed, e));
        }

        // bookkeeping follows the object, possibly into another child pool
        let from_pool = pool.host(source).map(|h| h.pool);
        pool.release_object(object);
        pool.commit_slot(target, object)
            .map_err(|e| as_migration_failure(object, MigrationPhase::Deployed, e))?;
        let to_pool = pool.host(target).map(|h| h.pool);
        if from_pool != to_pool {
            info!(object = %object, from = ?from_pool, to = ?to_pool, "object re-homed to another pool");
        }
        self.set_phase(object, MigrationPhase::Deployed);
        Ok(())
    }

    async fn transfer(&self, pool: &dyn HostPool, payload: MigrationPayload, target: HostId) -> Result<()> {
        pool.await_ready(target, self.ready_timeout).await?;
        let endpoint = pool.endpoint(target)?;
        debug!(object = %payload.object_id, %target, bytes = payload.payload.len(), "sending migrated object");
        match endpoint
            .call(HostCommand::DeployMigrated { request: payload.into_deploy_request() })
            .await?
        {
            HostReply::Done => Ok(()),
            other => Err(unexpected_reply("deploy_migrated", &other)),
        }
    }

    async fn abort_on_source(&self, pool: &dyn HostPool, object: ObjectId, source: HostId) {
        let outcome = match pool.endpoint(source) {
            Ok(endpoint) => endpoint.call(HostCommand::AbortMigration { object_id: object }).await.map(|_| ()),
            Err(e) => Err(e),
        };
        if let Err(e) = outcome {
            error!(object = %object, %source, error = %e, "could not release migration lock on source");
        }
    }

    async fn discard_on_target(&self, pool: &dyn HostPool, object: ObjectId, target: HostId) {
        let Ok(endpoint) = pool.endpoint(target) else {
            return;
        };
        let request = MigrationRemoveRequest { object_id: object };
        if let Err(e) = endpoint.call(HostCommand::RemoveMigrated { request }).await {
            warn!(object = %object, %target, error = %e, "could not purge copy on target");
        }
    }
}

fn as_migration_failure(object: ObjectId, phase: MigrationPhase, e: NimbusError) -> NimbusError {
    match e {
        e @ NimbusError::Migration { .. } => e,
        other => NimbusError::Migration { object, phase, reason: other.to_string() },
    }
}
