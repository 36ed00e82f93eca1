//! Shared data model: object descriptors, host states and the read-only
//! projections handed to dashboards.

use crate::ids::{HostId, ObjectId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Lifecycle of a cloud object on its host
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ObjectState {
    /// Idle, accepts invocations
    Active,
    /// At least one invocation running
    Invoking,
    /// Every in-flight invocation is suspended
    Suspended,
    /// Locked by a migration, rejects new invocations
    Migrating,
    /// Terminal
    Destroyed,
}

impl ObjectState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ObjectState::Destroyed)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CloudObjectDescriptor {
    pub id: ObjectId,
    pub type_name: String,
    pub owner_host_id: HostId,
    pub state: ObjectState,
    /// Methods with at least one running invocation
    pub executing_method_names: BTreeSet<String>,
}

/// Lifecycle of a host inside its pool
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HostState {
    Starting,
    Running,
    /// Authorized for scale-down, waiting for its last objects to leave
    Draining,
    Terminated,
}

impl HostState {
    /// Whether the host may be handed new objects
    pub fn accepts_objects(&self) -> bool {
        matches!(self, HostState::Starting | HostState::Running)
    }
}

/// Dashboard projection of an object
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObjectView {
    pub id: ObjectId,
    pub host: HostId,
    #[serde(rename = "type")]
    pub type_name: String,
    pub state: ObjectState,
    pub executing_methods: Vec<String>,
}

impl From<&CloudObjectDescriptor> for ObjectView {
    fn from(d: &CloudObjectDescriptor) -> Self {
        Self {
            id: d.id,
            host: d.owner_host_id,
            type_name: d.type_name.clone(),
            state: d.state,
            executing_methods: d.executing_method_names.iter().cloned().collect(),
        }
    }
}

/// Dashboard projection of a host
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostView {
    pub id: HostId,
    pub address: String,
    pub is_static: bool,
}
