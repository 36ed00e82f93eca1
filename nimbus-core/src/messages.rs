//! Message shapes exchanged between the kernel and its hosts.
//!
//! Every payload is plain serde data; the transport decides how bytes move.

use crate::ids::{HostId, ObjectId, RequestId};
use crate::model::CloudObjectDescriptor;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::hash::{Hash, Hasher};

/// Start of one method call on a cloud object
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvocationRequest {
    pub object_id: ObjectId,
    pub request_id: RequestId,
    pub method_name: String,
    pub params: Vec<Vec<u8>>,
    /// Parallel to `params`, used for signature resolution
    pub param_names: Vec<String>,
}

impl InvocationRequest {
    pub fn new(object_id: ObjectId, method_name: impl Into<String>) -> Self {
        Self {
            object_id,
            request_id: RequestId::new(),
            method_name: method_name.into(),
            params: Vec::new(),
            param_names: Vec::new(),
        }
    }

    pub fn with_param(mut self, name: impl Into<String>, value: Vec<u8>) -> Self {
        self.param_names.push(name.into());
        self.params.push(value);
        self
    }
}

// Identity is the request id alone; retransmissions of the same call compare equal.
impl PartialEq for InvocationRequest {
    fn eq(&self, other: &Self) -> bool {
        self.request_id == other.request_id
    }
}

impl Eq for InvocationRequest {}

impl Hash for InvocationRequest {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.request_id.hash(state);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvocationStatus {
    Success,
    /// The method itself failed; the result bytes carry its message
    Failed,
    Suspended,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvocationResult {
    pub request_id: RequestId,
    pub object_id: ObjectId,
    pub result: Vec<u8>,
    pub status: InvocationStatus,
}

impl InvocationResult {
    /// Failure message of a `Failed` result
    pub fn error_message(&self) -> Option<String> {
        match self.status {
            InvocationStatus::Failed => Some(String::from_utf8_lossy(&self.result).into_owned()),
            _ => None,
        }
    }
}

/// How a transferable piece of code or data is packaged
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactKind {
    /// Packaged archive bundling several compiled units
    Archive,
    /// One compiled unit
    Unit,
    /// Declared file dependency
    File,
}

const ARCHIVE_EXTENSIONS: &[&str] = &[".jar", ".zip", ".car", ".tar", ".tar.gz", ".tgz"];

impl ArtifactKind {
    pub fn classify(name: &str) -> Self {
        let lower = name.to_ascii_lowercase();
        if ARCHIVE_EXTENSIONS.iter().any(|ext| lower.ends_with(ext)) {
            return ArtifactKind::Archive;
        }
        if name.contains('/') || name.contains('\\') {
            return ArtifactKind::File;
        }
        match name.rsplit_once('.') {
            // "limits.json" is a file, "samples.Counter" a qualified type name
            Some((_, ext)) if !ext.is_empty() && ext.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit()) => {
                ArtifactKind::File
            }
            _ => ArtifactKind::Unit,
        }
    }
}

/// Host asking its origin for code or file bytes
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassBytesRequest {
    pub request_id: RequestId,
    pub host_id: HostId,
    pub name: String,
    pub kind: ArtifactKind,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassBytesResponse {
    pub name: String,
    pub kind: ArtifactKind,
    /// Archive the bytes came from, when the origin packaged them
    #[serde(default)]
    pub archive_name: Option<String>,
    pub bytecode: Vec<u8>,
}

/// One chunk of an object's textual output, streamed back to its client
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsoleOutputFragment {
    pub object_id: ObjectId,
    /// Method that produced the output
    pub source: String,
    pub is_err: bool,
    pub text: String,
    pub line_separator: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationDeployRequest {
    pub object_id: ObjectId,
    pub type_name: String,
    pub archive_name: Option<String>,
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct MigrationRemoveRequest {
    pub object_id: ObjectId,
}

/// Output of the source side of a migration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationPayload {
    pub object_id: ObjectId,
    pub type_name: String,
    pub archive_name: Option<String>,
    pub payload: Vec<u8>,
}

impl MigrationPayload {
    pub fn into_deploy_request(self) -> MigrationDeployRequest {
        MigrationDeployRequest {
            object_id: self.object_id,
            type_name: self.type_name,
            archive_name: self.archive_name,
            payload: self.payload,
        }
    }
}

/// Remote invocation surface of a host
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum HostCommand {
    CreateObject {
        type_name: String,
        params: Vec<Vec<u8>>,
        param_names: Vec<String>,
    },
    StartInvocation {
        request: InvocationRequest,
    },
    GetField {
        object_id: ObjectId,
        field: String,
    },
    SetField {
        object_id: ObjectId,
        field: String,
        value: Vec<u8>,
    },
    SuspendInvocation {
        object_id: ObjectId,
        request_id: RequestId,
    },
    ResumeInvocation {
        object_id: ObjectId,
        request_id: RequestId,
    },
    DestroyObject {
        object_id: ObjectId,
    },
    GetObjectType {
        object_id: ObjectId,
    },
    KeepAlive {
        object_id: ObjectId,
    },
    Shutdown,
    DescribeObjects,
    PrepareMigration {
        object_id: ObjectId,
    },
    DeployMigrated {
        request: MigrationDeployRequest,
    },
    CompleteMigration {
        object_id: ObjectId,
    },
    AbortMigration {
        object_id: ObjectId,
    },
    RemoveMigrated {
        request: MigrationRemoveRequest,
    },
}

impl HostCommand {
    pub fn action(&self) -> &'static str {
        match self {
            HostCommand::CreateObject { .. } => "create_object",
            HostCommand::StartInvocation { .. } => "start_invocation",
            HostCommand::GetField { .. } => "get_field",
            HostCommand::SetField { .. } => "set_field",
            HostCommand::SuspendInvocation { .. } => "suspend_invocation",
            HostCommand::ResumeInvocation { .. } => "resume_invocation",
            HostCommand::DestroyObject { .. } => "destroy_object",
            HostCommand::GetObjectType { .. } => "get_object_type",
            HostCommand::KeepAlive { .. } => "keep_alive",
            HostCommand::Shutdown => "shutdown",
            HostCommand::DescribeObjects => "describe_objects",
            HostCommand::PrepareMigration { .. } => "prepare_migration",
            HostCommand::DeployMigrated { .. } => "deploy_migrated",
            HostCommand::CompleteMigration { .. } => "complete_migration",
            HostCommand::AbortMigration { .. } => "abort_migration",
            HostCommand::RemoveMigrated { .. } => "remove_migrated",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "reply", rename_all = "snake_case")]
pub enum HostReply {
    Created { object_id: ObjectId },
    InvocationStarted { request_id: RequestId },
    Field { value: Vec<u8> },
    TypeName { type_name: String },
    Objects { objects: Vec<CloudObjectDescriptor> },
    Prepared { payload: MigrationPayload },
    Done,
}

/// Periodic is-alive announcement of a host
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostAnnouncement {
    pub host_id: HostId,
    pub address: String,
    pub object_count: usize,
    pub timestamp: DateTime<Utc>,
}

/// Metrics event forwarded to event-driven scaling policies
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsEvent {
    pub event_type: String,
    pub value: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn invocation_requests_compare_by_request_id() {
        let object = ObjectId::new();
        let a = InvocationRequest::new(object, "add").with_param("n", vec![1]);
        let mut b = a.clone();
        b.method_name = "other".into();
        b.params.clear();

        assert_eq!(a, b);
        let set: HashSet<_> = [a.clone(), b].into_iter().collect();
        assert_eq!(set.len(), 1);
        assert_ne!(a, InvocationRequest::new(object, "add"));
    }

    #[test]
    fn artifact_kinds_follow_names() {
        assert_eq!(ArtifactKind::classify("counters.jar"), ArtifactKind::Archive);
        assert_eq!(ArtifactKind::classify("bundle.TAR.GZ"), ArtifactKind::Archive);
        assert_eq!(ArtifactKind::classify("conf/limits.json"), ArtifactKind::File);
        assert_eq!(ArtifactKind::classify("Counter"), ArtifactKind::Unit);
        assert_eq!(ArtifactKind::classify("samples::Counter"), ArtifactKind::Unit);
    }

    #[test]
    fn host_commands_are_tagged_by_action() {
        let cmd = HostCommand::KeepAlive { object_id: ObjectId::new() };
        let json = serde_json::to_value(&cmd).unwrap();
        assert_eq!(json["action"], "keep_alive");
        assert_eq!(cmd.action(), "keep_alive");
    }

    #[test]
    fn failed_results_expose_their_message() {
        let result = InvocationResult {
            request_id: RequestId::new(),
            object_id: ObjectId::new(),
            result: b"division by zero".to_vec(),
            status: InvocationStatus::Failed,
        };
        assert_eq!(result.error_message().as_deref(), Some("division by zero"));
    }
}
