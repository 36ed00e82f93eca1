//! Error taxonomy shared by every component of the engine.
//!
//! Errors crossing the bus travel as [`RemoteError`] and are turned back into
//! the same [`NimbusError`] variant on the calling side, so a `Busy` raised on a
//! host is still a `Busy` for the kernel.

use crate::ids::{HostId, ObjectId, RequestId};
use crate::migration::MigrationPhase;
use serde::{Deserialize, Serialize};
use std::fmt;

pub type Result<T, E = NimbusError> = std::result::Result<T, E>;

/// What kind of identifier could not be resolved
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Missing {
    Object,
    Host,
    Field,
    Invocation,
    Type,
}

impl fmt::Display for Missing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Missing::Object => "object",
            Missing::Host => "host",
            Missing::Field => "field",
            Missing::Invocation => "invocation",
            Missing::Type => "type",
        };
        f.write_str(name)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum NimbusError {
    #[error("class loading failed for {name}: {reason}")]
    ClassLoading { name: String, reason: String },
    #[error("could not instantiate {type_name}: {reason}")]
    Instantiation { type_name: String, reason: String },
    #[error("migration of {object} failed during {phase:?}: {reason}")]
    Migration {
        object: ObjectId,
        phase: MigrationPhase,
        reason: String,
    },
    #[error("serialization failed: {0}")]
    Serialization(String),
    #[error("pool mutation failed: {0}")]
    PoolMutation(String),
    #[error("object {0} is locked for migration, retry later")]
    Busy(ObjectId),
    #[error("{what} not found: {id}")]
    NotFound { what: Missing, id: String },
    #[error("invalid state for object {object}: {reason}")]
    InvalidState { object: ObjectId, reason: String },
    #[error("registry has been shut down")]
    ShutDown,
    #[error("configuration error: {0}")]
    Config(String),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("timed out waiting for {0}")]
    Timeout(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl NimbusError {
    pub fn object_not_found(id: ObjectId) -> Self {
        NimbusError::NotFound { what: Missing::Object, id: id.to_string() }
    }

    pub fn host_not_found(id: HostId) -> Self {
        NimbusError::NotFound { what: Missing::Host, id: id.to_string() }
    }

    pub fn field_not_found(object: ObjectId, field: &str) -> Self {
        NimbusError::NotFound { what: Missing::Field, id: format!("{object}.{field}") }
    }

    pub fn invocation_not_found(request: RequestId) -> Self {
        NimbusError::NotFound { what: Missing::Invocation, id: request.to_string() }
    }

    /// Only a migration lock is worth retrying; everything else is final.
    pub fn is_retryable(&self) -> bool {
        matches!(self, NimbusError::Busy(_))
    }
}

impl From<serde_json::Error> for NimbusError {
    fn from(e: serde_json::Error) -> Self {
        NimbusError::Serialization(e.to_string())
    }
}

impl From<bincode::Error> for NimbusError {
    fn from(e: bincode::Error) -> Self {
        NimbusError::Serialization(e.to_string())
    }
}

/// Wire form of [`NimbusError`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RemoteError {
    ClassLoading { name: String, reason: String },
    Instantiation { type_name: String, reason: String },
    Migration { object: ObjectId, phase: MigrationPhase, reason: String },
    Serialization { message: String },
    PoolMutation { message: String },
    Busy { object: ObjectId },
    NotFound { what: Missing, id: String },
    InvalidState { object: ObjectId, reason: String },
    ShutDown,
    Other { message: String },
}

impl From<&NimbusError> for RemoteError {
    fn from(e: &NimbusError) -> Self {
        match e {
            NimbusError::ClassLoading { name, reason } => RemoteError::ClassLoading {
                name: name.clone(),
                reason: reason.clone(),
            },
            NimbusError::Instantiation { type_name, reason } => RemoteError::Instantiation {
                type_name: type_name.clone(),
                reason: reason.clone(),
            },
            NimbusError::Migration { object, phase, reason } => RemoteError::Migration {
                object: *object,
                phase: *phase,
                reason: reason.clone(),
            },
            NimbusError::Serialization(message) => RemoteError::Serialization { message: message.clone() },
            NimbusError::PoolMutation(message) => RemoteError::PoolMutation { message: message.clone() },
            NimbusError::Busy(object) => RemoteError::Busy { object: *object },
            NimbusError::NotFound { what, id } => RemoteError::NotFound { what: *what, id: id.clone() },
            NimbusError::InvalidState { object, reason } => RemoteError::InvalidState {
                object: *object,
                reason: reason.clone(),
            },
            NimbusError::ShutDown => RemoteError::ShutDown,
            other => RemoteError::Other { message: other.to_string() },
        }
    }
}

impl From<RemoteError> for NimbusError {
    fn from(e: RemoteError) -> Self {
        match e {
            RemoteError::ClassLoading { name, reason } => NimbusError::ClassLoading { name, reason },
            RemoteError::Instantiation { type_name, reason } => NimbusError::Instantiation { type_name, reason },
            RemoteError::Migration { object, phase, reason } => NimbusError::Migration { object, phase, reason },
            RemoteError::Serialization { message } => NimbusError::Serialization(message),
            RemoteError::PoolMutation { message } => NimbusError::PoolMutation(message),
            RemoteError::Busy { object } => NimbusError::Busy(object),
            RemoteError::NotFound { what, id } => NimbusError::NotFound { what, id },
            RemoteError::InvalidState { object, reason } => NimbusError::InvalidState { object, reason },
            RemoteError::ShutDown => NimbusError::ShutDown,
            RemoteError::Other { message } => NimbusError::Transport(message),
        }
    }
}

/// Outcome of a remote call as carried on the bus
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "outcome", content = "body", rename_all = "snake_case")]
pub enum RemoteOutcome<T> {
    Ok(T),
    Err(RemoteError),
}

impl<T> RemoteOutcome<T> {
    pub fn from_result(result: Result<T>) -> Self {
        match result {
            Ok(value) => RemoteOutcome::Ok(value),
            Err(e) => RemoteOutcome::Err(RemoteError::from(&e)),
        }
    }

    pub fn into_result(self) -> Result<T> {
        match self {
            RemoteOutcome::Ok(value) => Ok(value),
            RemoteOutcome::Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn busy_survives_the_wire() {
        let object = ObjectId::new();
        let wire = RemoteOutcome::<()>::from_result(Err(NimbusError::Busy(object)));
        let json = serde_json::to_string(&wire).unwrap();
        let back: RemoteOutcome<()> = serde_json::from_str(&json).unwrap();

        match back.into_result() {
            Err(e) => {
                assert!(e.is_retryable());
                assert!(matches!(e, NimbusError::Busy(id) if id == object));
            }
            Ok(()) => panic!("expected busy"),
        }
    }

    #[test]
    fn io_errors_degrade_to_transport_on_the_wire() {
        let err = NimbusError::Io(std::io::Error::new(std::io::ErrorKind::Other, "disk full"));
        let back: NimbusError = RemoteError::from(&err).into();
        assert!(!back.is_retryable());
        assert!(matches!(back, NimbusError::Transport(msg) if msg.contains("disk full")));
    }

    #[test]
    fn not_found_reports_what_was_missing() {
        let err = NimbusError::field_not_found(ObjectId::new(), "count");
        assert!(err.to_string().starts_with("field not found"));
    }
}
