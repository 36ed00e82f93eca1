//! Serialization strategies selectable per cloud type.
//!
//! Strategies capture the object's fields into a [`FieldSnapshot`] and restore
//! them into a blank instance built by the target host's own factory, so the
//! target resolves the type through its classloading channel instead of
//! assuming the source's code is present.

use crate::error::{NimbusError, Result};
use crate::types::{CloudObject, FieldError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::Debug;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldSnapshot {
    pub type_name: String,
    pub fields: BTreeMap<String, Vec<u8>>,
}

impl FieldSnapshot {
    pub fn capture(type_name: &str, object: &dyn CloudObject) -> Result<Self> {
        let mut fields = BTreeMap::new();
        for name in object.field_names() {
            let value = object.field(&name).ok_or_else(|| {
                NimbusError::Serialization(format!("field {name} listed by {type_name} but not readable"))
            })?;
            fields.insert(name, value);
        }
        Ok(Self { type_name: type_name.to_string(), fields })
    }

    pub fn restore(&self, expected_type: &str, object: &dyn CloudObject) -> Result<()> {
        if self.type_name != expected_type {
            return Err(NimbusError::Serialization(format!(
                "payload holds a {} but {} was expected",
                self.type_name, expected_type
            )));
        }
        for (name, value) in &self.fields {
            match object.set_field(name, value) {
                Ok(()) => {}
                Err(FieldError::Unknown) => {
                    return Err(NimbusError::Serialization(format!(
                        "{expected_type} has no field {name} on this host"
                    )))
                }
                Err(FieldError::Rejected(reason)) => {
                    return Err(NimbusError::Serialization(format!("field {name} rejected: {reason}")))
                }
            }
        }
        Ok(())
    }
}

pub trait SerializationStrategy: Send + Sync + Debug {
    fn name(&self) -> &'static str;

    fn serialize(&self, type_name: &str, object: &dyn CloudObject) -> Result<Vec<u8>>;

    /// Restores `payload` into `target`, a blank instance of `type_name`
    fn deserialize(&self, type_name: &str, payload: &[u8], target: &dyn CloudObject) -> Result<()>;
}

/// Default strategy: compact binary field stream
#[derive(Debug, Clone, Copy, Default)]
pub struct FieldStreamSerializer;

impl SerializationStrategy for FieldStreamSerializer {
    fn name(&self) -> &'static str {
        "field-stream"
    }

    fn serialize(&self, type_name: &str, object: &dyn CloudObject) -> Result<Vec<u8>> {
        let snapshot = FieldSnapshot::capture(type_name, object)?;
        Ok(bincode::serialize(&snapshot)?)
    }

    fn deserialize(&self, type_name: &str, payload: &[u8], target: &dyn CloudObject) -> Result<()> {
        let snapshot: FieldSnapshot = bincode::deserialize(payload)?;
        snapshot.restore(type_name, target)
    }
}

/// Human-readable alternative, handy when payloads need inspecting
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonFieldSerializer;

impl SerializationStrategy for JsonFieldSerializer {
    fn name(&self) -> &'static str {
        "json"
    }

    fn serialize(&self, type_name: &str, object: &dyn CloudObject) -> Result<Vec<u8>> {
        let snapshot = FieldSnapshot::capture(type_name, object)?;
        Ok(serde_json::to_vec(&snapshot)?)
    }

    fn deserialize(&self, type_name: &str, payload: &[u8], target: &dyn CloudObject) -> Result<()> {
        let snapshot: FieldSnapshot = serde_json::from_slice(payload)?;
        snapshot.restore(type_name, target)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::InvocationContext;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct Pair {
        left: Mutex<Vec<u8>>,
        right: Mutex<Vec<u8>>,
    }

    impl CloudObject for Pair {
        fn invoke(&self, _: &str, _: &[Vec<u8>], _: &[String], _: &InvocationContext) -> Result<Vec<u8>, String> {
            Ok(Vec::new())
        }

        fn field(&self, name: &str) -> Option<Vec<u8>> {
            match name {
                "left" => Some(self.left.lock().clone()),
                "right" => Some(self.right.lock().clone()),
                _ => None,
            }
        }

        fn set_field(&self, name: &str, value: &[u8]) -> Result<(), FieldError> {
            match name {
                "left" => *self.left.lock() = value.to_vec(),
                "right" => *self.right.lock() = value.to_vec(),
                _ => return Err(FieldError::Unknown),
            }
            Ok(())
        }

        fn reset_field(&self, name: &str) -> bool {
            self.set_field(name, &[]).is_ok()
        }

        fn field_names(&self) -> Vec<String> {
            vec!["left".into(), "right".into()]
        }
    }

    fn check_round_trip(strategy: &dyn SerializationStrategy) {
        let source = Pair::default();
        source.set_field("left", b"abc").unwrap();
        source.set_field("right", &[1, 2, 3]).unwrap();

        let payload = strategy.serialize("Pair", &source).unwrap();
        let target = Pair::default();
        strategy.deserialize("Pair", &payload, &target).unwrap();

        assert_eq!(target.field("left"), source.field("left"));
        assert_eq!(target.field("right"), source.field("right"));
    }

    #[test]
    fn both_strategies_restore_every_field() {
        check_round_trip(&FieldStreamSerializer);
        check_round_trip(&JsonFieldSerializer);
    }

    #[test]
    fn type_mismatch_is_a_serialization_error() {
        let payload = FieldStreamSerializer.serialize("Pair", &Pair::default()).unwrap();
        let err = FieldStreamSerializer.deserialize("Other", &payload, &Pair::default()).unwrap_err();
        assert!(matches!(err, NimbusError::Serialization(_)));
    }

    #[test]
    fn garbage_payload_is_rejected() {
        let err = JsonFieldSerializer.deserialize("Pair", b"not json", &Pair::default()).unwrap_err();
        assert!(matches!(err, NimbusError::Serialization(_)));
    }
}
