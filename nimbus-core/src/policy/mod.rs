//! Scaling policies: where new objects go and when hosts may retire.
//!
//! A policy is a capability object chosen by configuration. It has two
//! required operations and may expose an event handler for metrics-driven
//! scaling. Callers hold the pool's placement lock around `select_host` and
//! the slot reservation that follows it.

mod capacity;
mod reference;

pub use capacity::CapacityPolicy;
pub use reference::{HostPerObject, SingleHost};

use crate::error::{NimbusError, Result};
use crate::messages::MetricsEvent;
use crate::pool::{HostPool, HostSnapshot, HostSpec};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// What the policy knows about the object being placed
#[derive(Debug, Clone)]
pub struct PlacementRequest {
    pub type_name: String,
}

impl PlacementRequest {
    pub fn new(type_name: impl Into<String>) -> Self {
        Self { type_name: type_name.into() }
    }
}

#[async_trait]
pub trait ScalingPolicy: Send + Sync {
    fn name(&self) -> &'static str;

    /// A host that is or will become able to take the object. It may still
    /// be `Starting`; callers wait for it.
    async fn select_host(&self, request: &PlacementRequest, pool: &dyn HostPool) -> Result<HostSnapshot>;

    /// Whether `host` may be torn down once it is empty
    async fn scale_down(&self, host: &HostSnapshot, pool: &dyn HostPool) -> bool;

    fn event_handler(&self) -> Option<&dyn ScalingEventHandler> {
        None
    }
}

#[async_trait]
pub trait ScalingEventHandler: Send + Sync {
    /// Metrics event types this handler subscribes to
    fn event_types(&self) -> Vec<String>;

    async fn on_event(&self, pool: &dyn HostPool, event: &MetricsEvent) -> Result<()>;
}

/// Starts a host in the background, or reports that none can be started
pub(crate) async fn start_host_for_placement(pool: &dyn HostPool, policy: &str) -> Result<HostSnapshot> {
    if !pool.can_start_host() {
        return Err(NimbusError::Config(format!(
            "policy {policy} found no feasible host in pool {} and the pool is full",
            pool.name()
        )));
    }
    pool.start_new_host_async(&HostSpec::default()).await
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PolicyConfig {
    #[default]
    HostPerObject,
    SingleHost,
    Capacity {
        max_objects_per_host: usize,
        #[serde(default)]
        scale_up_threshold: Option<f64>,
        #[serde(default)]
        event_types: Vec<String>,
    },
}

impl PolicyConfig {
    pub fn build(&self) -> Arc<dyn ScalingPolicy> {
        match self {
            PolicyConfig::HostPerObject => Arc::new(HostPerObject),
            PolicyConfig::SingleHost => Arc::new(SingleHost),
            PolicyConfig::Capacity { max_objects_per_host, scale_up_threshold, event_types } => Arc::new(
                CapacityPolicy::new(*max_objects_per_host)
                    .with_scale_up(*scale_up_threshold, event_types.clone()),
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn policies_are_selected_by_kind() {
        let config: PolicyConfig = serde_json::from_str(r#"{"kind": "single_host"}"#).unwrap();
        assert_eq!(config.build().name(), "single-host");

        let config: PolicyConfig = serde_json::from_str(
            r#"{"kind": "capacity", "max_objects_per_host": 4, "scale_up_threshold": 0.8, "event_types": ["cpu"]}"#,
        )
        .unwrap();
        let policy = config.build();
        assert_eq!(policy.name(), "capacity");
        assert_eq!(policy.event_handler().map(|h| h.event_types()), Some(vec!["cpu".to_string()]));

        assert_eq!(PolicyConfig::default().build().name(), "host-per-object");
        assert!(PolicyConfig::default().build().event_handler().is_none());
    }
}
