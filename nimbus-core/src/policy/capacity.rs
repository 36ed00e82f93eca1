use super::{start_host_for_placement, PlacementRequest, ScalingEventHandler, ScalingPolicy};
use crate::error::Result;
use crate::messages::MetricsEvent;
use crate::pool::{HostPool, HostSnapshot, HostSpec};
use async_trait::async_trait;
use tracing::{debug, info};

/// Packs up to `max_objects_per_host` objects per host.
///
/// Keeps one unused host around as a spare: an unused host may retire only
/// while another unused host exists. With a threshold set, a metrics event at
/// or above it starts an extra host in the background.
#[derive(Debug, Clone)]
pub struct CapacityPolicy {
    max_objects_per_host: usize,
    scale_up_threshold: Option<f64>,
    event_types: Vec<String>,
}

impl CapacityPolicy {
    pub fn new(max_objects_per_host: usize) -> Self {
        Self {
            max_objects_per_host: max_objects_per_host.max(1),
            scale_up_threshold: None,
            event_types: Vec::new(),
        }
    }

    pub fn with_scale_up(mut self, threshold: Option<f64>, event_types: Vec<String>) -> Self {
        self.scale_up_threshold = threshold;
        self.event_types = event_types;
        self
    }
}

#[async_trait]
impl ScalingPolicy for CapacityPolicy {
    fn name(&self) -> &'static str {
        "capacity"
    }

    async fn select_host(&self, _request: &PlacementRequest, pool: &dyn HostPool) -> Result<HostSnapshot> {
        let hosts = pool.hosts();
        if let Some(host) = hosts
            .into_iter()
            .find(|h| h.accepts_objects() && h.object_count() < self.max_objects_per_host)
        {
            return Ok(host);
        }
        start_host_for_placement(pool, self.name()).await
    }

    async fn scale_down(&self, host: &HostSnapshot, pool: &dyn HostPool) -> bool {
        if host.object_count() > 0 {
            return false;
        }
        pool.hosts()
            .iter()
            .any(|other| other.id != host.id && other.accepts_objects() && other.object_count() == 0)
    }

    fn event_handler(&self) -> Option<&dyn ScalingEventHandler> {
        self.scale_up_threshold.map(|_| self as &dyn ScalingEventHandler)
    }
}

#[async_trait]
impl ScalingEventHandler for CapacityPolicy {
    fn event_types(&self) -> Vec<String> {
        self.event_types.clone()
    }

    async fn on_event(&self, pool: &dyn HostPool, event: &MetricsEvent) -> Result<()> {
        let (Some(threshold), Some(value)) = (self.scale_up_threshold, event.value.as_f64()) else {
            return Ok(());
        };
        if value < threshold {
            debug!(event = %event.event_type, value, threshold, "below scale-up threshold");
            return Ok(());
        }
        if !pool.can_start_host() {
            debug!(pool = pool.name(), "scale-up wanted but the pool is full");
            return Ok(());
        }
        let host = pool.start_new_host_async(&HostSpec::default()).await?;
        info!(event = %event.event_type, value, host = %host.id, "scale-up triggered by metrics event");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::VirtualHostPool;
    use crate::testing::in_process;
    use chrono::Utc;
    use std::sync::Arc;
    use std::time::Duration;

    fn pool(scratch: &tempfile::TempDir, max_hosts: Option<usize>) -> VirtualHostPool {
        let (provisioner, _events) = in_process(scratch.path());
        VirtualHostPool::new("local", Arc::new(provisioner), Duration::from_secs(5), max_hosts)
    }

    fn event(value: f64) -> MetricsEvent {
        MetricsEvent { event_type: "cpu".into(), value: serde_json::json!(value), timestamp: Utc::now() }
    }

    #[tokio::test]
    async fn hosts_fill_up_before_a_new_one_starts() {
        let scratch = tempfile::tempdir().unwrap();
        let pool = pool(&scratch, None);
        let policy = CapacityPolicy::new(2);

        for _ in 0..3 {
            let host = policy.select_host(&PlacementRequest::new("Cell"), &pool).await.unwrap();
            pool.reserve_slot(host.id).unwrap();
        }
        let counts: Vec<_> = pool.hosts().iter().map(|h| h.object_count()).collect();
        assert_eq!(counts, vec![2, 1]);
    }

    #[tokio::test]
    async fn one_unused_host_is_kept_as_spare() {
        let scratch = tempfile::tempdir().unwrap();
        let pool = pool(&scratch, None);
        let policy = CapacityPolicy::new(2);
        let a = pool.start_new_host(&HostSpec::default()).await.unwrap();

        assert!(!policy.scale_down(&a, &pool).await);

        let b = pool.start_new_host(&HostSpec::default()).await.unwrap();
        assert!(policy.scale_down(&a, &pool).await);

        pool.reserve_slot(b.id).unwrap();
        assert!(!policy.scale_down(&a, &pool).await);
    }

    #[tokio::test]
    async fn metrics_above_threshold_start_a_host() {
        let scratch = tempfile::tempdir().unwrap();
        let pool = pool(&scratch, Some(2));
        let policy = CapacityPolicy::new(2).with_scale_up(Some(0.75), vec!["cpu".into()]);
        let handler = policy.event_handler().unwrap();

        handler.on_event(&pool, &event(0.5)).await.unwrap();
        assert_eq!(pool.hosts_count(), 0);

        handler.on_event(&pool, &event(0.9)).await.unwrap();
        handler.on_event(&pool, &event(0.9)).await.unwrap();
        handler.on_event(&pool, &event(0.9)).await.unwrap();
        assert_eq!(pool.hosts_count(), 2);
    }
}
