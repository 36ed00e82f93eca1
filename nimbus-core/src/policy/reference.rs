use super::{start_host_for_placement, PlacementRequest, ScalingPolicy};
use crate::error::Result;
use crate::pool::{HostPool, HostSnapshot};
use async_trait::async_trait;
use tracing::debug;

/// Every object gets a host of its own; empty hosts are reused, none retire
#[derive(Debug, Clone, Copy, Default)]
pub struct HostPerObject;

#[async_trait]
impl ScalingPolicy for HostPerObject {
    fn name(&self) -> &'static str {
        "host-per-object"
    }

    async fn select_host(&self, request: &PlacementRequest, pool: &dyn HostPool) -> Result<HostSnapshot> {
        if let Some(empty) = pool
            .hosts()
            .into_iter()
            .find(|h| h.accepts_objects() && h.object_count() == 0)
        {
            debug!(host = %empty.id, type_name = %request.type_name, "reusing empty host");
            return Ok(empty);
        }
        start_host_for_placement(pool, self.name()).await
    }

    async fn scale_down(&self, _host: &HostSnapshot, _pool: &dyn HostPool) -> bool {
        false
    }
}

/// All objects share one host, started on first use; it never retires
#[derive(Debug, Clone, Copy, Default)]
pub struct SingleHost;

#[async_trait]
impl ScalingPolicy for SingleHost {
    fn name(&self) -> &'static str {
        "single-host"
    }

    async fn select_host(&self, _request: &PlacementRequest, pool: &dyn HostPool) -> Result<HostSnapshot> {
        match pool.hosts().into_iter().find(|h| h.accepts_objects()) {
            Some(host) => Ok(host),
            None => start_host_for_placement(pool, self.name()).await,
        }
    }

    async fn scale_down(&self, _host: &HostSnapshot, _pool: &dyn HostPool) -> bool {
        false
    }
}
