/*!
Test Harness pour le moteur Nimbus

Construit un `CloudRuntime` complet sur des pools en mémoire :
- un pool simple ou un pool agrégé de plusieurs sous-pools nommés
- hosts `InProcessProvisioner` servis par le code des fixtures
- accès direct aux registres des hosts pour les assertions
*/

use crate::fixtures::{fixture_catalog, fixture_code, Gate};
use anyhow::{Context, Result};
use nimbus_core::messages::{InvocationRequest, InvocationResult};
use nimbus_core::pool::InProcessProvisioner;
use nimbus_core::{
    AggregatedHostPool, CloudObjectRegistry, CloudRuntime, CodeSource, HostId, HostPool, ObjectId, ResultCollector,
    RuntimeConfig, ScalingPolicy, VirtualHostPool,
};
use std::sync::Arc;
use tempfile::TempDir;

struct PoolUnderTest {
    pool: Arc<VirtualHostPool>,
    provisioner: Arc<InProcessProvisioner>,
}

/// Runtime plus the in-process hosts behind it
pub struct TestHarness {
    pub runtime: Arc<CloudRuntime>,
    /// Shared by every `fixtures.Gated` object of this harness
    pub gate: Arc<Gate>,
    pools: Vec<PoolUnderTest>,
    _scratch: TempDir,
}

impl TestHarness {
    /// One pool named `local`
    pub fn new(policy: Arc<dyn ScalingPolicy>) -> Result<Self> {
        Self::build(policy, &["local"], false, RuntimeConfig::default())
    }

    /// An aggregated pool over one child per name
    pub fn aggregated(policy: Arc<dyn ScalingPolicy>, children: &[&str]) -> Result<Self> {
        Self::build(policy, children, true, RuntimeConfig::default())
    }

    pub fn with_config(policy: Arc<dyn ScalingPolicy>, config: RuntimeConfig) -> Result<Self> {
        Self::build(policy, &["local"], false, config)
    }

    fn build(policy: Arc<dyn ScalingPolicy>, names: &[&str], aggregate: bool, config: RuntimeConfig) -> Result<Self> {
        env_logger::try_init().ok(); // logs des tests
        let scratch = tempfile::tempdir().context("cannot create scratch directory")?;
        let gate = Gate::new();
        let catalog = fixture_catalog(gate.clone());
        let code: Arc<dyn CodeSource> = Arc::new(fixture_code());
        let collector = Arc::new(ResultCollector::default());

        let pools: Vec<PoolUnderTest> = names
            .iter()
            .map(|name| {
                let provisioner = Arc::new(InProcessProvisioner::new(
                    catalog.clone(),
                    code.clone(),
                    collector.clone(),
                    config.clone(),
                    scratch.path().join(name),
                ));
                let pool = Arc::new(VirtualHostPool::new(
                    *name,
                    provisioner.clone(),
                    config.host_startup_timeout(),
                    None,
                ));
                PoolUnderTest { pool, provisioner }
            })
            .collect();

        let pool: Arc<dyn HostPool> = match (aggregate, pools.first()) {
            (false, Some(only)) => only.pool.clone(),
            _ => {
                let children = pools.iter().map(|p| p.pool.clone() as Arc<dyn HostPool>).collect();
                Arc::new(AggregatedHostPool::new("cluster", children, config.host_startup_timeout()))
            }
        };
        log::info!("harness ready: {} pool(s), policy {}", pools.len(), policy.name());

        Ok(Self {
            runtime: Arc::new(CloudRuntime::new(pool, policy, collector, config)),
            gate,
            pools,
            _scratch: scratch,
        })
    }

    pub fn pool(&self, name: &str) -> Option<&Arc<VirtualHostPool>> {
        self.pools.iter().find(|p| p.pool.name() == name).map(|p| &p.pool)
    }

    pub fn provisioner(&self, name: &str) -> Option<&Arc<InProcessProvisioner>> {
        self.pools.iter().find(|p| p.pool.name() == name).map(|p| &p.provisioner)
    }

    pub fn registry(&self, host: HostId) -> Option<Arc<CloudObjectRegistry>> {
        self.pools.iter().find_map(|p| p.provisioner.registry(host))
    }

    /// Registry currently holding `object`
    pub fn owner_registry(&self, object: ObjectId) -> Option<Arc<CloudObjectRegistry>> {
        let host = self.runtime.pool().owner_of(object)?;
        self.registry(host)
    }

    /// Code requests sent by every live host so far
    pub fn class_fetches(&self) -> usize {
        self.pools
            .iter()
            .flat_map(|p| p.provisioner.registries())
            .map(|r| r.transfer().fetch_count())
            .sum()
    }

    /// Hosts ever provisioned across all pools
    pub fn provisioned_hosts(&self) -> usize {
        self.pools.iter().map(|p| p.provisioner.provisioned_count()).sum()
    }

    pub async fn create(&self, type_name: &str) -> Result<ObjectId> {
        let id = self
            .runtime
            .create_object(type_name, Vec::new(), Vec::new())
            .await
            .with_context(|| format!("cannot create {type_name}"))?;
        Ok(id)
    }

    /// Invokes `method` with text arguments and waits for its result
    pub async fn call(&self, object: ObjectId, method: &str, params: &[&str]) -> Result<InvocationResult> {
        let mut request = InvocationRequest::new(object, method);
        for (i, param) in params.iter().enumerate() {
            request = request.with_param(format!("arg{i}"), param.as_bytes().to_vec());
        }
        let result = self
            .runtime
            .invoke_and_wait(request)
            .await
            .with_context(|| format!("{method} on {object} failed"))?;
        Ok(result)
    }
}

/// Macro pour écrire un test sur un runtime complet
#[macro_export]
macro_rules! runtime_test {
    ($name:ident, $policy:expr, |$harness:ident| $body:block) => {
        #[tokio::test(flavor = "multi_thread")]
        async fn $name() {
            let $harness = $crate::test_utils::TestHarness::new(std::sync::Arc::new($policy)).unwrap();
            let outcome: anyhow::Result<()> = async { $body }.await;
            if let Err(e) = outcome {
                panic!("test '{}' failed: {e:#}", stringify!($name));
            }
        }
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::RECORDER;
    use nimbus_core::messages::InvocationStatus;
    use nimbus_core::policy::SingleHost;

    #[tokio::test(flavor = "multi_thread")]
    async fn harness_runs_a_call_end_to_end() {
        let harness = TestHarness::new(Arc::new(SingleHost)).unwrap();
        let recorder = harness.create(RECORDER).await.unwrap();

        let result = harness.call(recorder, "record", &["hello"]).await.unwrap();
        assert_eq!(result.status, InvocationStatus::Success);
        assert_eq!(result.result, b"1");
        assert_eq!(harness.owner_registry(recorder).unwrap().object_count(), 1);
        assert_eq!(harness.provisioned_hosts(), 1);
    }

    #[tokio::test]
    async fn aggregated_harness_names_its_children() {
        let harness = TestHarness::aggregated(Arc::new(SingleHost), &["edge", "cloud"]).unwrap();
        assert_eq!(harness.runtime.pool().name(), "cluster");
        assert!(harness.pool("edge").is_some());
        assert!(harness.provisioner("cloud").is_some());
        assert!(harness.pool("other").is_none());
    }

    runtime_test!(macro_builds_a_single_pool_runtime, SingleHost, |harness| {
        let object = harness.create(RECORDER).await?;
        harness.call(object, "record", &["x"]).await?;
        anyhow::ensure!(harness.runtime.pool().object_count() == 1, "object not tracked");
        Ok(())
    });
}
