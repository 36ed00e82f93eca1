//! End-to-end behaviour of a runtime over in-process hosts.

use chrono::Utc;
use nimbus_core::messages::{HostCommand, HostReply, InvocationRequest, InvocationResult, InvocationStatus, MetricsEvent};
use nimbus_core::policy::{CapacityPolicy, HostPerObject, SingleHost};
use nimbus_core::transport::{topics, CommandEnvelope, ReplyEnvelope, Bus, BusOutbox, HostRouter};
use nimbus_core::error::RemoteOutcome;
use nimbus_core::{
    ClassTransfer, CloudObjectRegistry, HostOutbox, HostPool, HostSpec, MigrationPhase, NimbusError, RequestId,
    RuntimeConfig,
};
use nimbus_devkit::fixtures::{fixture_catalog, fixture_code, Gate, FRESH_CACHE, GATED, RECORDER};
use nimbus_devkit::{runtime_test, MockBus, TestHarness};
use nimbus_host::catalog::COUNTER;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinSet;

fn json_field(value: Vec<u8>) -> Vec<String> {
    serde_json::from_slice(&value).unwrap()
}

runtime_test!(classes_are_fetched_once_per_host, SingleHost, |harness| {
    harness.create(COUNTER).await?;
    harness.create(COUNTER).await?;
    anyhow::ensure!(harness.class_fetches() == 1, "archive fetched {} times", harness.class_fetches());

    harness.create(RECORDER).await?;
    harness.create(RECORDER).await?;
    anyhow::ensure!(harness.class_fetches() == 2, "unit fetched again");
    Ok(())
});

#[tokio::test(flavor = "multi_thread")]
async fn migration_keeps_state_except_transient_fields() {
    let harness = TestHarness::new(Arc::new(HostPerObject)).unwrap();
    let runtime = &harness.runtime;
    let recorder = harness.create(RECORDER).await.unwrap();
    harness.call(recorder, "record", &["a"]).await.unwrap();
    harness.call(recorder, "record", &["b"]).await.unwrap();
    assert_eq!(runtime.get_field(recorder, "cache").await.unwrap(), b"b");

    let source = runtime.pool().owner_of(recorder).unwrap();
    let target = runtime.pool().start_new_host(&HostSpec::default()).await.unwrap();
    runtime.migrate(recorder, target.id).await.unwrap();

    assert_eq!(runtime.pool().owner_of(recorder), Some(target.id));
    assert_eq!(harness.registry(source).unwrap().object_count(), 0);
    assert_eq!(json_field(runtime.get_field(recorder, "calls").await.unwrap()), vec!["a", "b"]);
    assert_eq!(runtime.get_field(recorder, "cache").await.unwrap(), FRESH_CACHE);
    // hooks ran by ascending priority before the state was captured
    assert_eq!(json_field(runtime.get_field(recorder, "hook_log").await.unwrap()), vec!["seal", "stamp"]);

    let records = runtime.pool().migrations();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].phase, MigrationPhase::Deployed);
}

#[tokio::test(flavor = "multi_thread")]
async fn host_per_object_fills_empty_hosts_first() {
    let harness = TestHarness::new(Arc::new(HostPerObject)).unwrap();
    let pool = harness.runtime.pool();

    let first = harness.create(RECORDER).await.unwrap();
    let empty = pool.start_new_host(&HostSpec::default()).await.unwrap();
    let second = harness.create(RECORDER).await.unwrap();
    assert_eq!(pool.owner_of(second), Some(empty.id));
    assert_eq!(pool.hosts_count(), 2);

    let third = harness.create(RECORDER).await.unwrap();
    assert_eq!(pool.hosts_count(), 3);
    let owners: Vec<_> = [first, second, third].iter().map(|o| pool.owner_of(*o)).collect();
    assert!(owners[2] != owners[0] && owners[2] != owners[1]);
}

#[tokio::test(flavor = "multi_thread")]
async fn concurrent_creations_never_share_an_empty_host() {
    let harness = TestHarness::new(Arc::new(HostPerObject)).unwrap();
    harness.runtime.pool().start_new_host(&HostSpec::default()).await.unwrap();

    let mut creations = JoinSet::new();
    for _ in 0..4 {
        let runtime = harness.runtime.clone();
        creations.spawn(async move { runtime.create_object(RECORDER, Vec::new(), Vec::new()).await });
    }
    while let Some(created) = creations.join_next().await {
        created.unwrap().unwrap();
    }

    let hosts = harness.runtime.pool().hosts();
    assert_eq!(hosts.len(), 4);
    assert!(hosts.iter().all(|h| h.objects.len() == 1));
}

#[tokio::test(flavor = "multi_thread")]
async fn single_host_creates_exactly_one_host() {
    let harness = TestHarness::new(Arc::new(SingleHost)).unwrap();
    let mut creations = JoinSet::new();
    for _ in 0..6 {
        let runtime = harness.runtime.clone();
        creations.spawn(async move { runtime.create_object(COUNTER, Vec::new(), Vec::new()).await });
    }
    while let Some(created) = creations.join_next().await {
        created.unwrap().unwrap();
    }

    assert_eq!(harness.provisioned_hosts(), 1);
    assert_eq!(harness.runtime.pool().hosts()[0].objects.len(), 6);
}

#[tokio::test(flavor = "multi_thread")]
async fn migration_across_child_pools_moves_the_bookkeeping() {
    let harness = TestHarness::aggregated(Arc::new(HostPerObject), &["edge", "cloud"]).unwrap();
    let runtime = &harness.runtime;
    let counter = harness.create(COUNTER).await.unwrap();
    harness.call(counter, "add", &["41"]).await.unwrap();

    let edge = harness.pool("edge").unwrap();
    let cloud = harness.pool("cloud").unwrap();
    assert_eq!((edge.object_count(), cloud.object_count()), (1, 0));

    let target = runtime.pool().start_new_host(&HostSpec::in_pool("cloud")).await.unwrap();
    assert_eq!(target.pool, "cloud");
    runtime.migrate(counter, target.id).await.unwrap();

    assert_eq!((edge.object_count(), cloud.object_count()), (0, 1));
    assert_eq!(runtime.pool().owner_of(counter), Some(target.id));
    assert_eq!(runtime.pool().object_count(), 1);
    let result = harness.call(counter, "increment", &[]).await.unwrap();
    assert_eq!(result.result, b"42");
}

#[tokio::test(flavor = "multi_thread")]
async fn invocations_are_refused_while_a_migration_holds_the_object() {
    let harness = TestHarness::new(Arc::new(HostPerObject)).unwrap();
    let runtime = harness.runtime.clone();
    let gated = harness.create(GATED).await.unwrap();
    harness.call(gated, "set", &["kept"]).await.unwrap();
    let source = runtime.pool().owner_of(gated).unwrap();
    let target = runtime.pool().start_new_host(&HostSpec::default()).await.unwrap();

    let migration = {
        let runtime = runtime.clone();
        tokio::spawn(async move { runtime.migrate(gated, target.id).await })
    };
    harness.gate.entered().await;

    let err = runtime.invoke(InvocationRequest::new(gated, "get")).await.unwrap_err();
    assert!(matches!(err, NimbusError::Busy(id) if id == gated));
    assert!(err.is_retryable());
    // the source registry refuses on its own as well
    let source_registry = harness.registry(source).unwrap();
    let err = source_registry.start_invoking_cloud_object(InvocationRequest::new(gated, "get")).unwrap_err();
    assert!(matches!(err, NimbusError::Busy(_)));
    assert!(matches!(runtime.set_field(gated, "value", b"x".to_vec()).await, Err(NimbusError::Busy(_))));

    harness.gate.open();
    migration.await.unwrap().unwrap();

    let result = harness.call(gated, "get", &[]).await.unwrap();
    assert_eq!(result.status, InvocationStatus::Success);
    assert_eq!(result.result, b"kept");
    assert_eq!(runtime.pool().owner_of(gated), Some(target.id));
}

#[tokio::test(flavor = "multi_thread")]
async fn objects_without_keep_alive_are_destroyed() {
    let harness = TestHarness::new(Arc::new(SingleHost)).unwrap();
    let idle = harness.create(COUNTER).await.unwrap();
    let registry = harness.owner_registry(idle).unwrap();
    let expiry = harness.runtime.config().keep_alive_expiry();

    assert!(registry.reap_expired(Instant::now() + expiry / 2).is_empty());
    assert_eq!(registry.reap_expired(Instant::now() + expiry + Duration::from_secs(1)), vec![idle]);
    assert!(registry.is_destroyed(idle));
    assert!(matches!(harness.runtime.keep_alive(idle).await, Err(NimbusError::NotFound { .. })));
}

runtime_test!(application_errors_travel_as_failed_results, SingleHost, |harness| {
    let recorder = harness.create(RECORDER).await?;
    let result = harness.call(recorder, "fail", &[]).await?;
    anyhow::ensure!(result.status == InvocationStatus::Failed, "status {:?}", result.status);
    anyhow::ensure!(result.error_message().as_deref() == Some("requested failure"), "wrong message");
    Ok(())
});

#[tokio::test(flavor = "multi_thread")]
async fn console_output_reaches_subscribers() {
    let harness = TestHarness::new(Arc::new(SingleHost)).unwrap();
    let mut console = harness.runtime.collector().subscribe_console();
    let recorder = harness.create(RECORDER).await.unwrap();
    harness.call(recorder, "shout", &[]).await.unwrap();

    let out = console.recv().await.unwrap();
    let err = console.recv().await.unwrap();
    assert_eq!((out.object_id, out.is_err, out.text.as_str()), (recorder, false, "to stdout"));
    assert_eq!((err.source.as_str(), err.is_err), ("shout", true));
}

#[tokio::test(flavor = "multi_thread")]
async fn metrics_above_threshold_start_a_spare_host() {
    let policy = CapacityPolicy::new(2).with_scale_up(Some(0.8), vec!["cpu".into()]);
    let harness = TestHarness::new(Arc::new(policy)).unwrap();
    harness.create(COUNTER).await.unwrap();
    assert_eq!(harness.runtime.pool().hosts_count(), 1);

    let event = |event_type: &str, value: f64| MetricsEvent {
        event_type: event_type.into(),
        value: serde_json::json!(value),
        timestamp: Utc::now(),
    };
    harness.runtime.on_metrics_event(event("memory", 0.99)).await;
    harness.runtime.on_metrics_event(event("cpu", 0.5)).await;
    assert_eq!(harness.runtime.pool().hosts_count(), 1);

    harness.runtime.on_metrics_event(event("cpu", 0.95)).await;
    assert_eq!(harness.runtime.pool().hosts_count(), 2);
}

#[tokio::test(flavor = "multi_thread")]
async fn destroyed_objects_release_their_host_for_teardown() {
    let mut config = RuntimeConfig::default();
    config.scale_down_interval_secs = 1;
    let harness = TestHarness::with_config(Arc::new(CapacityPolicy::new(1)), config).unwrap();
    let a = harness.create(COUNTER).await.unwrap();
    let b = harness.create(COUNTER).await.unwrap();
    assert_eq!(harness.runtime.pool().hosts_count(), 2);

    harness.runtime.destroy(a).await.unwrap();
    harness.runtime.destroy(b).await.unwrap();
    // one unused host stays as a spare
    assert_eq!(harness.runtime.scale_down_sweep().await.len(), 1);
    assert_eq!(harness.runtime.pool().hosts_count(), 1);
    assert_eq!(harness.provisioned_hosts(), 2);
}

/// Host side of the bus: commands in, replies and results out
#[tokio::test(flavor = "multi_thread")]
async fn host_router_answers_over_the_bus() {
    let bus = MockBus::new();
    let scratch = tempfile::tempdir().unwrap();
    let host = nimbus_core::HostId::new();
    let shared: Arc<dyn Bus> = Arc::new(bus.clone());
    let (outbox, _pump) = BusOutbox::spawn(shared.clone());
    let outbox: Arc<dyn HostOutbox> = Arc::new(outbox);
    let transfer = Arc::new(ClassTransfer::new(host, Arc::new(fixture_code()), scratch.path()));
    let registry = Arc::new(CloudObjectRegistry::new(
        host,
        fixture_catalog(Gate::new()),
        transfer,
        outbox,
        RuntimeConfig::default().registry_config(scratch.path()),
    ));
    let router = HostRouter::new(registry, shared, Arc::default());
    assert!(router.subscriptions().contains(&topics::host_commands(host)));

    let send = |command: HostCommand| {
        let envelope = CommandEnvelope { correlation_id: RequestId::new(), reply_to: "test/replies".into(), command };
        router.route(&topics::host_commands(host), &serde_json::to_vec(&envelope).unwrap());
    };

    send(HostCommand::CreateObject { type_name: RECORDER.into(), params: Vec::new(), param_names: Vec::new() });
    bus.wait_for("test/replies", 1, Duration::from_secs(5)).await.unwrap();
    let reply: ReplyEnvelope<HostReply> = bus.last_json_message("test/replies").unwrap().unwrap();
    let object_id = match reply.outcome {
        RemoteOutcome::Ok(HostReply::Created { object_id }) => object_id,
        other => panic!("unexpected reply {other:?}"),
    };

    let request = InvocationRequest::new(object_id, "record").with_param("entry", b"over the bus".to_vec());
    send(HostCommand::StartInvocation { request: request.clone() });
    bus.wait_for(topics::INVOCATION_RESULTS, 1, Duration::from_secs(5)).await.unwrap();
    let result: InvocationResult = bus.last_json_message(topics::INVOCATION_RESULTS).unwrap().unwrap();
    assert_eq!((result.request_id, result.status), (request.request_id, InvocationStatus::Success));

    send(HostCommand::GetObjectType { object_id: nimbus_core::ObjectId::new() });
    let replies = bus.wait_for("test/replies", 3, Duration::from_secs(5)).await.unwrap();
    let refused = replies
        .iter()
        .filter_map(|m| serde_json::from_slice::<ReplyEnvelope<HostReply>>(&m.payload).ok())
        .filter(|r| matches!(r.outcome, RemoteOutcome::Err(_)))
        .count();
    assert_eq!(refused, 1);
}
