use super::{publish_json, topics, Bus, CommandEnvelope, Correlator, ReplyEnvelope};
use crate::classloading::CodeSource;
use crate::config::RuntimeConfig;
use crate::error::{RemoteOutcome, Result};
use crate::ids::{HostId, RequestId};
use crate::messages::{
    ClassBytesRequest, ClassBytesResponse, ConsoleOutputFragment, HostAnnouncement, HostCommand, HostReply,
    InvocationResult, MetricsEvent,
};
use crate::pool::HostEndpoint;
use crate::registry::{CloudObjectRegistry, HostOutbox};
use crate::results::ResultCollector;
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

fn decode<T: DeserializeOwned>(topic: &str, payload: &[u8]) -> Option<T> {
    match serde_json::from_slice(payload) {
        Ok(message) => Some(message),
        Err(e) => {
            warn!(topic, error = %e, "undecodable message dropped");
            None
        }
    }
}

/// Kernel-side handle on a remote host
pub struct BusEndpoint {
    host: HostId,
    bus: Arc<dyn Bus>,
    replies: Arc<Correlator<HostReply>>,
    timeout: Duration,
    /// Extra time a migration prepare may spend draining invocations
    drain_timeout: Duration,
}

impl BusEndpoint {
    pub fn new(host: HostId, bus: Arc<dyn Bus>, replies: Arc<Correlator<HostReply>>, config: &RuntimeConfig) -> Self {
        Self {
            host,
            bus,
            replies,
            timeout: config.request_timeout(),
            drain_timeout: Duration::from_secs(config.migration_drain_timeout_secs),
        }
    }

    fn timeout_for(&self, command: &HostCommand) -> Duration {
        match command {
            HostCommand::PrepareMigration { .. } => self.timeout + self.drain_timeout,
            _ => self.timeout,
        }
    }
}

#[async_trait]
impl HostEndpoint for BusEndpoint {
    async fn call(&self, command: HostCommand) -> Result<HostReply> {
        let id = RequestId::new();
        let timeout = self.timeout_for(&command);
        let what = format!("{} on host {}", command.action(), self.host);
        let rx = self.replies.register(id);
        let envelope = CommandEnvelope { correlation_id: id, reply_to: topics::KERNEL_REPLIES.to_string(), command };

        if let Err(e) = publish_json(self.bus.as_ref(), &topics::host_commands(self.host), &envelope).await {
            self.replies.cancel(id);
            return Err(e);
        }
        self.replies.wait(id, rx, timeout, &what).await
    }
}

/// Host-side code source asking the kernel for bytes over the bus
pub struct BusCodeSource {
    bus: Arc<dyn Bus>,
    replies: Arc<Correlator<ClassBytesResponse>>,
    timeout: Duration,
}

impl BusCodeSource {
    pub fn new(bus: Arc<dyn Bus>, replies: Arc<Correlator<ClassBytesResponse>>, timeout: Duration) -> Self {
        Self { bus, replies, timeout }
    }
}

#[async_trait]
impl CodeSource for BusCodeSource {
    async fn fetch(&self, request: ClassBytesRequest) -> Result<ClassBytesResponse> {
        let id = request.request_id;
        let what = format!("code bytes of {}", request.name);
        let rx = self.replies.register(id);
        if let Err(e) = publish_json(self.bus.as_ref(), topics::CLASS_REQUESTS, &request).await {
            self.replies.cancel(id);
            return Err(e);
        }
        self.replies.wait(id, rx, self.timeout, &what).await
    }
}

/// Publishes results and console output in the order the registry emits them
pub struct BusOutbox {
    tx: mpsc::UnboundedSender<(&'static str, Vec<u8>)>,
}

impl BusOutbox {
    pub fn spawn(bus: Arc<dyn Bus>) -> (Self, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::unbounded_channel::<(&'static str, Vec<u8>)>();
        let pump = tokio::spawn(async move {
            while let Some((topic, payload)) = rx.recv().await {
                if let Err(e) = bus.publish(topic, payload).await {
                    error!(topic, error = %e, "outbound message lost");
                }
            }
        });
        (Self { tx }, pump)
    }

    fn send<T: Serialize>(&self, topic: &'static str, message: &T) {
        match serde_json::to_vec(message) {
            Ok(payload) => {
                if self.tx.send((topic, payload)).is_err() {
                    warn!(topic, "outbox pump stopped");
                }
            }
            Err(e) => error!(topic, error = %e, "could not encode outbound message"),
        }
    }
}

impl HostOutbox for BusOutbox {
    fn deliver_result(&self, result: InvocationResult) {
        self.send(topics::INVOCATION_RESULTS, &result);
    }

    fn console(&self, fragment: ConsoleOutputFragment) {
        self.send(topics::CONSOLE, &fragment);
    }
}

/// Feeds bus traffic addressed to one host into its registry
pub struct HostRouter {
    registry: Arc<CloudObjectRegistry>,
    bus: Arc<dyn Bus>,
    class_replies: Arc<Correlator<ClassBytesResponse>>,
    command_topic: String,
    class_topic: String,
}

impl HostRouter {
    pub fn new(
        registry: Arc<CloudObjectRegistry>,
        bus: Arc<dyn Bus>,
        class_replies: Arc<Correlator<ClassBytesResponse>>,
    ) -> Self {
        let host = registry.host_id();
        Self {
            registry,
            bus,
            class_replies,
            command_topic: topics::host_commands(host),
            class_topic: topics::class_replies(host),
        }
    }

    pub fn subscriptions(&self) -> Vec<String> {
        vec![self.command_topic.clone(), self.class_topic.clone()]
    }

    pub fn route(&self, topic: &str, payload: &[u8]) {
        if topic == self.command_topic {
            let Some(envelope) = decode::<CommandEnvelope>(topic, payload) else {
                return;
            };
            let registry = self.registry.clone();
            let bus = self.bus.clone();
            tokio::spawn(async move {
                let action = envelope.command.action();
                let outcome = RemoteOutcome::from_result(registry.handle(envelope.command).await);
                let reply = ReplyEnvelope { correlation_id: envelope.correlation_id, outcome };
                if let Err(e) = publish_json(bus.as_ref(), &envelope.reply_to, &reply).await {
                    error!(action, error = %e, "reply could not be published");
                }
            });
        } else if topic == self.class_topic {
            if let Some(reply) = decode::<ReplyEnvelope<ClassBytesResponse>>(topic, payload) {
                self.class_replies.complete(reply);
            }
        } else {
            debug!(topic, "message for another host ignored");
        }
    }
}

/// Traffic the kernel must act on beyond request/reply bookkeeping
#[derive(Debug, Clone)]
pub enum KernelEvent {
    Announcement(HostAnnouncement),
    Metrics(MetricsEvent),
}

/// Kernel side of the bus: replies, results, console output and code requests
pub struct KernelInbox {
    replies: Arc<Correlator<HostReply>>,
    collector: Arc<ResultCollector>,
    code: Arc<dyn CodeSource>,
    bus: Arc<dyn Bus>,
}

impl KernelInbox {
    pub fn new(
        replies: Arc<Correlator<HostReply>>,
        collector: Arc<ResultCollector>,
        code: Arc<dyn CodeSource>,
        bus: Arc<dyn Bus>,
    ) -> Self {
        Self { replies, collector, code, bus }
    }

    pub fn subscriptions() -> Vec<String> {
        [
            topics::HOST_ALIVE,
            topics::KERNEL_REPLIES,
            topics::INVOCATION_RESULTS,
            topics::CONSOLE,
            topics::CLASS_REQUESTS,
            topics::METRICS_EVENTS,
        ]
        .into_iter()
        .map(String::from)
        .collect()
    }

    pub fn route(&self, topic: &str, payload: &[u8]) -> Option<KernelEvent> {
        match topic {
            topics::KERNEL_REPLIES => {
                self.replies.complete(decode::<ReplyEnvelope<HostReply>>(topic, payload)?);
                None
            }
            topics::INVOCATION_RESULTS => {
                self.collector.deliver(decode(topic, payload)?);
                None
            }
            topics::CONSOLE => {
                self.collector.console_fragment(decode(topic, payload)?);
                None
            }
            topics::CLASS_REQUESTS => {
                self.serve_code(decode(topic, payload)?);
                None
            }
            topics::HOST_ALIVE => decode(topic, payload).map(KernelEvent::Announcement),
            topics::METRICS_EVENTS => decode(topic, payload).map(KernelEvent::Metrics),
            _ => {
                debug!(topic, "unrouted kernel message");
                None
            }
        }
    }

    fn serve_code(&self, request: ClassBytesRequest) {
        let code = self.code.clone();
        let bus = self.bus.clone();
        tokio::spawn(async move {
            let host = request.host_id;
            let correlation_id = request.request_id;
            let name = request.name.clone();
            let outcome = RemoteOutcome::from_result(code.fetch(request).await);
            if let RemoteOutcome::Err(e) = &outcome {
                warn!(host = %host, name = %name, error = ?e, "code request refused");
            }
            let reply = ReplyEnvelope { correlation_id, outcome };
            if let Err(e) = publish_json(bus.as_ref(), &topics::class_replies(host), &reply).await {
                error!(host = %host, name = %name, error = %e, "code reply could not be published");
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classloading::ClassTransfer;
    use crate::config::RegistryConfig;
    use crate::error::NimbusError;
    use crate::messages::{InvocationRequest, InvocationStatus};
    use crate::testing::{cell_catalog, cell_code, create_cell};
    use std::sync::OnceLock;

    /// Delivers every publication synchronously to the kernel or the host
    #[derive(Default)]
    struct LoopBus {
        kernel: OnceLock<KernelInbox>,
        host: OnceLock<HostRouter>,
    }

    #[async_trait]
    impl Bus for LoopBus {
        async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<()> {
            if KernelInbox::subscriptions().iter().any(|t| t == topic) {
                if let Some(kernel) = self.kernel.get() {
                    kernel.route(topic, &payload);
                }
            } else if let Some(host) = self.host.get() {
                host.route(topic, &payload);
            }
            Ok(())
        }
    }

    struct Wiring {
        endpoint: BusEndpoint,
        registry: Arc<CloudObjectRegistry>,
        collector: Arc<ResultCollector>,
        _scratch: tempfile::TempDir,
    }

    fn wire() -> Wiring {
        let scratch = tempfile::tempdir().unwrap();
        let bus = Arc::new(LoopBus::default());
        let dyn_bus: Arc<dyn Bus> = bus.clone();
        let collector = Arc::new(ResultCollector::default());
        let host_replies = Arc::new(Correlator::<HostReply>::default());
        let class_replies = Arc::new(Correlator::<ClassBytesResponse>::default());

        let host = HostId::new();
        let source = Arc::new(BusCodeSource::new(dyn_bus.clone(), class_replies.clone(), Duration::from_secs(5)));
        let transfer = Arc::new(ClassTransfer::new(host, source, scratch.path()));
        let (outbox, _pump) = BusOutbox::spawn(dyn_bus.clone());
        let registry = Arc::new(CloudObjectRegistry::new(
            host,
            cell_catalog(),
            transfer,
            Arc::new(outbox),
            RegistryConfig { scratch_dir: scratch.path().to_path_buf(), ..RegistryConfig::default() },
        ));

        let _ = bus.kernel.set(KernelInbox::new(host_replies.clone(), collector.clone(), cell_code(), dyn_bus.clone()));
        let _ = bus.host.set(HostRouter::new(registry.clone(), dyn_bus.clone(), class_replies));

        let endpoint = BusEndpoint::new(host, dyn_bus, host_replies, &RuntimeConfig::default());
        Wiring { endpoint, registry, collector, _scratch: scratch }
    }

    #[tokio::test]
    async fn calls_and_results_cross_the_bus() {
        let wiring = wire();
        let object = create_cell(&wiring.endpoint).await;
        assert_eq!(wiring.registry.object_count(), 1);
        assert_eq!(wiring.registry.transfer().fetch_count(), 1);

        let request = InvocationRequest::new(object, "put").with_param("v", b"hi".to_vec());
        let rx = wiring.collector.expect(request.request_id);
        wiring.endpoint.call(HostCommand::StartInvocation { request }).await.unwrap();
        assert_eq!(rx.await.unwrap().status, InvocationStatus::Success);

        match wiring.endpoint.call(HostCommand::GetField { object_id: object, field: "value".into() }).await {
            Ok(HostReply::Field { value }) => assert_eq!(value, b"hi"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn remote_errors_keep_their_kind() {
        let wiring = wire();
        let missing = crate::ids::ObjectId::new();
        let err = wiring.endpoint.call(HostCommand::KeepAlive { object_id: missing }).await.unwrap_err();
        assert!(matches!(err, NimbusError::NotFound { .. }));
    }
}
