//! Bus transport between the kernel and remote hosts.
//!
//! Every message is JSON on a versioned MQTT topic. Request/reply pairs carry
//! a correlation id; replies land in a [`Correlator`] that wakes the caller.

mod bridge;
mod mqtt;

pub use bridge::{BusCodeSource, BusEndpoint, BusOutbox, HostRouter, KernelEvent, KernelInbox};
pub use mqtt::{drive_event_loop, MqttBus, MqttSettings};

use crate::error::{NimbusError, RemoteOutcome, Result};
use crate::ids::RequestId;
use crate::messages::HostCommand;
use crate::state::{new_state, Shared};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::debug;

pub mod topics {
    use crate::ids::HostId;

    pub const HOST_ALIVE: &str = "nimbus/hosts/alive@v1";
    pub const KERNEL_REPLIES: &str = "nimbus/kernel/replies@v1";
    pub const INVOCATION_RESULTS: &str = "nimbus/invocations/result@v1";
    pub const CONSOLE: &str = "nimbus/objects/console@v1";
    pub const CLASS_REQUESTS: &str = "nimbus/classes/request@v1";
    pub const METRICS_EVENTS: &str = "nimbus/metrics/event@v1";

    pub fn host_commands(host: HostId) -> String {
        format!("nimbus/hosts/{host}/command@v1")
    }

    pub fn class_replies(host: HostId) -> String {
        format!("nimbus/hosts/{host}/classes@v1")
    }
}

/// Fire-and-forget publication of raw payloads
#[async_trait]
pub trait Bus: Send + Sync {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<()>;
}

pub async fn publish_json<T: Serialize + ?Sized>(bus: &dyn Bus, topic: &str, message: &T) -> Result<()> {
    bus.publish(topic, serde_json::to_vec(message)?).await
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandEnvelope {
    pub correlation_id: RequestId,
    pub reply_to: String,
    pub command: HostCommand,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplyEnvelope<T> {
    pub correlation_id: RequestId,
    pub outcome: RemoteOutcome<T>,
}

/// Callers waiting for a reply, keyed by correlation id
pub struct Correlator<T> {
    pending: Shared<HashMap<RequestId, oneshot::Sender<RemoteOutcome<T>>>>,
}

impl<T> Default for Correlator<T> {
    fn default() -> Self {
        Self { pending: new_state(HashMap::new()) }
    }
}

impl<T> Correlator<T> {
    pub fn register(&self, id: RequestId) -> oneshot::Receiver<RemoteOutcome<T>> {
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(id, tx);
        rx
    }

    pub fn cancel(&self, id: RequestId) {
        self.pending.lock().remove(&id);
    }

    /// Returns false for replies nobody waits for (late or duplicated)
    pub fn complete(&self, reply: ReplyEnvelope<T>) -> bool {
        let Some(tx) = self.pending.lock().remove(&reply.correlation_id) else {
            debug!(correlation = %reply.correlation_id, "reply without a waiter");
            return false;
        };
        tx.send(reply.outcome).is_ok()
    }

    pub fn pending_len(&self) -> usize {
        self.pending.lock().len()
    }

    pub async fn wait(
        &self,
        id: RequestId,
        rx: oneshot::Receiver<RemoteOutcome<T>>,
        timeout: Duration,
        what: &str,
    ) -> Result<T> {
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(outcome)) => outcome.into_result(),
            Ok(Err(_)) => Err(NimbusError::Transport(format!("{what} was abandoned"))),
            Err(_) => {
                self.cancel(id);
                Err(NimbusError::Timeout(what.to_string()))
            }
        }
    }
}
