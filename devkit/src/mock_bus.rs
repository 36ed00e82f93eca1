/*!
Mock Bus pour tests sans broker

Enregistre toutes les publications et permet de simuler la réception de
messages, pour tester le routage kernel/host sans démarrer MQTT.
*/

use async_trait::async_trait;
use nimbus_core::transport::Bus;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::mpsc;

#[derive(Debug, Clone)]
pub struct MockMessage {
    pub topic: String,
    pub payload: Vec<u8>,
}

/// [`Bus`] that keeps what it is given
#[derive(Clone, Default)]
pub struct MockBus {
    published: Arc<Mutex<Vec<MockMessage>>>,
    incoming: Arc<Mutex<Option<mpsc::UnboundedSender<MockMessage>>>>,
}

impl MockBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Channel on which simulated inbound messages arrive
    pub fn setup_receiver(&self) -> mpsc::UnboundedReceiver<MockMessage> {
        let (tx, rx) = mpsc::unbounded_channel();
        *self.incoming.lock() = Some(tx);
        rx
    }

    pub fn simulate_incoming(&self, topic: impl Into<String>, payload: impl Into<Vec<u8>>) -> anyhow::Result<()> {
        let message = MockMessage { topic: topic.into(), payload: payload.into() };
        log::info!("[MOCK] simulated incoming on {}", message.topic);
        match self.incoming.lock().as_ref() {
            Some(tx) => tx.send(message).map_err(|e| anyhow::anyhow!("receiver dropped: {e}")),
            None => Err(anyhow::anyhow!("no receiver set up")),
        }
    }

    pub fn published_messages(&self) -> Vec<MockMessage> {
        self.published.lock().clone()
    }

    pub fn find_messages_by_topic(&self, topic: &str) -> Vec<MockMessage> {
        self.published.lock().iter().filter(|m| m.topic == topic).cloned().collect()
    }

    /// Last message of `topic` decoded as JSON
    pub fn last_json_message<T>(&self, topic: &str) -> anyhow::Result<Option<T>>
    where
        T: for<'de> serde::Deserialize<'de>,
    {
        match self.find_messages_by_topic(topic).last() {
            Some(message) => Ok(Some(serde_json::from_slice(&message.payload)?)),
            None => Ok(None),
        }
    }

    /// Waits until `topic` received at least `count` messages
    pub async fn wait_for(&self, topic: &str, count: usize, timeout: std::time::Duration) -> anyhow::Result<Vec<MockMessage>> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let found = self.find_messages_by_topic(topic);
            if found.len() >= count {
                return Ok(found);
            }
            if tokio::time::Instant::now() >= deadline {
                anyhow::bail!("{topic}: {} of {count} messages after {timeout:?}", found.len());
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
    }

    pub fn clear(&self) {
        self.published.lock().clear();
    }
}

#[async_trait]
impl Bus for MockBus {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> nimbus_core::Result<()> {
        log::debug!("[MOCK] published to {topic}: {} bytes", payload.len());
        self.published.lock().push(MockMessage { topic: topic.to_string(), payload });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nimbus_core::transport::publish_json;

    #[tokio::test]
    async fn publications_are_recorded_per_topic() {
        let bus = MockBus::new();
        bus.publish("a", b"one".to_vec()).await.unwrap();
        publish_json(&bus, "b", &serde_json::json!({ "n": 42 })).await.unwrap();

        assert_eq!(bus.published_messages().len(), 2);
        assert_eq!(bus.find_messages_by_topic("a")[0].payload, b"one");
        let parsed: serde_json::Value = bus.last_json_message("b").unwrap().unwrap();
        assert_eq!(parsed["n"], 42);
        assert!(bus.last_json_message::<serde_json::Value>("c").unwrap().is_none());

        bus.clear();
        assert!(bus.published_messages().is_empty());
    }

    #[tokio::test]
    async fn incoming_messages_reach_the_receiver() {
        let bus = MockBus::new();
        assert!(bus.simulate_incoming("x", b"early".to_vec()).is_err());

        let mut rx = bus.setup_receiver();
        bus.simulate_incoming("x", b"hello".to_vec()).unwrap();
        let message = rx.recv().await.unwrap();
        assert_eq!((message.topic.as_str(), message.payload.as_slice()), ("x", &b"hello"[..]));
    }
}
