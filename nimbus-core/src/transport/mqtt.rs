use super::Bus;
use crate::error::{NimbusError, Result};
use async_trait::async_trait;
use rumqttc::{AsyncClient, Event, EventLoop, Incoming, MqttOptions, QoS};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MqttSettings {
    pub host: String,
    pub port: u16,
    pub keep_alive_secs: u64,
}

impl Default for MqttSettings {
    fn default() -> Self {
        Self { host: "localhost".into(), port: 1883, keep_alive_secs: 15 }
    }
}

/// [`Bus`] over an MQTT broker, QoS 1
#[derive(Clone)]
pub struct MqttBus {
    client: AsyncClient,
}

impl MqttBus {
    pub fn connect(client_id: &str, settings: &MqttSettings) -> (Self, EventLoop) {
        let mut opts = MqttOptions::new(client_id, &settings.host, settings.port);
        opts.set_keep_alive(Duration::from_secs(settings.keep_alive_secs));
        opts.set_max_packet_size(16 * 1024 * 1024, 16 * 1024 * 1024);
        let (client, eventloop) = AsyncClient::new(opts, 64);
        (Self { client }, eventloop)
    }

    pub fn client(&self) -> &AsyncClient {
        &self.client
    }
}

#[async_trait]
impl Bus for MqttBus {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<()> {
        self.client
            .publish(topic, QoS::AtLeastOnce, false, payload)
            .await
            .map_err(|e| NimbusError::Transport(format!("publish on {topic} failed: {e}")))
    }
}

/// Polls the broker connection forever, (re)subscribing on every connect
pub async fn drive_event_loop<F>(bus: &MqttBus, mut eventloop: EventLoop, topics: &[String], mut on_publish: F)
where
    F: FnMut(&str, &[u8]),
{
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Incoming::ConnAck(_))) => {
                for topic in topics {
                    if let Err(e) = bus.client.try_subscribe(topic.as_str(), QoS::AtLeastOnce) {
                        warn!(topic = %topic, error = ?e, "MQTT subscribe failed");
                    }
                }
                info!(topics = topics.len(), "connected to MQTT broker");
            }
            Ok(Event::Incoming(Incoming::Publish(p))) => on_publish(&p.topic, &p.payload),
            Ok(_) => {}
            Err(e) => {
                warn!(error = ?e, "MQTT connection error, retrying");
                tokio::time::sleep(Duration::from_secs(2)).await;
                debug!("reconnecting to MQTT broker");
            }
        }
    }
}
