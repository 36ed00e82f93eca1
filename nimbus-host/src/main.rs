//! Nimbus Host - remote runtime process for cloud objects
//!
//! - Announces itself to the kernel on a fixed interval
//! - Executes host commands against its object registry
//! - Fetches code and file dependencies from the kernel on demand
//! - Streams console output and invocation results back over MQTT

use anyhow::{Context, Result};
use chrono::Utc;
use nimbus_core::messages::HostAnnouncement;
use nimbus_core::transport::{
    drive_event_loop, publish_json, topics, Bus, BusCodeSource, BusOutbox, Correlator, HostRouter, MqttBus,
};
use nimbus_core::{ClassTransfer, CloudObjectRegistry};
use nimbus_host::catalog::sample_catalog;
use nimbus_host::config::HostConfig;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

struct HostAgent {
    config: HostConfig,
    bus: Arc<dyn Bus>,
    registry: Arc<CloudObjectRegistry>,
    tasks: Vec<JoinHandle<()>>,
}

impl HostAgent {
    async fn start(config: HostConfig) -> Result<Self> {
        let host_id = config.host.host_id;
        info!(host = %host_id, address = %config.address(), "Initializing Nimbus host");

        let (mqtt, eventloop) = MqttBus::connect(&format!("nimbus-host-{host_id}"), &config.mqtt_settings());
        let bus: Arc<dyn Bus> = Arc::new(mqtt.clone());

        let scratch = config.scratch_dir();
        tokio::fs::create_dir_all(&scratch)
            .await
            .with_context(|| format!("Failed to create scratch dir {}", scratch.display()))?;

        let class_replies = Arc::new(Correlator::default());
        let source = Arc::new(BusCodeSource::new(bus.clone(), class_replies.clone(), config.runtime.request_timeout()));
        let transfer = Arc::new(ClassTransfer::new(host_id, source, scratch.clone()));
        let (outbox, pump) = BusOutbox::spawn(bus.clone());
        let registry = Arc::new(CloudObjectRegistry::new(
            host_id,
            sample_catalog(),
            transfer,
            Arc::new(outbox),
            config.runtime.registry_config(scratch),
        ));

        let router = HostRouter::new(registry.clone(), bus.clone(), class_replies);
        let subscriptions = router.subscriptions();
        let listener = tokio::spawn(async move {
            drive_event_loop(&mqtt, eventloop, &subscriptions, |topic, payload| router.route(topic, payload)).await;
        });
        let reaper = CloudObjectRegistry::spawn_keep_alive_reaper(registry.clone());

        Ok(Self { config, bus, registry, tasks: vec![pump, listener, reaper] })
    }

    async fn announce(&self) -> Result<()> {
        let announcement = HostAnnouncement {
            host_id: self.registry.host_id(),
            address: self.config.address(),
            object_count: self.registry.object_count(),
            timestamp: Utc::now(),
        };
        publish_json(self.bus.as_ref(), topics::HOST_ALIVE, &announcement)
            .await
            .context("Failed to publish announcement")?;
        debug!(objects = announcement.object_count, "announcement sent");
        Ok(())
    }

    /// Announces until the kernel shuts the registry down or the process is interrupted
    async fn run(&self) -> Result<()> {
        let mut alive_timer = interval(self.config.runtime.is_alive_interval());

        loop {
            tokio::select! {
                _ = alive_timer.tick() => {
                    if self.registry.is_shut_down() {
                        info!("registry shut down by the kernel");
                        break;
                    }
                    if let Err(e) = self.announce().await {
                        error!("Failed to announce host: {e:#}");
                    }
                }
                signal = tokio::signal::ctrl_c() => {
                    signal.context("Failed to listen for ctrl-c")?;
                    info!("interrupted");
                    break;
                }
            }
        }
        Ok(())
    }

    fn stop(self) {
        if !self.registry.is_shut_down() {
            let dropped = self.registry.shutdown();
            if dropped > 0 {
                warn!(objects = dropped, "objects dropped at shutdown");
            }
        }
        for task in self.tasks {
            task.abort();
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!("Nimbus host starting...");
    let config = HostConfig::load().await.context("Failed to load host configuration")?;

    let agent = HostAgent::start(config).await.context("Failed to start host")?;
    let outcome = agent.run().await.context("Host execution failed");
    agent.stop();
    info!("Nimbus host stopped");
    outcome
}
