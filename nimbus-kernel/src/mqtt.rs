use crate::hosts::HostDirectory;
use nimbus_core::transport::{drive_event_loop, KernelEvent, KernelInbox, MqttBus};
use nimbus_core::CloudRuntime;
use rumqttc::EventLoop;
use std::sync::Arc;
use tokio::task::{self, JoinHandle};

/// Routes everything the hosts publish to the kernel's inbox
pub fn spawn_mqtt_listener(
    bus: MqttBus,
    eventloop: EventLoop,
    inbox: Arc<KernelInbox>,
    directory: Arc<HostDirectory>,
    runtime: Arc<CloudRuntime>,
) -> JoinHandle<()> {
    task::spawn(async move {
        let topics = KernelInbox::subscriptions();
        drive_event_loop(&bus, eventloop, &topics, |topic, payload| match inbox.route(topic, payload) {
            Some(KernelEvent::Announcement(announcement)) => directory.record(announcement),
            Some(KernelEvent::Metrics(event)) => {
                let runtime = runtime.clone();
                task::spawn(async move { runtime.on_metrics_event(event).await });
            }
            None => {}
        })
        .await;
    })
}
