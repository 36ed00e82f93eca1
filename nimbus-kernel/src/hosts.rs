/**
 * HOST DIRECTORY - Liveness of remote hosts
 *
 * RÔLE : Retient la dernière annonce de chaque host distant et réveille les
 * provisioners qui attendent la première annonce d'un host qu'ils viennent de
 * lancer. Un host muet depuis `host_timeout` est déclaré perdu auprès du runtime.
 */

use nimbus_core::messages::HostAnnouncement;
use nimbus_core::state::Shared;
use nimbus_core::{CloudRuntime, HostId};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct HostRecord {
    pub address: String,
    pub object_count: usize,
    pub last_seen: OffsetDateTime,
}

/// Liveness part of the dashboard host projection
#[derive(Debug, Clone, Serialize)]
pub struct LivenessView {
    pub last_seen: String,
    pub stale_for_seconds: i64,
    pub reported_objects: usize,
}

#[derive(Default)]
pub struct HostDirectory {
    records: Shared<HashMap<HostId, HostRecord>>,
    first_announcement: Shared<HashMap<HostId, oneshot::Sender<HostAnnouncement>>>,
}

impl HostDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolves with the first announcement `host` sends from now on
    pub fn expect_first(&self, host: HostId) -> oneshot::Receiver<HostAnnouncement> {
        let (tx, rx) = oneshot::channel();
        self.first_announcement.lock().insert(host, tx);
        rx
    }

    pub fn stop_expecting(&self, host: HostId) {
        self.first_announcement.lock().remove(&host);
    }

    pub fn record(&self, announcement: HostAnnouncement) {
        self.record_at(announcement, OffsetDateTime::now_utc());
    }

    fn record_at(&self, announcement: HostAnnouncement, now: OffsetDateTime) {
        let host = announcement.host_id;
        let previous = self.records.lock().insert(
            host,
            HostRecord { address: announcement.address.clone(), object_count: announcement.object_count, last_seen: now },
        );
        if previous.is_none() {
            info!(host = %host, address = %announcement.address, "host announced itself");
        }
        if let Some(waiter) = self.first_announcement.lock().remove(&host) {
            let _ = waiter.send(announcement);
        }
    }

    pub fn forget(&self, host: HostId) {
        self.records.lock().remove(&host);
    }

    pub fn get(&self, host: HostId) -> Option<HostRecord> {
        self.records.lock().get(&host).cloned()
    }

    pub fn liveness(&self, host: HostId) -> Option<LivenessView> {
        let record = self.get(host)?;
        let age = OffsetDateTime::now_utc() - record.last_seen;
        Some(LivenessView {
            last_seen: record.last_seen.format(&Rfc3339).unwrap_or_default(),
            stale_for_seconds: age.whole_seconds().max(0),
            reported_objects: record.object_count,
        })
    }

    /// Hosts whose last announcement is older than `timeout`
    pub fn silent_since(&self, timeout: Duration, now: OffsetDateTime) -> Vec<HostId> {
        let threshold = now - timeout;
        self.records
            .lock()
            .iter()
            .filter(|(_, record)| record.last_seen < threshold)
            .map(|(id, _)| *id)
            .collect()
    }

    /// Checks every `period` for hosts silent longer than `timeout`
    pub fn spawn_liveness_monitor(
        directory: Arc<Self>,
        runtime: Arc<CloudRuntime>,
        period: Duration,
        timeout: Duration,
    ) -> tokio::task::JoinHandle<()> {
        info!(?period, ?timeout, "starting host liveness monitor");
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            loop {
                interval.tick().await;
                for host in directory.silent_since(timeout, OffsetDateTime::now_utc()) {
                    warn!(host = %host, "host stopped announcing itself");
                    directory.forget(host);
                    let lost = runtime.host_lost(host).await;
                    debug!(host = %host, objects = lost.len(), "lost host removed from its pool");
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn announcement(host: HostId) -> HostAnnouncement {
        HostAnnouncement { host_id: host, address: "10.0.0.9".into(), object_count: 2, timestamp: Utc::now() }
    }

    #[tokio::test]
    async fn first_announcement_wakes_the_waiter() {
        let directory = HostDirectory::new();
        let host = HostId::new();
        let rx = directory.expect_first(host);

        directory.record(announcement(host));
        assert_eq!(rx.await.unwrap().address, "10.0.0.9");
        assert_eq!(directory.get(host).unwrap().object_count, 2);
        assert_eq!(directory.liveness(host).unwrap().reported_objects, 2);
    }

    #[test]
    fn silent_hosts_are_reported() {
        let directory = HostDirectory::new();
        let quiet = HostId::new();
        let chatty = HostId::new();
        let now = OffsetDateTime::now_utc();

        directory.record_at(announcement(quiet), now - Duration::from_secs(20));
        directory.record_at(announcement(chatty), now - Duration::from_secs(2));

        assert_eq!(directory.silent_since(Duration::from_secs(15), now), vec![quiet]);
        directory.forget(quiet);
        assert!(directory.silent_since(Duration::from_secs(15), now).is_empty());
    }
}
