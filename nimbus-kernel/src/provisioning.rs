/**
 * PROCESS PROVISIONER - Hosts as child processes of the kernel
 *
 * RÔLE : Lance un processus `nimbus-host` par host démarré par un pool, lui
 * transmet son identité et le broker via l'environnement, attend sa première
 * annonce, puis l'arrête proprement (attente) ou de force (kill) au retrait.
 */

use crate::hosts::HostDirectory;
use async_trait::async_trait;
use nimbus_core::messages::HostReply;
use nimbus_core::pool::{HostSpec, ProvisionedHost, Provisioner};
use nimbus_core::transport::{Bus, BusEndpoint, Correlator, MqttSettings};
use nimbus_core::state::{new_state, Shared};
use nimbus_core::{HostId, NimbusError, Result, RuntimeConfig};
use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::{Child, Command};
use tracing::{info, warn};

/// Builds the host command line for one host
#[derive(Debug, Clone)]
pub struct HostLauncher {
    program: String,
    args: Vec<String>,
    mqtt: MqttSettings,
}

impl HostLauncher {
    pub fn parse(command: &str, mqtt: MqttSettings) -> Result<Self> {
        let mut words = shell_words::split(command)
            .map_err(|e| NimbusError::Config(format!("invalid host command {command:?}: {e}")))?
            .into_iter();
        let program = words
            .next()
            .ok_or_else(|| NimbusError::Config("empty host command".into()))?;
        Ok(Self { program, args: words.collect(), mqtt })
    }

    pub fn env(&self, host: HostId, spec: &HostSpec) -> Vec<(String, String)> {
        let mut env = vec![
            ("NIMBUS_HOST_ID".to_string(), host.to_string()),
            ("NIMBUS_MQTT_HOST".to_string(), self.mqtt.host.clone()),
            ("NIMBUS_MQTT_PORT".to_string(), self.mqtt.port.to_string()),
        ];
        for (key, value) in &spec.labels {
            env.push((format!("NIMBUS_LABEL_{}", key.to_ascii_uppercase()), value.clone()));
        }
        env
    }

    fn command(&self, host: HostId, spec: &HostSpec) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .envs(self.env(host, spec))
            .stdin(Stdio::null())
            .kill_on_drop(true);
        cmd
    }
}

pub struct ProcessProvisioner {
    launcher: HostLauncher,
    directory: Arc<HostDirectory>,
    bus: Arc<dyn Bus>,
    replies: Arc<Correlator<HostReply>>,
    config: RuntimeConfig,
    /// How long a host gets to exit on its own after the shutdown command
    shutdown_grace: Duration,
    children: Shared<HashMap<HostId, Child>>,
}

impl ProcessProvisioner {
    pub fn new(
        launcher: HostLauncher,
        directory: Arc<HostDirectory>,
        bus: Arc<dyn Bus>,
        replies: Arc<Correlator<HostReply>>,
        config: RuntimeConfig,
    ) -> Self {
        Self {
            launcher,
            directory,
            bus,
            replies,
            shutdown_grace: config.is_alive_interval() * 2,
            config,
            children: new_state(HashMap::new()),
        }
    }

    /// Kills a host that never came up
    async fn abandon(&self, host: HostId, reason: String) -> NimbusError {
        self.directory.stop_expecting(host);
        let child = self.children.lock().remove(&host);
        if let Some(mut child) = child {
            if let Err(e) = child.kill().await {
                warn!(host = %host, error = %e, "failed to kill host process");
            }
        }
        NimbusError::PoolMutation(format!("host {host} did not come up: {reason}"))
    }
}

#[async_trait]
impl Provisioner for ProcessProvisioner {
    async fn provision(&self, host: HostId, spec: &HostSpec) -> Result<ProvisionedHost> {
        let announced = self.directory.expect_first(host);
        let child = match self.launcher.command(host, spec).spawn() {
            Ok(child) => child,
            Err(e) => {
                self.directory.stop_expecting(host);
                return Err(NimbusError::PoolMutation(format!("failed to start {}: {e}", self.launcher.program)));
            }
        };
        info!(host = %host, pid = ?child.id(), "host process started");
        self.children.lock().insert(host, child);

        let timeout = self.config.host_startup_timeout();
        let announcement = match tokio::time::timeout(timeout, announced).await {
            Ok(Ok(announcement)) => announcement,
            Ok(Err(_)) => return Err(self.abandon(host, "announcement waiter dropped".into()).await),
            Err(_) => return Err(self.abandon(host, format!("no announcement within {timeout:?}")).await),
        };

        Ok(ProvisionedHost {
            address: announcement.address,
            endpoint: Arc::new(BusEndpoint::new(host, self.bus.clone(), self.replies.clone(), &self.config)),
        })
    }

    async fn release(&self, host: HostId) -> Result<()> {
        let child = self.children.lock().remove(&host);
        self.directory.forget(host);
        let Some(mut child) = child else {
            return Ok(());
        };

        match tokio::time::timeout(self.shutdown_grace, child.wait()).await {
            Ok(Ok(status)) => info!(host = %host, %status, "host process exited"),
            Ok(Err(e)) => warn!(host = %host, error = %e, "failed to wait for host process"),
            Err(_) => {
                warn!(host = %host, "host process did not exit, force killing");
                child.kill().await.map_err(|e| NimbusError::PoolMutation(format!("kill of host {host} failed: {e}")))?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_command_is_split_like_a_shell() {
        let launcher = HostLauncher::parse("nimbus-host --log 'debug level'", MqttSettings::default()).unwrap();
        assert_eq!(launcher.program, "nimbus-host");
        assert_eq!(launcher.args, vec!["--log", "debug level"]);

        assert!(HostLauncher::parse("", MqttSettings::default()).is_err());
        assert!(HostLauncher::parse("nimbus-host 'unterminated", MqttSettings::default()).is_err());
    }

    #[test]
    fn host_identity_travels_in_the_environment() {
        let launcher = HostLauncher::parse("nimbus-host", MqttSettings::default()).unwrap();
        let host = HostId::new();
        let mut spec = HostSpec::default();
        spec.labels.insert("zone".into(), "edge".into());

        let env: HashMap<_, _> = launcher.env(host, &spec).into_iter().collect();
        assert_eq!(env["NIMBUS_HOST_ID"], host.to_string());
        assert_eq!(env["NIMBUS_MQTT_PORT"], "1883");
        assert_eq!(env["NIMBUS_LABEL_ZONE"], "edge");
    }
}
