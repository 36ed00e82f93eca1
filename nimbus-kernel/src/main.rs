/**
 * NIMBUS KERNEL - Point d'entrée de l'orchestrateur
 *
 * RÔLE : Bootstrap complet : config, MQTT, pools de hosts, politique de scaling,
 * service du code aux hosts, suivi de liveness, sweeps périodiques et API HTTP.
 *
 * ARCHITECTURE : les hosts parlent au kernel via MQTT ; le runtime (pool +
 * politique + collecteur de résultats) est construit une fois et partagé.
 */

mod config;
mod hosts;
mod http;
mod mqtt;
mod provisioning;

use crate::config::{load_config, KernelConfig, PoolConf, ProvisionerConf};
use crate::hosts::HostDirectory;
use crate::http::AppState;
use crate::provisioning::{HostLauncher, ProcessProvisioner};
use anyhow::{Context, Result};
use nimbus_core::messages::HostReply;
use nimbus_core::pool::{InProcessProvisioner, Provisioner};
use nimbus_core::transport::{Bus, BusEndpoint, Correlator, KernelInbox, MqttBus};
use nimbus_core::{AggregatedHostPool, CloudRuntime, CodeProvider, CodeSource, HostPool, ResultCollector, VirtualHostPool};
use nimbus_host::catalog::{sample_catalog, sample_code};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Everything a pool needs to reach or start its hosts
struct PoolWiring {
    bus: Arc<dyn Bus>,
    replies: Arc<Correlator<HostReply>>,
    collector: Arc<ResultCollector>,
    code: Arc<dyn CodeSource>,
    directory: Arc<HostDirectory>,
}

fn load_code(cfg: &KernelConfig) -> Result<CodeProvider> {
    let mut provider = sample_code();
    if let Some(dir) = &cfg.code.artifact_dir {
        let loaded = provider
            .load_dir(dir)
            .with_context(|| format!("failed to load artifacts from {}", dir.display()))?;
        info!(loaded, dir = %dir.display(), "code artifacts loaded");
    }
    for (type_name, archive) in &cfg.code.archives {
        provider
            .map_type_to_archive(type_name, archive)
            .with_context(|| format!("cannot map {type_name} to {archive}"))?;
    }
    Ok(provider)
}

fn build_pool(cfg: &KernelConfig, pool: &PoolConf, wiring: &PoolWiring) -> Result<Arc<VirtualHostPool>> {
    let provisioner: Arc<dyn Provisioner> = match &pool.provisioner {
        ProvisionerConf::InProcess => Arc::new(InProcessProvisioner::new(
            sample_catalog(),
            wiring.code.clone(),
            wiring.collector.clone(),
            cfg.runtime.clone(),
            cfg.scratch_dir().join(&pool.name),
        )),
        ProvisionerConf::Process { command } => Arc::new(ProcessProvisioner::new(
            HostLauncher::parse(command, cfg.mqtt.clone())?,
            wiring.directory.clone(),
            wiring.bus.clone(),
            wiring.replies.clone(),
            cfg.runtime.clone(),
        )),
    };

    let virtual_pool = VirtualHostPool::new(
        pool.name.clone(),
        provisioner,
        cfg.runtime.host_startup_timeout(),
        pool.max_hosts,
    );
    for host in &pool.static_hosts {
        let endpoint = Arc::new(BusEndpoint::new(host.host_id, wiring.bus.clone(), wiring.replies.clone(), &cfg.runtime));
        virtual_pool.add_static_host_with_id(host.host_id, host.address.clone(), endpoint);
    }
    info!(pool = %pool.name, provisioner = ?pool.provisioner, max_hosts = ?pool.max_hosts, "pool ready");
    Ok(Arc::new(virtual_pool))
}

fn build_pools(cfg: &KernelConfig, wiring: &PoolWiring) -> Result<Arc<dyn HostPool>> {
    let mut pools: Vec<Arc<dyn HostPool>> = Vec::new();
    for pool in cfg.pools() {
        pools.push(build_pool(cfg, &pool, wiring)?);
    }
    if pools.len() == 1 {
        if let Some(pool) = pools.pop() {
            return Ok(pool);
        }
    }
    Ok(Arc::new(AggregatedHostPool::new("cluster", pools, cfg.runtime.host_startup_timeout())))
}

#[tokio::main]
async fn main() -> Result<()> {
    // Charger les variables d'environnement depuis .env (si présent)
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cfg = load_config().await;
    let code: Arc<dyn CodeSource> = Arc::new(load_code(&cfg)?);

    let (mqtt, eventloop) = MqttBus::connect("nimbus-kernel", &cfg.mqtt);
    let bus: Arc<dyn Bus> = Arc::new(mqtt.clone());
    let replies = Arc::new(Correlator::default());
    let collector = Arc::new(ResultCollector::default());
    let directory = Arc::new(HostDirectory::new());

    let wiring = PoolWiring {
        bus: bus.clone(),
        replies: replies.clone(),
        collector: collector.clone(),
        code: code.clone(),
        directory: directory.clone(),
    };
    let pool = build_pools(&cfg, &wiring).context("failed to build host pools")?;
    let runtime = Arc::new(CloudRuntime::new(pool, cfg.policy.build(), collector.clone(), cfg.runtime.clone()));

    // MQTT : réponses, résultats, console, requêtes de code, annonces, métriques
    let inbox = Arc::new(KernelInbox::new(replies, collector, code, bus));
    mqtt::spawn_mqtt_listener(mqtt, eventloop, inbox, directory.clone(), runtime.clone());

    CloudRuntime::spawn_scale_down_sweep(runtime.clone());
    CloudRuntime::spawn_keep_alive_sender(runtime.clone());
    HostDirectory::spawn_liveness_monitor(
        directory.clone(),
        runtime.clone(),
        cfg.runtime.is_alive_interval(),
        cfg.runtime.host_timeout(),
    );

    let app = http::build_router(AppState { runtime: runtime.clone(), directory });
    let addr: SocketAddr = cfg.http.bind.parse().with_context(|| format!("invalid http bind {}", cfg.http.bind))?;
    let listener = TcpListener::bind(addr).await.with_context(|| format!("failed to bind {addr}"))?;
    info!("listening on http://{addr}");

    let server = axum::serve(listener, app).with_graceful_shutdown(async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("failed to listen for ctrl-c: {e}");
        }
    });
    server.await.context("http server failed")?;

    runtime.shutdown().await;
    Ok(())
}
