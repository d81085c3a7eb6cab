//! Gateway daemon entry point. Configuration is two environment variables
//! per spec.md §6 — no CLI flags: `MCGATEWAY_REGISTRY` (path to the JSON
//! registry file) and `MCGATEWAY_LOG_DIR` (directory for the daily usage
//! log). `RUST_LOG` controls log verbosity through `env_logger`, matching
//! the teacher's own bootstrap.

use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::signal::unix::{signal, SignalKind};

use mc_gateway::adapter::{DockerCliAdapter, RuntimeAdapter};
use mc_gateway::backend::BackendArena;
use mc_gateway::config::RegistryLoader;
use mc_gateway::events::EventLogger;
use mc_gateway::listener::{GatewayShared, ListenerSupervisor};
use mc_gateway::notify::{NotificationFanout, NotificationHub};

/// Backend `stop` calls are given this much time to shut down gracefully
/// before the runtime adapter is allowed to force-kill, mirroring `docker
/// stop`'s own `-t` grace window.
const STOP_GRACE_SECONDS: u32 = 30;

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Info)
        .init();

    let registry_path = std::env::var("MCGATEWAY_REGISTRY")
        .context("MCGATEWAY_REGISTRY environment variable is required")?;
    let log_dir = std::env::var("MCGATEWAY_LOG_DIR")
        .context("MCGATEWAY_LOG_DIR environment variable is required")?;

    let registry = Arc::new(
        RegistryLoader::load(&registry_path)
            .await
            .with_context(|| format!("failed to load registry from {registry_path}"))?,
    );

    let snapshot = registry.snapshot();
    let notifications = Arc::new(NotificationHub::new(NotificationFanout::from_config(
        snapshot.notifications.email.clone(),
        snapshot.notifications.push.clone(),
    )));

    let shared = GatewayShared {
        registry: registry.clone(),
        backends: Arc::new(BackendArena::new()),
        adapter: Arc::new(DockerCliAdapter::new()) as Arc<dyn RuntimeAdapter>,
        events: Arc::new(EventLogger::new(log_dir)),
        notifications,
        stop_grace_seconds: STOP_GRACE_SECONDS,
    };

    let mut supervisor = ListenerSupervisor::new(shared.clone());
    supervisor
        .reconcile(&snapshot)
        .await
        .context("failed to bind configured listener ports")?;
    log::info!("gateway up, {} server(s) configured", snapshot.servers.len());

    let mut sighup = signal(SignalKind::hangup())?;
    let mut sigterm = signal(SignalKind::terminate())?;

    loop {
        tokio::select! {
            _ = sighup.recv() => {
                log::info!("SIGHUP received, reloading registry");
                match registry.reload().await {
                    Ok(new_snapshot) => {
                        if let Err(e) = supervisor.reconcile(&new_snapshot).await {
                            log::error!("listener reconciliation failed after reload: {e}");
                        }
                        shared.notifications.publish(NotificationFanout::from_config(
                            new_snapshot.notifications.email.clone(),
                            new_snapshot.notifications.push.clone(),
                        ));
                    }
                    Err(e) => log::warn!("registry reload failed, keeping prior snapshot: {e}"),
                }
            }
            _ = sigterm.recv() => {
                log::info!("SIGTERM received, shutting down");
                break;
            }
            _ = tokio::signal::ctrl_c() => {
                log::info!("SIGINT received, shutting down");
                break;
            }
        }
    }

    supervisor.shutdown();
    Ok(())
}
