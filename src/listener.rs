//! Listener Supervisor. Binds one accept loop per configured external port,
//! dispatches each accepted connection through the Handshake Classifier to
//! either the Status Responder or the Login Gatekeeper, and restarts the
//! accept loop on recoverable faults (spec.md §4.8). The listener set is
//! static for a given registry snapshot; `reconcile` tears down listeners for
//! removed ports and binds listeners for added ones, leaving unaffected ports
//! untouched.

use std::collections::HashMap;
use std::io::ErrorKind;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio::time::Duration;

use crate::adapter::RuntimeAdapter;
use crate::backend::BackendArena;
use crate::config::{Registry, RegistryLoader};
use crate::error::{GatewayError, Result};
use crate::events::EventLogger;
use crate::handshake::{read_handshake, NextState};
use crate::login::{handle_login, LoginContext};
use crate::notify::NotificationHub;
use crate::status::handle_status;

const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(500);

/// Shared, cloneable handles every per-connection worker needs. One instance
/// is built at startup and threaded through every accept loop.
#[derive(Clone)]
pub struct GatewayShared {
    pub registry: Arc<RegistryLoader>,
    pub backends: Arc<BackendArena>,
    pub adapter: Arc<dyn RuntimeAdapter>,
    pub events: Arc<EventLogger>,
    pub notifications: Arc<NotificationHub>,
    pub stop_grace_seconds: u32,
}

pub struct ListenerSupervisor {
    shared: GatewayShared,
    listeners: HashMap<u16, JoinHandle<()>>,
}

impl ListenerSupervisor {
    pub fn new(shared: GatewayShared) -> Self {
        ListenerSupervisor {
            shared,
            listeners: HashMap::new(),
        }
    }

    /// Bind (or rebind) the listener set to match `registry`. Ports present
    /// in both the old and new set are left running untouched; ports that
    /// disappeared are aborted; new ports are bound. A bind failure
    /// (EADDRINUSE and friends) is fatal per spec.md §4.8 and is returned to
    /// the caller rather than silently dropped.
    pub async fn reconcile(&mut self, registry: &Registry) -> Result<()> {
        let wanted: Vec<u16> = registry.servers.iter().map(|s| s.external_port).collect();

        let to_remove: Vec<u16> = self
            .listeners
            .keys()
            .copied()
            .filter(|p| !wanted.contains(p))
            .collect();
        for port in to_remove {
            if let Some(handle) = self.listeners.remove(&port) {
                handle.abort();
                log::info!("listener on port {port} torn down (removed from registry)");
            }
        }

        for port in wanted {
            if self.listeners.contains_key(&port) {
                continue;
            }
            let listener = TcpListener::bind(("0.0.0.0", port)).await.map_err(|e| {
                GatewayError::RegistryError(format!("bind 0.0.0.0:{port} failed: {e}"))
            })?;
            log::info!("listening on 0.0.0.0:{port}");
            let shared = self.shared.clone();
            let handle = tokio::spawn(accept_loop(listener, port, shared));
            self.listeners.insert(port, handle);
        }

        Ok(())
    }

    pub fn shutdown(&mut self) {
        for (_, handle) in self.listeners.drain() {
            handle.abort();
        }
    }
}

async fn accept_loop(listener: TcpListener, port: u16, shared: GatewayShared) {
    loop {
        match listener.accept().await {
            Ok((socket, peer)) => {
                log::debug!("accepted connection from {peer} on port {port}");
                let shared = shared.clone();
                tokio::spawn(async move {
                    handle_connection(socket, port, shared).await;
                });
            }
            Err(e) if is_transient(&e) => {
                log::warn!("accept on port {port} failed transiently: {e}; retrying");
                tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
            }
            Err(e) => {
                log::error!("accept on port {port} failed fatally: {e}");
                return;
            }
        }
    }
}

fn is_transient(e: &std::io::Error) -> bool {
    matches!(
        e.kind(),
        ErrorKind::WouldBlock | ErrorKind::Interrupted | ErrorKind::ConnectionAborted
    ) || e.raw_os_error() == Some(24) // EMFILE
}

async fn handle_connection(mut socket: TcpStream, accept_port: u16, shared: GatewayShared) {
    let (handshake, raw_handshake) = match read_handshake(&mut socket).await {
        Ok(Some(v)) => v,
        Ok(None) => return,
        Err(GatewayError::ClientTimeout) => {
            log::debug!("handshake read timed out on port {accept_port}");
            return;
        }
        Err(e) => {
            log::debug!("handshake read failed on port {accept_port}: {e}");
            return;
        }
    };

    let registry = shared.registry.snapshot();
    let Some(server) = registry.find_by_external_port(accept_port).cloned() else {
        // Only arises if a reload removed this port's entry between bind
        // and accept; the listener itself is about to be torn down too.
        log::warn!("connection on port {accept_port} with no matching registry entry");
        if handshake.next_state == NextState::Login {
            let _ = crate::login::send_disconnect_standalone(
                &mut socket,
                crate::error::DisconnectReason::NoServerConfigured,
            )
            .await;
        }
        return;
    };

    let backend = shared
        .backends
        .get_or_create(&server.container_name, server.external_port, server.internal_port);

    match handshake.next_state {
        NextState::Status => {
            if let Err(e) = handle_status(
                &mut socket,
                &handshake,
                &raw_handshake,
                &server,
                &backend,
                &shared.adapter,
            )
            .await
            {
                log::debug!("status exchange on port {accept_port} failed: {e}");
            }
        }
        NextState::Login => {
            let ctx = LoginContext {
                idle_timeout: Duration::from_secs(u64::from(registry.idle_timeout_minutes) * 60),
                idle_shutdown_enabled: registry.idle_shutdown_enabled(),
                stop_grace_seconds: shared.stop_grace_seconds,
            };
            handle_login(
                socket,
                &raw_handshake,
                &server,
                backend,
                shared.adapter.clone(),
                shared.events.clone(),
                shared.notifications.load(),
                ctx,
            )
            .await;
        }
    }
}
