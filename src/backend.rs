//! Backend Lifecycle Controller & Connection Tracker / Idle Scheduler.
//!
//! Per DESIGN NOTES §9, the backend record is modeled as a single
//! addressable entity — one `Backend` per `container_name`, held in a
//! `DashMap`-backed arena — rather than a web of cross-referencing objects.
//! The tracker, the idle timer, and the lifecycle state machine all operate
//! on that one entity through its own lock (spec.md §3 invariant 3).

use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tokio::time::{Duration, Instant};

use crate::adapter::{ContainerStatus, RuntimeAdapter, probe_readiness};
use crate::error::GatewayError;
use crate::events::{EventLogger, UsageEvent};
use crate::notify::NotificationFanout;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Stopped,
    Starting,
    Running,
    Stopping,
}

struct BackendState {
    phase: Phase,
    active_connections: u32,
    shutdown_deadline: Option<Instant>,
    manual_override: bool,
    timer: Option<JoinHandle<()>>,
}

impl BackendState {
    fn cancel_timer(&mut self) {
        if let Some(handle) = self.timer.take() {
            handle.abort();
        }
        self.shutdown_deadline = None;
    }
}

/// One addressable entity per managed backend, keyed by `container_name`.
pub struct Backend {
    pub container_name: String,
    pub external_port: u16,
    pub internal_port: u16,
    state: Mutex<BackendState>,
    /// Signaled whenever `phase` leaves `Starting`, so concurrent logins
    /// arriving mid-start can wait instead of triggering duplicate starts.
    starting_changed: Notify,
}

impl Backend {
    fn new(container_name: String, external_port: u16, internal_port: u16) -> Self {
        Backend {
            container_name,
            external_port,
            internal_port,
            state: Mutex::new(BackendState {
                phase: Phase::Stopped,
                active_connections: 0,
                shutdown_deadline: None,
                manual_override: false,
                timer: None,
            }),
            starting_changed: Notify::new(),
        }
    }

    pub async fn phase(&self) -> Phase {
        self.state.lock().await.phase
    }

    pub async fn active_connections(&self) -> u32 {
        self.state.lock().await.active_connections
    }

    /// Reconcile our belief about `phase` with the adapter's ground truth.
    /// Per spec.md §4.4 step 2: an adapter reporting running while we
    /// think we're stopped means an out-of-band (manual) start happened;
    /// an adapter reporting not-running while we think we're running means
    /// an out-of-band stop happened.
    pub async fn reconcile(&self, adapter: &dyn RuntimeAdapter) {
        let status = adapter.status(&self.container_name).await;
        let mut state = self.state.lock().await;
        match status {
            Ok(ContainerStatus::Running) if state.phase == Phase::Stopped => {
                state.phase = Phase::Running;
                state.manual_override = true;
                log::info!(
                    "{}: adapter reports running while stopped — promoting (manual start)",
                    self.container_name
                );
            }
            Ok(ContainerStatus::Stopped) | Ok(ContainerStatus::Absent)
                if state.phase == Phase::Running =>
            {
                state.phase = Phase::Stopped;
                state.manual_override = false;
                state.cancel_timer();
                log::info!(
                    "{}: adapter reports not running while running — demoting",
                    self.container_name
                );
            }
            _ => {}
        }
    }

    /// Is the backend already running, after reconciling? Used by the
    /// Status Responder, which must never itself start anything.
    pub async fn is_running(&self, adapter: &dyn RuntimeAdapter) -> bool {
        self.reconcile(adapter).await;
        self.state.lock().await.phase == Phase::Running
    }

    /// Drives `stopped -> starting -> running` (or back to `stopped` on
    /// failure), waiting out an in-flight start from another login if one
    /// is already underway. Emits the `server_start` event/notification on
    /// success, exactly once per successful cold start.
    pub async fn ensure_running(
        self: &Arc<Self>,
        adapter: &Arc<dyn RuntimeAdapter>,
        server_name: &str,
        readiness_timeout: Duration,
        per_attempt_timeout: Duration,
        poll_interval: Duration,
        events: &Arc<EventLogger>,
        notifications: &Arc<NotificationFanout>,
    ) -> Result<(), GatewayError> {
        self.reconcile(adapter.as_ref()).await;

        loop {
            let mut guard = self.state.lock().await;
            match guard.phase {
                Phase::Running => return Ok(()),
                Phase::Stopping => {
                    return Err(GatewayError::BackendUnavailable(
                        "backend is stopping".into(),
                    ));
                }
                Phase::Starting => {
                    // Register interest in the next phase change before
                    // releasing the lock, to avoid a missed-wakeup race
                    // against a start that finishes between our phase
                    // check and the await below.
                    let notified = self.starting_changed.notified();
                    tokio::pin!(notified);
                    notified.as_mut().enable();
                    drop(guard);

                    if tokio::time::timeout(readiness_timeout, notified)
                        .await
                        .is_err()
                    {
                        return Err(GatewayError::BackendUnavailable(
                            "timed out waiting for in-flight start".into(),
                        ));
                    }
                    // Loop back around and re-check the (now settled) phase.
                    continue;
                }
                Phase::Stopped => {
                    guard.phase = Phase::Starting;
                    drop(guard);

                    if let Err(e) = adapter.start(&self.container_name).await {
                        let mut guard = self.state.lock().await;
                        guard.phase = Phase::Stopped;
                        drop(guard);
                        self.starting_changed.notify_waiters();
                        return Err(GatewayError::BackendUnavailable(format!(
                            "start failed: {e}"
                        )));
                    }

                    let ready = probe_readiness(
                        adapter.as_ref(),
                        &self.container_name,
                        self.internal_port,
                        readiness_timeout,
                        per_attempt_timeout,
                        poll_interval,
                    )
                    .await;

                    let mut guard = self.state.lock().await;
                    if ready {
                        guard.phase = Phase::Running;
                        drop(guard);
                        self.starting_changed.notify_waiters();

                        events
                            .log(UsageEvent::ServerStart {
                                external_port: self.external_port,
                                server_name: server_name.to_string(),
                            })
                            .await;
                        notifications.notify(&UsageEvent::ServerStart {
                            external_port: self.external_port,
                            server_name: server_name.to_string(),
                        });
                        return Ok(());
                    } else {
                        guard.phase = Phase::Stopped;
                        drop(guard);
                        self.starting_changed.notify_waiters();
                        return Err(GatewayError::BackendUnavailable(
                            "readiness probe timed out".into(),
                        ));
                    }
                }
            }
        }
    }

    /// Connection Tracker increment path (spec.md §4.6): bump the active
    /// count and cancel any armed idle timer.
    pub async fn increment_connections(&self) -> u32 {
        let mut guard = self.state.lock().await;
        guard.active_connections += 1;
        if guard.shutdown_deadline.is_some() {
            guard.cancel_timer();
        }
        guard.active_connections
    }

    /// Connection Tracker decrement path. Arms the idle timer exactly when
    /// the count drops to zero and the backend is eligible for idle
    /// shutdown; otherwise a no-op beyond the decrement itself.
    pub async fn decrement_connections(
        self: &Arc<Self>,
        idle_shutdown_enabled: bool,
        idle_timeout: Duration,
        grace_seconds: u32,
        adapter: Arc<dyn RuntimeAdapter>,
        server_name: Arc<str>,
        events: Arc<EventLogger>,
        notifications: Arc<NotificationFanout>,
    ) -> u32 {
        let mut guard = self.state.lock().await;
        if guard.active_connections == 0 {
            log::error!(
                "{}: decrement_connections called at zero — programming error",
                self.container_name
            );
        } else {
            guard.active_connections -= 1;
        }

        let count = guard.active_connections;
        if count == 0 && idle_shutdown_enabled && guard.phase == Phase::Running && !guard.manual_override {
            let deadline = Instant::now() + idle_timeout;
            guard.shutdown_deadline = Some(deadline);

            let backend = self.clone();
            let handle = tokio::spawn(async move {
                tokio::time::sleep_until(deadline).await;
                backend
                    .fire_idle_timer(adapter, server_name, events, notifications, grace_seconds)
                    .await;
            });
            if let Some(old) = guard.timer.replace(handle) {
                old.abort();
            }
        }
        count
    }

    /// Idle shutdown timer callback (spec.md §4.6). Re-checks state after
    /// re-acquiring the lock so a login that raced the timer and already
    /// incremented `active_connections` (or a reconcile that already
    /// demoted the phase) is respected instead of stopping a backend a
    /// player just joined.
    async fn fire_idle_timer(
        self: Arc<Self>,
        adapter: Arc<dyn RuntimeAdapter>,
        server_name: Arc<str>,
        events: Arc<EventLogger>,
        notifications: Arc<NotificationFanout>,
        grace_seconds: u32,
    ) {
        {
            let mut guard = self.state.lock().await;
            if guard.phase != Phase::Running || guard.active_connections > 0 {
                return;
            }
            guard.phase = Phase::Stopping;
            guard.shutdown_deadline = None;
        }

        match adapter.stop(&self.container_name, grace_seconds).await {
            Ok(()) => {
                {
                    let mut guard = self.state.lock().await;
                    guard.phase = Phase::Stopped;
                    guard.manual_override = false;
                    guard.timer = None;
                }
                events
                    .log(UsageEvent::ServerStop {
                        external_port: self.external_port,
                        server_name: server_name.to_string(),
                        reason: "idle_timeout".to_string(),
                    })
                    .await;
                notifications.notify(&UsageEvent::ServerStop {
                    external_port: self.external_port,
                    server_name: server_name.to_string(),
                    reason: "idle_timeout".to_string(),
                });
            }
            Err(e) => {
                // AdapterError during an idle stop (spec.md §7): revert to
                // running and disarm the timer; the next decrement re-arms.
                let mut guard = self.state.lock().await;
                guard.phase = Phase::Running;
                guard.timer = None;
                log::error!("{}: idle stop failed: {e}", self.container_name);
            }
        }
    }
}

/// Per-backend arena keyed by `container_name`, the only cross-worker
/// mutable state in the gateway besides the registry snapshot and the
/// usage-log handle.
#[derive(Default)]
pub struct BackendArena {
    backends: DashMap<String, Arc<Backend>>,
}

impl BackendArena {
    pub fn new() -> Self {
        BackendArena {
            backends: DashMap::new(),
        }
    }

    pub fn get_or_create(
        &self,
        container_name: &str,
        external_port: u16,
        internal_port: u16,
    ) -> Arc<Backend> {
        self.backends
            .entry(container_name.to_string())
            .or_insert_with(|| {
                Arc::new(Backend::new(
                    container_name.to_string(),
                    external_port,
                    internal_port,
                ))
            })
            .clone()
    }

    pub fn get(&self, container_name: &str) -> Option<Arc<Backend>> {
        self.backends.get(container_name).map(|e| e.clone())
    }
}
