use std::{
    collections::HashMap,
    future::Future,
    io,
    pin::Pin,
    sync::Arc,
    time::{Duration, Instant},
};

use futures_util::future::join_all;
use router::{RouterError, RouterState, StickyRouter};
use sandbox::{SandboxError, SandboxManager};
use thiserror::Error;
use tokio::{
    process::Child,
    sync::{Mutex, broadcast, mpsc, oneshot},
    time,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use types::{
    IpcError, MessageSink, MessageSource, PoolSettings, PoolStatus, SupervisorChannel,
    SupervisorEnvelope, SupervisorMessage, WorkerConfig, WorkerEnvelope, WorkerEvent,
    WorkerHealth, WorkerMessage, WorkerRequest, WorkerResponse, WorkerState, epoch_ms,
};

mod env;
mod launcher;
mod restart;

pub use env::{filter_env, filtered_parent_env, is_sensitive_env};
pub use launcher::{
    InProcessLauncher, LaunchRequest, LaunchedWorker, ProcessLauncher, WORKER_EXECUTABLE_ENV_KEY,
    WorkerLauncher,
};
pub use restart::RestartWindow;

const READY_POLL_INTERVAL: Duration = Duration::from_millis(100);
const STOP_POLL_INTERVAL: Duration = Duration::from_millis(100);
const STOP_KILL_MARGIN_MS: u64 = 1_000;
const IPC_SOCKET_FILE: &str = "ipc.sock";

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("worker pool has not been started")]
    PoolNotStarted,
    #[error("worker pool is already started")]
    PoolAlreadyStarted,
    #[error("worker `{worker_id}` did not become ready within {timeout_ms}ms")]
    WorkerStartupTimeout { worker_id: String, timeout_ms: u64 },
    #[error("worker `{worker_id}` crashed during startup")]
    WorkerStartupFailure { worker_id: String },
    #[error("request `{request_id}` timed out after {timeout_ms}ms")]
    RequestTimeout { request_id: String, timeout_ms: u64 },
    #[error("worker `{worker_id}` exited before responding")]
    WorkerExited { worker_id: String },
    #[error("no healthy workers are available")]
    NoHealthyWorkers,
    #[error("{error}")]
    RequestFailed {
        error: String,
        error_code: Option<String>,
    },
    #[error("failed to launch worker `{worker_id}`: {source}")]
    Launch {
        worker_id: String,
        #[source]
        source: io::Error,
    },
    #[error(transparent)]
    Router(#[from] RouterError),
    #[error(transparent)]
    Sandbox(#[from] SandboxError),
    #[error(transparent)]
    Ipc(#[from] IpcError),
}

/// Observable pool lifecycle notifications, broadcast to any subscriber.
#[derive(Debug, Clone)]
pub enum PoolEvent {
    WorkerReady {
        worker_id: String,
    },
    WorkerCrash {
        worker_id: String,
        error: String,
    },
    WorkerRestart {
        worker_id: String,
        attempt: u32,
    },
    WorkerStopped {
        worker_id: String,
    },
    RequestComplete {
        request_id: String,
        duration_ms: u64,
    },
    RequestFailed {
        request_id: String,
        error: String,
    },
    PoolReady,
    PoolDegraded {
        healthy: usize,
        total: usize,
    },
}

/// A completed dispatch: which slot served it and what came back.
#[derive(Debug, Clone)]
pub struct DispatchedResponse {
    pub worker_id: String,
    pub response: WorkerResponse,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PoolLifecycle {
    Idle,
    Running,
    Stopping,
    Stopped,
}

struct WorkerSlot {
    worker_id: String,
    state: WorkerState,
    health: Option<WorkerHealth>,
    config: Option<WorkerConfig>,
    outbound: Option<mpsc::UnboundedSender<SupervisorEnvelope>>,
    child: Option<Child>,
    pid: Option<u32>,
    cancel: CancellationToken,
    restart_count: u32,
    restart_times: RestartWindow,
    pending: HashMap<String, oneshot::Sender<Result<WorkerResponse, PoolError>>>,
    /// Bumped on every spawn so exit notifications from a replaced process
    /// cannot be mistaken for the current one.
    epoch: u64,
}

impl WorkerSlot {
    fn new(worker_id: String) -> Self {
        Self {
            worker_id,
            state: WorkerState::Stopped,
            health: None,
            config: None,
            outbound: None,
            child: None,
            pid: None,
            cancel: CancellationToken::new(),
            restart_count: 0,
            restart_times: RestartWindow::default(),
            pending: HashMap::new(),
            epoch: 0,
        }
    }
}

struct PoolInner {
    lifecycle: PoolLifecycle,
    router: StickyRouter,
    workers: HashMap<String, WorkerSlot>,
}

struct PoolShared {
    settings: PoolSettings,
    launcher: Arc<dyn WorkerLauncher>,
    sandboxes: SandboxManager,
    inner: Mutex<PoolInner>,
    events: broadcast::Sender<PoolEvent>,
}

impl PoolShared {
    fn emit(&self, event: PoolEvent) {
        let _ = self.events.send(event);
    }
}

/// The supervisor: owns `worker_count` slots named `worker-<i>`, routes
/// per-user requests stickily across them and keeps the fleet alive under
/// the sliding-window restart policy. All slot and router state is mutated
/// under one mutex, the moral equivalent of a single control thread.
#[derive(Clone)]
pub struct WorkerPool {
    shared: Arc<PoolShared>,
}

impl WorkerPool {
    pub fn new(settings: PoolSettings) -> Self {
        Self::with_launcher(settings, Arc::new(ProcessLauncher::new()))
    }

    pub fn with_launcher(settings: PoolSettings, launcher: Arc<dyn WorkerLauncher>) -> Self {
        let sandboxes = SandboxManager::new(settings.sandbox_base_dir.clone());
        let router = StickyRouter::new(settings.virtual_nodes);
        let (events, _) = broadcast::channel(256);
        Self {
            shared: Arc::new(PoolShared {
                settings,
                launcher,
                sandboxes,
                inner: Mutex::new(PoolInner {
                    lifecycle: PoolLifecycle::Idle,
                    router,
                    workers: HashMap::new(),
                }),
                events,
            }),
        }
    }

    pub fn settings(&self) -> &PoolSettings {
        &self.shared.settings
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PoolEvent> {
        self.shared.events.subscribe()
    }

    /// Bring every slot up. Resolves once all workers report `Ready`; a slot
    /// that fails to start surfaces its startup error.
    pub async fn start(&self) -> Result<(), PoolError> {
        let worker_ids: Vec<String> = {
            let mut inner = self.shared.inner.lock().await;
            if matches!(
                inner.lifecycle,
                PoolLifecycle::Running | PoolLifecycle::Stopping
            ) {
                return Err(PoolError::PoolAlreadyStarted);
            }
            self.shared.sandboxes.ensure_base()?;

            let worker_ids: Vec<String> = (0..self.shared.settings.worker_count)
                .map(|index| format!("worker-{index}"))
                .collect();
            for worker_id in &worker_ids {
                inner.router.add_worker(worker_id.clone());
                inner
                    .workers
                    .entry(worker_id.clone())
                    .or_insert_with(|| WorkerSlot::new(worker_id.clone()));
            }
            inner.lifecycle = PoolLifecycle::Running;
            worker_ids
        };

        info!(workers = worker_ids.len(), "starting worker pool");
        let spawns = worker_ids.iter().map(|worker_id| {
            let shared = Arc::clone(&self.shared);
            let worker_id = worker_id.clone();
            tokio::spawn(async move { spawn_worker(shared, worker_id).await })
        });
        for joined in join_all(spawns).await {
            match joined {
                Ok(Ok(())) => {}
                Ok(Err(error)) => return Err(error),
                Err(join_error) => {
                    return Err(PoolError::Launch {
                        worker_id: "unknown".to_owned(),
                        source: io::Error::other(join_error),
                    });
                }
            }
        }

        self.shared.emit(PoolEvent::PoolReady);
        info!("worker pool ready");
        Ok(())
    }

    /// Sticky dispatch. Routes by user id, falls back to any healthy worker
    /// (re-pinning the user there) when the assigned slot is down, and
    /// correlates the response by request id under a timeout.
    pub async fn send_request(
        &self,
        mut request: WorkerRequest,
    ) -> Result<DispatchedResponse, PoolError> {
        if request.request_id.is_empty() {
            request.request_id = uuid::Uuid::new_v4().to_string();
        }
        let request_id = request.request_id.clone();

        let (worker_id, receiver, timeout_ms) = {
            let mut inner = self.shared.inner.lock().await;
            if inner.lifecycle != PoolLifecycle::Running {
                return Err(PoolError::PoolNotStarted);
            }

            let decision = inner.router.route(&request.user_id)?;
            let mut target = decision.worker_id;
            let assigned_healthy = inner
                .workers
                .get(&target)
                .is_some_and(|slot| slot.state.is_healthy());
            if !assigned_healthy {
                let fallback = inner
                    .workers
                    .values()
                    .filter(|slot| slot.state.is_healthy())
                    .map(|slot| slot.worker_id.clone())
                    .min();
                let Some(fallback_id) = fallback else {
                    return Err(PoolError::NoHealthyWorkers);
                };
                inner.router.force_assign(&request.user_id, &fallback_id)?;
                info!(
                    user_id = %request.user_id,
                    from = %target,
                    to = %fallback_id,
                    "rerouted user away from unavailable worker"
                );
                target = fallback_id;
            }

            let settings_timeout = self.shared.settings.request_timeout_ms;
            let slot = inner
                .workers
                .get_mut(&target)
                .ok_or(PoolError::NoHealthyWorkers)?;
            let timeout_ms = request.timeout_ms.unwrap_or_else(|| {
                slot.config
                    .as_ref()
                    .map(|config| config.request_timeout_ms)
                    .unwrap_or(settings_timeout)
            });
            let Some(outbound) = slot.outbound.clone() else {
                return Err(PoolError::WorkerExited {
                    worker_id: target.clone(),
                });
            };

            let (sender, receiver) = oneshot::channel();
            slot.pending.insert(request_id.clone(), sender);
            let envelope = SupervisorEnvelope::now(SupervisorMessage::Request {
                request: request.clone(),
            });
            if outbound.send(envelope).is_err() {
                slot.pending.remove(&request_id);
                return Err(PoolError::WorkerExited {
                    worker_id: target.clone(),
                });
            }
            (target, receiver, timeout_ms)
        };

        match time::timeout(Duration::from_millis(timeout_ms), receiver).await {
            Ok(Ok(Ok(response))) => {
                if response.success {
                    self.shared.emit(PoolEvent::RequestComplete {
                        request_id,
                        duration_ms: response.duration_ms,
                    });
                    Ok(DispatchedResponse {
                        worker_id,
                        response,
                    })
                } else {
                    let error = response
                        .error
                        .clone()
                        .unwrap_or_else(|| "request failed".to_owned());
                    self.shared.emit(PoolEvent::RequestFailed {
                        request_id,
                        error: error.clone(),
                    });
                    Err(PoolError::RequestFailed {
                        error,
                        error_code: response.error_code,
                    })
                }
            }
            Ok(Ok(Err(error))) => {
                self.shared.emit(PoolEvent::RequestFailed {
                    request_id,
                    error: error.to_string(),
                });
                Err(error)
            }
            Ok(Err(_closed)) => {
                let error = PoolError::WorkerExited {
                    worker_id: worker_id.clone(),
                };
                self.shared.emit(PoolEvent::RequestFailed {
                    request_id,
                    error: error.to_string(),
                });
                Err(error)
            }
            Err(_elapsed) => {
                {
                    let mut inner = self.shared.inner.lock().await;
                    if let Some(slot) = inner.workers.get_mut(&worker_id) {
                        slot.pending.remove(&request_id);
                    }
                }
                self.shared.emit(PoolEvent::RequestFailed {
                    request_id: request_id.clone(),
                    error: "request timed out".to_owned(),
                });
                Err(PoolError::RequestTimeout {
                    request_id,
                    timeout_ms,
                })
            }
        }
    }

    /// The worker currently serving `user_id`: the cached assignment when
    /// present, otherwise a non-caching ring lookup.
    pub async fn worker_for_user(&self, user_id: &str) -> Option<String> {
        let inner = self.shared.inner.lock().await;
        inner
            .router
            .assigned_worker(user_id)
            .map(str::to_owned)
            .or_else(|| inner.router.peek(user_id))
    }

    /// Force-kill one worker slot. The exit flows through the normal exit
    /// handling, so the restart policy decides what happens next.
    pub async fn kill_worker(&self, worker_id: &str) -> Result<(), PoolError> {
        let mut inner = self.shared.inner.lock().await;
        let slot = inner
            .workers
            .get_mut(worker_id)
            .ok_or_else(|| RouterError::UnknownWorker {
                worker_id: worker_id.to_owned(),
            })?;
        info!(worker_id = %worker_id, "killing worker");
        if let Some(child) = slot.child.as_mut() {
            let _ = child.start_kill();
        }
        if let Some(outbound) = &slot.outbound {
            let _ = outbound.send(SupervisorEnvelope::now(SupervisorMessage::Kill));
        }
        slot.cancel.cancel();
        Ok(())
    }

    /// Graceful stop: ask every worker to drain within the grace period,
    /// then kill whatever is still alive one second past it.
    pub async fn stop(&self, grace_period_ms: Option<u64>) -> Result<(), PoolError> {
        let grace = grace_period_ms.unwrap_or(self.shared.settings.shutdown_grace_ms);
        {
            let mut inner = self.shared.inner.lock().await;
            if inner.lifecycle != PoolLifecycle::Running {
                return Ok(());
            }
            inner.lifecycle = PoolLifecycle::Stopping;
            for slot in inner.workers.values() {
                if let Some(outbound) = &slot.outbound {
                    let _ = outbound.send(SupervisorEnvelope::now(SupervisorMessage::Shutdown {
                        grace_period_ms: grace,
                    }));
                }
            }
        }
        info!(grace_period_ms = grace, "stopping worker pool");

        let deadline = Instant::now() + Duration::from_millis(grace + STOP_KILL_MARGIN_MS);
        loop {
            let all_down = {
                let inner = self.shared.inner.lock().await;
                inner.workers.values().all(|slot| {
                    slot.outbound.is_none()
                        || matches!(slot.state, WorkerState::Stopped | WorkerState::Crashed)
                })
            };
            if all_down || Instant::now() >= deadline {
                break;
            }
            time::sleep(STOP_POLL_INTERVAL).await;
        }

        let mut inner = self.shared.inner.lock().await;
        for slot in inner.workers.values_mut() {
            if let Some(child) = slot.child.as_mut() {
                let _ = child.start_kill();
            }
            slot.cancel.cancel();
            for (_, resolver) in slot.pending.drain() {
                let _ = resolver.send(Err(PoolError::WorkerExited {
                    worker_id: slot.worker_id.clone(),
                }));
            }
            slot.outbound = None;
        }
        inner.workers.clear();
        inner.lifecycle = PoolLifecycle::Stopped;
        info!("worker pool stopped");
        Ok(())
    }

    /// Aggregate status snapshot. Slots that have never reported health get
    /// a placeholder entry so the worker list is always complete.
    pub async fn status(&self) -> PoolStatus {
        let inner = self.shared.inner.lock().await;
        let mut workers: Vec<WorkerHealth> = inner
            .workers
            .values()
            .map(|slot| {
                slot.health
                    .clone()
                    .map(|mut health| {
                        health.state = slot.state;
                        health
                    })
                    .unwrap_or_else(|| WorkerHealth::placeholder(&slot.worker_id, slot.state))
            })
            .collect();
        workers.sort_by(|a, b| a.worker_id.cmp(&b.worker_id));

        PoolStatus {
            total_workers: inner.workers.len(),
            healthy_workers: inner
                .workers
                .values()
                .filter(|slot| slot.state.is_healthy())
                .count(),
            busy_workers: inner
                .workers
                .values()
                .filter(|slot| slot.state == WorkerState::Busy)
                .count(),
            queued_requests: inner.workers.values().map(|slot| slot.pending.len()).sum(),
            routing_table_size: inner.router.assignment_count(),
            workers,
        }
    }

    /// Serializable router snapshot (worker set, sticky cache, vnode count).
    pub async fn routing_state(&self) -> RouterState {
        self.shared.inner.lock().await.router.export_state()
    }

    /// Drop one user's sticky assignment; the next request re-routes.
    pub async fn clear_assignment(&self, user_id: &str) {
        self.shared.inner.lock().await.router.clear_assignment(user_id);
    }

    /// Drop every sticky assignment.
    pub async fn clear_assignments(&self) {
        self.shared.inner.lock().await.router.clear_cache();
    }

    /// Ask every live worker for a full health snapshot. Responses arrive
    /// asynchronously and replace the per-slot health records.
    pub async fn request_health_checks(&self) {
        let inner = self.shared.inner.lock().await;
        for slot in inner.workers.values() {
            if let Some(outbound) = &slot.outbound {
                let _ = outbound.send(SupervisorEnvelope::now(SupervisorMessage::HealthCheck));
            }
        }
    }

    /// Destroy peer sandboxes idle for longer than `max_age`. Returns the
    /// removed worker ids. Intended for operators cleaning up after resized
    /// or retired pools; live slots keep refreshing their `lastAccessed`.
    pub async fn cleanup_stale_sandboxes(
        &self,
        max_age: Duration,
    ) -> Result<Vec<String>, PoolError> {
        Ok(self.shared.sandboxes.cleanup(max_age)?)
    }
}

/// Spawn (or respawn) one slot: provision its sandbox, compose the child
/// environment, launch, send `Init` and wait for `Ready` (polled every
/// 100 ms up to the startup timeout).
fn spawn_worker(
    shared: Arc<PoolShared>,
    worker_id: String,
) -> Pin<Box<dyn Future<Output = Result<(), PoolError>> + Send>> {
    Box::pin(spawn_worker_inner(shared, worker_id))
}

async fn spawn_worker_inner(
    shared: Arc<PoolShared>,
    worker_id: String,
) -> Result<(), PoolError> {
    let worker_sandbox = shared.sandboxes.sandbox(&worker_id)?;
    worker_sandbox.initialize()?;
    let identity = worker_sandbox.ensure_identity()?;

    let config = WorkerConfig {
        worker_id: worker_id.clone(),
        sandbox_root: worker_sandbox.root().to_path_buf(),
        instance_id: identity.instance_id.clone(),
        key_fingerprint: identity.fingerprint(),
        max_concurrent: shared.settings.max_concurrent,
        request_timeout_ms: shared.settings.request_timeout_ms,
        heartbeat_interval_ms: shared.settings.heartbeat_interval_ms,
        max_memory_bytes: shared.settings.max_memory_bytes,
        max_requests: shared.settings.max_requests,
    };

    let mut child_env = env::filtered_parent_env();
    child_env.extend(worker_sandbox.environment());

    let launched = shared
        .launcher
        .launch(LaunchRequest {
            config: config.clone(),
            socket_path: worker_sandbox.temp_dir().join(IPC_SOCKET_FILE),
            env: child_env,
        })
        .await?;

    let mut channel = SupervisorChannel::new(launched.stream);
    channel
        .send(&SupervisorEnvelope::now(SupervisorMessage::Init {
            config: config.clone(),
        }))
        .await?;
    let (sink, source) = channel.split();

    let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
    let cancel = CancellationToken::new();
    let epoch = {
        let mut inner = shared.inner.lock().await;
        let slot = inner
            .workers
            .get_mut(&worker_id)
            .ok_or(PoolError::PoolNotStarted)?;
        slot.epoch += 1;
        slot.state = WorkerState::Starting;
        slot.health = None;
        slot.config = Some(config);
        slot.outbound = Some(outbound_tx);
        slot.child = launched.child;
        slot.pid = launched.pid;
        slot.cancel = cancel.clone();
        slot.epoch
    };

    // Boxed to break the spawn → exit-handling → respawn type cycle.
    let io_task: Pin<Box<dyn Future<Output = ()> + Send>> = Box::pin(worker_io_task(
        Arc::clone(&shared),
        worker_id.clone(),
        epoch,
        sink,
        source,
        outbound_rx,
        cancel,
    ));
    tokio::spawn(io_task);

    let timeout_ms = shared.settings.startup_timeout_ms;
    let deadline = Instant::now() + Duration::from_millis(timeout_ms);
    loop {
        {
            let inner = shared.inner.lock().await;
            match inner.workers.get(&worker_id).map(|slot| slot.state) {
                Some(WorkerState::Ready | WorkerState::Busy) => return Ok(()),
                Some(WorkerState::Crashed) => {
                    return Err(PoolError::WorkerStartupFailure { worker_id });
                }
                _ => {}
            }
        }
        if Instant::now() >= deadline {
            return Err(PoolError::WorkerStartupTimeout {
                worker_id,
                timeout_ms,
            });
        }
        time::sleep(READY_POLL_INTERVAL).await;
    }
}

/// Per-slot io loop: drains the outbound queue into the channel and feeds
/// inbound envelopes to the message handler. Ends on channel close or
/// cancellation, which is the single exit signal for the slot.
async fn worker_io_task(
    shared: Arc<PoolShared>,
    worker_id: String,
    epoch: u64,
    mut sink: MessageSink<SupervisorEnvelope>,
    mut source: MessageSource<WorkerEnvelope>,
    mut outbound_rx: mpsc::UnboundedReceiver<SupervisorEnvelope>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            outbound = outbound_rx.recv() => match outbound {
                Some(envelope) => {
                    if sink.send(&envelope).await.is_err() {
                        break;
                    }
                }
                None => break,
            },
            inbound = source.recv() => match inbound {
                Ok(Some(envelope)) => {
                    handle_worker_message(&shared, &worker_id, envelope).await;
                }
                Ok(None) => {
                    debug!(worker_id = %worker_id, "worker channel closed");
                    break;
                }
                Err(error) => {
                    warn!(worker_id = %worker_id, error = %error, "worker channel failed");
                    break;
                }
            },
        }
    }
    handle_worker_exit(shared, worker_id, epoch).await;
}

async fn handle_worker_message(
    shared: &Arc<PoolShared>,
    worker_id: &str,
    envelope: WorkerEnvelope,
) {
    match envelope.message {
        WorkerMessage::Ready { .. } => {
            {
                let mut inner = shared.inner.lock().await;
                if let Some(slot) = inner.workers.get_mut(worker_id) {
                    slot.state = WorkerState::Ready;
                }
            }
            info!(worker_id = %worker_id, "worker ready");
            shared.emit(PoolEvent::WorkerReady {
                worker_id: worker_id.to_owned(),
            });
        }
        WorkerMessage::Response { response } => {
            let resolver = {
                let mut inner = shared.inner.lock().await;
                inner
                    .workers
                    .get_mut(worker_id)
                    .and_then(|slot| slot.pending.remove(&response.request_id))
            };
            match resolver {
                Some(resolver) => {
                    let _ = resolver.send(Ok(response));
                }
                None => {
                    debug!(
                        worker_id = %worker_id,
                        request_id = %response.request_id,
                        "discarding late or unknown response"
                    );
                }
            }
        }
        WorkerMessage::Health { health } => {
            let mut inner = shared.inner.lock().await;
            if let Some(slot) = inner.workers.get_mut(worker_id) {
                slot.state = health.state;
                slot.health = Some(health);
            }
        }
        WorkerMessage::Heartbeat { worker_id: _, health } => {
            let mut inner = shared.inner.lock().await;
            if let Some(slot) = inner.workers.get_mut(worker_id) {
                slot.state = health.state;
                let pid = slot.pid.unwrap_or_default();
                let snapshot = slot
                    .health
                    .get_or_insert_with(|| WorkerHealth::placeholder(worker_id, health.state));
                snapshot.state = health.state;
                snapshot.active_requests = health.active_requests;
                snapshot.memory_bytes = health.memory_bytes;
                snapshot.requests_processed = health.requests_processed;
                snapshot.last_heartbeat_ms = envelope.ts;
                if snapshot.pid == 0 {
                    snapshot.pid = pid;
                }
            }
        }
        WorkerMessage::Error {
            message,
            code,
            fatal,
        } => {
            warn!(
                worker_id = %worker_id,
                code = code.as_deref().unwrap_or("-"),
                fatal,
                "worker error: {message}"
            );
            if fatal {
                let mut inner = shared.inner.lock().await;
                if let Some(slot) = inner.workers.get_mut(worker_id) {
                    slot.state = WorkerState::Crashed;
                }
            }
        }
        WorkerMessage::Event { event } => match event {
            WorkerEvent::Stopped => {
                {
                    let mut inner = shared.inner.lock().await;
                    if let Some(slot) = inner.workers.get_mut(worker_id) {
                        slot.state = WorkerState::Stopped;
                    }
                }
                shared.emit(PoolEvent::WorkerStopped {
                    worker_id: worker_id.to_owned(),
                });
            }
            WorkerEvent::LimitExceeded {
                reason,
                memory_bytes,
                requests_processed,
            } => {
                // Advisory only: restarts stay exit-driven.
                warn!(
                    worker_id = %worker_id,
                    ?reason,
                    memory_bytes,
                    requests_processed,
                    "worker reported a resource limit"
                );
            }
        },
    }
}

/// Exit handling: reject in-flight correlations, then apply the restart
/// policy unless the pool is shutting down.
async fn handle_worker_exit(shared: Arc<PoolShared>, worker_id: String, epoch: u64) {
    let restart_delay_ms = {
        let mut inner = shared.inner.lock().await;
        let Some(slot) = inner.workers.get_mut(&worker_id) else {
            return;
        };
        if slot.epoch != epoch {
            // A newer process already owns this slot.
            return;
        }

        for (_, resolver) in slot.pending.drain() {
            let _ = resolver.send(Err(PoolError::WorkerExited {
                worker_id: worker_id.clone(),
            }));
        }
        slot.child = None;
        slot.outbound = None;
        slot.state = WorkerState::Stopped;

        if inner.lifecycle != PoolLifecycle::Running {
            return;
        }

        let Some(slot) = inner.workers.get_mut(&worker_id) else {
            return;
        };
        slot.restart_times
            .record(epoch_ms(), shared.settings.restart_window_ms);
        if slot.restart_times.exceeds(shared.settings.max_restart_attempts) {
            slot.state = WorkerState::Crashed;
            warn!(worker_id = %worker_id, "worker exceeded restart limit, latching crashed");
            shared.emit(PoolEvent::WorkerCrash {
                worker_id: worker_id.clone(),
                error: "restart limit exceeded within window".to_owned(),
            });
            let healthy = inner
                .workers
                .values()
                .filter(|slot| slot.state.is_healthy())
                .count();
            let total = inner.workers.len();
            shared.emit(PoolEvent::PoolDegraded { healthy, total });
            return;
        }

        slot.restart_count += 1;
        let attempt = slot.restart_count;
        info!(worker_id = %worker_id, attempt, "scheduling worker restart");
        shared.emit(PoolEvent::WorkerRestart {
            worker_id: worker_id.clone(),
            attempt,
        });
        shared.settings.restart_delay_ms
    };

    time::sleep(Duration::from_millis(restart_delay_ms)).await;
    {
        let inner = shared.inner.lock().await;
        if inner.lifecycle != PoolLifecycle::Running {
            return;
        }
    }
    if let Err(error) = spawn_worker(Arc::clone(&shared), worker_id.clone()).await {
        warn!(worker_id = %worker_id, error = %error, "worker respawn failed");
        let mut inner = shared.inner.lock().await;
        if let Some(slot) = inner.workers.get_mut(&worker_id) {
            slot.state = WorkerState::Crashed;
        }
        shared.emit(PoolEvent::WorkerCrash {
            worker_id,
            error: error.to_string(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_error_messages_name_the_failing_slot() {
        let error = PoolError::WorkerExited {
            worker_id: "worker-2".to_owned(),
        };
        assert!(error.to_string().contains("worker-2"));

        let timeout = PoolError::RequestTimeout {
            request_id: "req-9".to_owned(),
            timeout_ms: 250,
        };
        assert!(timeout.to_string().contains("250ms"));
    }

    #[test]
    fn router_errors_convert_into_pool_errors() {
        let error: PoolError = RouterError::NoWorkersAvailable.into();
        assert!(matches!(error, PoolError::Router(_)));
    }
}
