use std::{
    collections::{BTreeMap, HashMap},
    fs, io, process,
    sync::Arc,
    time::{Duration, Instant},
};

use async_trait::async_trait;
use sandbox::WorkerSandbox;
use serde_json::{Value, json};
use thiserror::Error;
use tokio::{
    io::{AsyncRead, AsyncWrite},
    sync::{Mutex, mpsc},
    time,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use types::{
    HeartbeatReport, IpcError, LimitReason, SessionOp, SupervisorMessage, WorkerChannel,
    WorkerConfig, WorkerEnvelope, WorkerEvent, WorkerHealth, WorkerMessage, WorkerRequest,
    WorkerRequestKind, WorkerResponse, WorkerState, epoch_ms,
};

/// Grace period applied when the child receives SIGTERM.
pub const SIGTERM_GRACE_MS: u64 = 5_000;
/// Grace period applied when the child receives SIGINT.
pub const SIGINT_GRACE_MS: u64 = 1_000;

const INIT_WAIT_TIMEOUT: Duration = Duration::from_secs(30);
const SHUTDOWN_POLL_INTERVAL: Duration = Duration::from_millis(50);
const FLUSH_DELAY: Duration = Duration::from_millis(100);

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error(transparent)]
    Ipc(#[from] IpcError),
    #[error(transparent)]
    Sandbox(#[from] sandbox::SandboxError),
}

/// Failure returned by an application handler. Becomes a
/// `Response { success: false, error, error_code }` on the wire.
#[derive(Debug, Error)]
#[error("{message}")]
pub struct HandlerError {
    pub code: String,
    pub message: String,
}

impl HandlerError {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
        }
    }
}

/// Read-only context handed to application handlers.
pub struct HandlerContext {
    pub worker_id: String,
    pub sandbox: WorkerSandbox,
    /// The sandbox environment overlay the supervisor applied at spawn time.
    pub environment: BTreeMap<String, String>,
}

/// The application seam. The core treats agent payloads as opaque structured
/// values; only handlers interpret them.
#[async_trait]
pub trait AgentHandler: Send + Sync {
    async fn handle_message(
        &self,
        ctx: &HandlerContext,
        message: Value,
    ) -> Result<Value, HandlerError>;

    async fn handle_command(
        &self,
        ctx: &HandlerContext,
        command: &str,
        args: Value,
    ) -> Result<Value, HandlerError>;
}

/// Default handler: echoes payloads back. Useful for wiring tests and as a
/// placeholder until an application handler is plugged in.
pub struct EchoAgentHandler;

#[async_trait]
impl AgentHandler for EchoAgentHandler {
    async fn handle_message(
        &self,
        ctx: &HandlerContext,
        message: Value,
    ) -> Result<Value, HandlerError> {
        Ok(json!({ "worker_id": ctx.worker_id, "echo": message }))
    }

    async fn handle_command(
        &self,
        ctx: &HandlerContext,
        command: &str,
        args: Value,
    ) -> Result<Value, HandlerError> {
        Ok(json!({ "worker_id": ctx.worker_id, "command": command, "args": args }))
    }
}

/// Clonable handle used to request a graceful shutdown from outside the
/// serve loop (signal handlers, embedding supervisors).
#[derive(Clone)]
pub struct ShutdownHandle {
    tx: mpsc::UnboundedSender<u64>,
}

impl ShutdownHandle {
    pub fn request(&self, grace_period_ms: u64) {
        let _ = self.tx.send(grace_period_ms);
    }
}

struct RuntimeState {
    state: WorkerState,
    started_at: Instant,
    requests_processed: u64,
    error_count: u64,
    active: HashMap<String, Instant>,
}

struct WorkerShared {
    config: WorkerConfig,
    context: HandlerContext,
    handler: Arc<dyn AgentHandler>,
    state: Mutex<RuntimeState>,
    outbound: mpsc::UnboundedSender<WorkerEnvelope>,
    stop: CancellationToken,
}

impl WorkerShared {
    fn send(&self, message: WorkerMessage) {
        let _ = self.outbound.send(WorkerEnvelope::now(message));
    }

    async fn health_snapshot(&self) -> WorkerHealth {
        let state = self.state.lock().await;
        WorkerHealth {
            worker_id: self.config.worker_id.clone(),
            pid: process::id(),
            state: state.state,
            memory_bytes: current_memory_bytes(),
            requests_processed: state.requests_processed,
            active_requests: state.active.len(),
            last_heartbeat_ms: epoch_ms(),
            uptime_ms: state.started_at.elapsed().as_millis() as u64,
            error_count: state.error_count,
            cpu_usage: 0.0,
        }
    }
}

/// The in-child dispatcher. Owns nothing until `Init` arrives; afterwards a
/// single shared record carries lifecycle, counters and the in-flight map.
pub struct WorkerRuntime {
    handler: Arc<dyn AgentHandler>,
    shutdown_tx: mpsc::UnboundedSender<u64>,
    shutdown_rx: mpsc::UnboundedReceiver<u64>,
}

impl WorkerRuntime {
    pub fn new(handler: Arc<dyn AgentHandler>) -> Self {
        let (shutdown_tx, shutdown_rx) = mpsc::unbounded_channel();
        Self {
            handler,
            shutdown_tx,
            shutdown_rx,
        }
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            tx: self.shutdown_tx.clone(),
        }
    }

    /// Serve one supervisor connection until shutdown or channel close.
    ///
    /// Boot sequence on `Init`: initialize the sandbox, start the heartbeat,
    /// report `Ready`. The supervisor applies the sandbox environment at
    /// spawn time; handlers additionally receive it via [`HandlerContext`].
    pub async fn serve_stream<S>(self, stream: S) -> Result<(), WorkerError>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let mut channel = WorkerChannel::new(stream);
        let config = wait_for_init(&mut channel).await?;
        info!(worker_id = %config.worker_id, "worker received init");

        let worker_sandbox =
            WorkerSandbox::from_root(config.sandbox_root.clone(), &config.worker_id)?;
        worker_sandbox.initialize()?;
        let environment = worker_sandbox.environment();

        let (outbound, mut outbound_rx) = mpsc::unbounded_channel();
        let stop = CancellationToken::new();
        let shared = Arc::new(WorkerShared {
            context: HandlerContext {
                worker_id: config.worker_id.clone(),
                sandbox: worker_sandbox,
                environment,
            },
            handler: self.handler,
            state: Mutex::new(RuntimeState {
                state: WorkerState::Starting,
                started_at: Instant::now(),
                requests_processed: 0,
                error_count: 0,
                active: HashMap::new(),
            }),
            outbound,
            stop: stop.clone(),
            config,
        });

        let (mut sink, mut source) = channel.split();
        let writer = tokio::spawn(async move {
            while let Some(envelope) = outbound_rx.recv().await {
                if sink.send(&envelope).await.is_err() {
                    break;
                }
            }
        });

        let heartbeat = tokio::spawn(heartbeat_loop(Arc::clone(&shared)));

        let mut shutdown_rx = self.shutdown_rx;
        let shutdown_feed = tokio::spawn({
            let shared = Arc::clone(&shared);
            async move {
                while let Some(grace_period_ms) = shutdown_rx.recv().await {
                    begin_shutdown(Arc::clone(&shared), grace_period_ms);
                }
            }
        });

        shared.send(WorkerMessage::Ready {
            worker_id: shared.config.worker_id.clone(),
        });
        {
            let mut state = shared.state.lock().await;
            state.state = WorkerState::Ready;
        }

        let result = loop {
            tokio::select! {
                _ = stop.cancelled() => break Ok(()),
                inbound = source.recv() => match inbound {
                    Ok(Some(envelope)) => {
                        handle_supervisor_message(&shared, envelope.message);
                    }
                    Ok(None) => {
                        info!(worker_id = %shared.config.worker_id, "supervisor channel closed");
                        break Ok(());
                    }
                    Err(error) => break Err(WorkerError::from(error)),
                },
            }
        };

        if let Err(error) = &result {
            // Best-effort fatal report before the process exits non-zero.
            shared.send(WorkerMessage::Error {
                message: error.to_string(),
                code: Some("WORKER_FATAL".to_owned()),
                fatal: true,
            });
        }

        time::sleep(FLUSH_DELAY).await;
        heartbeat.abort();
        shutdown_feed.abort();
        writer.abort();
        result
    }
}

async fn wait_for_init(channel: &mut WorkerChannel) -> Result<WorkerConfig, IpcError> {
    let deadline = time::Instant::now() + INIT_WAIT_TIMEOUT;
    loop {
        let remaining = deadline.saturating_duration_since(time::Instant::now());
        match time::timeout(remaining, channel.recv()).await {
            Ok(Ok(Some(envelope))) => match envelope.message {
                SupervisorMessage::Init { config } => return Ok(config),
                other => debug!(?other, "ignoring pre-init message"),
            },
            Ok(Ok(None)) => return Err(IpcError::ChannelClosed),
            Ok(Err(error)) => return Err(error),
            Err(_) => {
                return Err(IpcError::WaitTimeout {
                    waited_ms: INIT_WAIT_TIMEOUT.as_millis() as u64,
                });
            }
        }
    }
}

fn handle_supervisor_message(shared: &Arc<WorkerShared>, message: SupervisorMessage) {
    match message {
        SupervisorMessage::Init { .. } => {
            warn!(worker_id = %shared.config.worker_id, "ignoring duplicate init");
        }
        SupervisorMessage::Request { request } => {
            tokio::spawn(handle_request(Arc::clone(shared), request));
        }
        SupervisorMessage::HealthCheck => {
            let shared = Arc::clone(shared);
            tokio::spawn(async move {
                let health = shared.health_snapshot().await;
                shared.send(WorkerMessage::Health { health });
            });
        }
        SupervisorMessage::Shutdown { grace_period_ms } => {
            begin_shutdown(Arc::clone(shared), grace_period_ms);
        }
        SupervisorMessage::Kill => {
            info!(worker_id = %shared.config.worker_id, "kill requested");
            shared.stop.cancel();
        }
    }
}

async fn handle_request(shared: Arc<WorkerShared>, request: WorkerRequest) {
    let started = Instant::now();
    let request_id = request.request_id.clone();

    {
        let mut state = shared.state.lock().await;
        if matches!(state.state, WorkerState::Stopping | WorkerState::Stopped) {
            drop(state);
            shared.send(WorkerMessage::Response {
                response: WorkerResponse::failure(
                    request_id,
                    "Worker shutting down",
                    "WORKER_SHUTDOWN",
                    0,
                ),
            });
            return;
        }
        state.active.insert(request_id.clone(), started);
        state.state = WorkerState::Busy;
    }
    if let Err(error) = shared.context.sandbox.touch() {
        debug!(error = %error, "sandbox touch failed");
    }

    // Run the handler in its own task so a panic is contained to this
    // request instead of tearing the worker down.
    let outcome = {
        let shared = Arc::clone(&shared);
        let kind = request.kind.clone();
        match tokio::spawn(async move { dispatch_request(&shared, kind).await }).await {
            Ok(result) => result,
            Err(join_error) if join_error.is_panic() => Err(HandlerError::new(
                "HANDLER_PANIC",
                "request handler panicked",
            )),
            Err(_) => Err(HandlerError::new(
                "HANDLER_CANCELLED",
                "request handler was cancelled",
            )),
        }
    };

    let duration_ms = started.elapsed().as_millis() as u64;
    let response = match outcome {
        Ok(payload) => WorkerResponse::success(request_id.clone(), payload, duration_ms),
        Err(error) => {
            WorkerResponse::failure(request_id.clone(), error.message, error.code, duration_ms)
        }
    };
    let success = response.success;
    shared.send(WorkerMessage::Response { response });

    {
        let mut state = shared.state.lock().await;
        state.active.remove(&request_id);
        state.requests_processed += 1;
        if !success {
            state.error_count += 1;
        }
        if state.active.is_empty() && state.state == WorkerState::Busy {
            state.state = WorkerState::Ready;
        }
    }
    evaluate_limits(&shared).await;
}

async fn dispatch_request(
    shared: &Arc<WorkerShared>,
    kind: WorkerRequestKind,
) -> Result<Value, HandlerError> {
    match kind {
        WorkerRequestKind::AgentMessage { message } => {
            shared
                .handler
                .handle_message(&shared.context, message)
                .await
        }
        WorkerRequestKind::AgentCommand { command, args } => {
            shared
                .handler
                .handle_command(&shared.context, &command, args)
                .await
        }
        WorkerRequestKind::Session {
            op,
            session_id,
            data,
        } => handle_session_op(shared, op, session_id, data),
        WorkerRequestKind::HealthCheck => {
            let health = shared.health_snapshot().await;
            serde_json::to_value(health)
                .map_err(|error| HandlerError::new("SERIALIZE_FAILED", error.to_string()))
        }
        WorkerRequestKind::Shutdown => {
            begin_shutdown(Arc::clone(shared), SIGTERM_GRACE_MS);
            Ok(json!({ "stopping": true }))
        }
    }
}

fn handle_session_op(
    shared: &Arc<WorkerShared>,
    op: SessionOp,
    session_id: Option<String>,
    data: Option<Value>,
) -> Result<Value, HandlerError> {
    let sandbox = &shared.context.sandbox;
    match op {
        SessionOp::List => Ok(json!({ "sessions": sandbox.list_sessions() })),
        SessionOp::Get => {
            let session_id = require_session_id(session_id)?;
            let path = sandbox.session_path(&session_id);
            match fs::read_to_string(&path) {
                Ok(contents) => {
                    let value: Value = serde_json::from_str(&contents).unwrap_or(Value::Null);
                    Ok(json!({ "session": value }))
                }
                Err(error) if error.kind() == io::ErrorKind::NotFound => {
                    Ok(json!({ "session": Value::Null }))
                }
                Err(error) => Err(HandlerError::new("SESSION_IO", error.to_string())),
            }
        }
        SessionOp::Set => {
            let session_id = require_session_id(session_id)?;
            let data = data.ok_or_else(|| {
                HandlerError::new("INVALID_REQUEST", "session set requires data")
            })?;
            let contents = serde_json::to_string_pretty(&data)
                .map_err(|error| HandlerError::new("SERIALIZE_FAILED", error.to_string()))?;
            fs::write(sandbox.session_path(&session_id), contents)
                .map_err(|error| HandlerError::new("SESSION_IO", error.to_string()))?;
            Ok(json!({ "saved": true }))
        }
        SessionOp::Delete => {
            let session_id = require_session_id(session_id)?;
            match fs::remove_file(sandbox.session_path(&session_id)) {
                Ok(()) => Ok(json!({ "deleted": true })),
                Err(error) if error.kind() == io::ErrorKind::NotFound => {
                    Ok(json!({ "deleted": false }))
                }
                Err(error) => Err(HandlerError::new("SESSION_IO", error.to_string())),
            }
        }
    }
}

fn require_session_id(session_id: Option<String>) -> Result<String, HandlerError> {
    session_id
        .filter(|id| !id.trim().is_empty())
        .ok_or_else(|| HandlerError::new("INVALID_REQUEST", "session operations require session_id"))
}

/// Post-response limit evaluation. The worker only reports; terminating the
/// process is the supervisor's decision.
async fn evaluate_limits(shared: &Arc<WorkerShared>) {
    let (memory_bytes, requests_processed) = {
        let state = shared.state.lock().await;
        (current_memory_bytes(), state.requests_processed)
    };
    if memory_bytes > shared.config.max_memory_bytes {
        warn!(
            worker_id = %shared.config.worker_id,
            memory_bytes,
            limit = shared.config.max_memory_bytes,
            "memory limit exceeded"
        );
        shared.send(WorkerMessage::Event {
            event: WorkerEvent::LimitExceeded {
                reason: LimitReason::MemoryLimit,
                memory_bytes,
                requests_processed,
            },
        });
    }
    if requests_processed >= shared.config.max_requests {
        shared.send(WorkerMessage::Event {
            event: WorkerEvent::LimitExceeded {
                reason: LimitReason::RequestLimit,
                memory_bytes,
                requests_processed,
            },
        });
    }
}

/// Drive the graceful drain: wait for in-flight requests up to the grace
/// deadline, fail stragglers, report `stopped`, then stop the serve loop.
fn begin_shutdown(shared: Arc<WorkerShared>, grace_period_ms: u64) {
    tokio::spawn(async move {
        {
            let mut state = shared.state.lock().await;
            if matches!(state.state, WorkerState::Stopping | WorkerState::Stopped) {
                return;
            }
            state.state = WorkerState::Stopping;
        }
        info!(
            worker_id = %shared.config.worker_id,
            grace_period_ms,
            "graceful shutdown started"
        );

        let deadline = Instant::now() + Duration::from_millis(grace_period_ms);
        loop {
            {
                let state = shared.state.lock().await;
                if state.active.is_empty() {
                    break;
                }
            }
            if Instant::now() >= deadline {
                break;
            }
            time::sleep(SHUTDOWN_POLL_INTERVAL).await;
        }

        let stragglers: Vec<(String, Instant)> = {
            let mut state = shared.state.lock().await;
            state.active.drain().collect()
        };
        for (request_id, started) in stragglers {
            shared.send(WorkerMessage::Response {
                response: WorkerResponse::failure(
                    request_id,
                    "Worker shutting down",
                    "WORKER_SHUTDOWN",
                    started.elapsed().as_millis() as u64,
                ),
            });
        }

        shared.send(WorkerMessage::Event {
            event: WorkerEvent::Stopped,
        });
        {
            let mut state = shared.state.lock().await;
            state.state = WorkerState::Stopped;
        }
        time::sleep(FLUSH_DELAY).await;
        shared.stop.cancel();
    });
}

async fn heartbeat_loop(shared: Arc<WorkerShared>) {
    let mut interval = time::interval(Duration::from_millis(
        shared.config.heartbeat_interval_ms.max(1),
    ));
    interval.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
    interval.tick().await;
    loop {
        interval.tick().await;
        let report = {
            let state = shared.state.lock().await;
            HeartbeatReport {
                state: state.state,
                active_requests: state.active.len(),
                memory_bytes: current_memory_bytes(),
                requests_processed: state.requests_processed,
            }
        };
        shared.send(WorkerMessage::Heartbeat {
            worker_id: shared.config.worker_id.clone(),
            health: report,
        });
    }
}

/// Resident set size of this process. Linux only; other platforms report 0.
pub fn current_memory_bytes() -> u64 {
    #[cfg(target_os = "linux")]
    {
        if let Ok(status) = fs::read_to_string("/proc/self/status") {
            for line in status.lines() {
                if let Some(rest) = line.strip_prefix("VmRSS:") {
                    let kib: u64 = rest
                        .trim()
                        .trim_end_matches("kB")
                        .trim()
                        .parse()
                        .unwrap_or(0);
                    return kib * 1024;
                }
            }
        }
        0
    }
    #[cfg(not(target_os = "linux"))]
    {
        0
    }
}
