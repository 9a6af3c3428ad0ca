use std::{
    collections::BTreeMap,
    path::PathBuf,
    process::Stdio,
    sync::Arc,
    time::Duration,
};

use async_trait::async_trait;
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    net::UnixListener,
    process::{Child, Command},
    time,
};
use tracing::{debug, info, warn};
use types::{MessageStream, WorkerConfig};
use worker::{AgentHandler, EchoAgentHandler, WorkerRuntime};

use crate::PoolError;

/// Environment variable overriding the worker executable path.
pub const WORKER_EXECUTABLE_ENV_KEY: &str = "MOLTBOT_WORKER_BIN";
const DEFAULT_WORKER_EXECUTABLE: &str = "moltbot-worker";
const ACCEPT_TIMEOUT: Duration = Duration::from_secs(30);

/// Everything a launcher needs to bring one worker slot up: the config that
/// will be sent in `Init`, the rendezvous socket path inside the slot's
/// sandbox, and the fully composed (filtered + overlaid) child environment.
pub struct LaunchRequest {
    pub config: WorkerConfig,
    pub socket_path: PathBuf,
    pub env: BTreeMap<String, String>,
}

/// A launched worker: the supervisor end of its channel plus the process
/// handle when the worker runs out-of-process.
pub struct LaunchedWorker {
    pub stream: MessageStream,
    pub child: Option<Child>,
    pub pid: Option<u32>,
}

/// Seam between the supervisor and the mechanics of bringing a worker up.
/// The production launcher forks the `moltbot-worker` binary; the embedded
/// launcher runs the worker runtime in-process over a duplex pipe.
#[async_trait]
pub trait WorkerLauncher: Send + Sync {
    async fn launch(&self, request: LaunchRequest) -> Result<LaunchedWorker, PoolError>;
}

/// Forks one `moltbot-worker` child per slot. The supervisor binds a unix
/// listener inside the slot's sandbox, passes the socket path on the command
/// line and waits for the child to connect back.
pub struct ProcessLauncher {
    worker_binary: PathBuf,
}

impl ProcessLauncher {
    pub fn new() -> Self {
        Self {
            worker_binary: resolve_worker_executable(),
        }
    }

    pub fn with_binary(worker_binary: impl Into<PathBuf>) -> Self {
        Self {
            worker_binary: worker_binary.into(),
        }
    }
}

impl Default for ProcessLauncher {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl WorkerLauncher for ProcessLauncher {
    async fn launch(&self, request: LaunchRequest) -> Result<LaunchedWorker, PoolError> {
        let worker_id = request.config.worker_id.clone();

        // Remove a stale socket left behind by a previous process.
        if request.socket_path.exists() {
            let _ = std::fs::remove_file(&request.socket_path);
        }
        let listener =
            UnixListener::bind(&request.socket_path).map_err(|source| PoolError::Launch {
                worker_id: worker_id.clone(),
                source,
            })?;

        let mut command = Command::new(&self.worker_binary);
        command
            .arg("--socket")
            .arg(&request.socket_path)
            .env_clear()
            .envs(&request.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        let mut child = command.spawn().map_err(|source| PoolError::Launch {
            worker_id: worker_id.clone(),
            source,
        })?;
        let pid = child.id();
        info!(worker_id = %worker_id, pid, "worker process spawned");

        if let Some(stdout) = child.stdout.take() {
            forward_child_output(worker_id.clone(), "stdout", stdout);
        }
        if let Some(stderr) = child.stderr.take() {
            forward_child_output(worker_id.clone(), "stderr", stderr);
        }

        let accepted = time::timeout(ACCEPT_TIMEOUT, listener.accept()).await;
        let (stream, _addr) = match accepted {
            Ok(Ok(connection)) => connection,
            Ok(Err(source)) => {
                let _ = child.start_kill();
                return Err(PoolError::Launch { worker_id, source });
            }
            Err(_) => {
                let _ = child.start_kill();
                return Err(PoolError::WorkerStartupTimeout {
                    worker_id,
                    timeout_ms: ACCEPT_TIMEOUT.as_millis() as u64,
                });
            }
        };

        Ok(LaunchedWorker {
            stream: Box::pin(stream),
            child: Some(child),
            pid,
        })
    }
}

/// Runs the worker runtime inside the supervisor process over an in-memory
/// duplex stream. Used by the test suite and by single-process development
/// setups; the wire protocol and lifecycle are identical to the forked path.
pub struct InProcessLauncher {
    handler_factory: Arc<dyn Fn() -> Arc<dyn AgentHandler> + Send + Sync>,
}

impl InProcessLauncher {
    pub fn new() -> Self {
        Self::with_handler_factory(|| Arc::new(EchoAgentHandler))
    }

    pub fn with_handler_factory<F>(factory: F) -> Self
    where
        F: Fn() -> Arc<dyn AgentHandler> + Send + Sync + 'static,
    {
        Self {
            handler_factory: Arc::new(factory),
        }
    }
}

impl Default for InProcessLauncher {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl WorkerLauncher for InProcessLauncher {
    async fn launch(&self, request: LaunchRequest) -> Result<LaunchedWorker, PoolError> {
        let worker_id = request.config.worker_id.clone();
        let (supervisor_end, worker_end) = tokio::io::duplex(64 * 1024);
        let runtime = WorkerRuntime::new((self.handler_factory)());
        tokio::spawn(async move {
            match runtime.serve_stream(worker_end).await {
                Ok(()) => debug!(worker_id = %worker_id, "embedded worker stopped"),
                Err(error) => {
                    warn!(worker_id = %worker_id, error = %error, "embedded worker failed");
                }
            }
        });

        Ok(LaunchedWorker {
            stream: Box::pin(supervisor_end),
            child: None,
            pid: Some(std::process::id()),
        })
    }
}

fn forward_child_output<R>(worker_id: String, stream_name: &'static str, readable: R)
where
    R: tokio::io::AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(readable).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            debug!(worker_id = %worker_id, stream = stream_name, line = %line, "worker output");
        }
    });
}

fn resolve_worker_executable() -> PathBuf {
    if let Ok(explicit) = std::env::var(WORKER_EXECUTABLE_ENV_KEY) {
        let trimmed = explicit.trim();
        if !trimmed.is_empty() {
            return PathBuf::from(trimmed);
        }
    }

    if let Ok(current) = std::env::current_exe()
        && let Some(parent) = current.parent()
    {
        let bundled = parent.join(DEFAULT_WORKER_EXECUTABLE);
        if bundled.is_file() {
            return bundled;
        }
    }

    PathBuf::from(DEFAULT_WORKER_EXECUTABLE)
}
