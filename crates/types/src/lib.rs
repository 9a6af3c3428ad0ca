mod channel;
mod config;
mod ipc;
mod tracing;
mod worker;

pub use channel::{
    IpcError, MessageChannel, MessageSink, MessageSource, MessageStream, SupervisorChannel,
    WorkerChannel,
};
pub use config::{DEFAULT_SANDBOX_DIR_NAME, PoolSettings, SettingsError, load_pool_settings};
pub use ipc::{
    HeartbeatReport, LimitReason, SessionOp, SupervisorEnvelope, SupervisorMessage,
    WorkerEnvelope, WorkerEvent, WorkerMessage, WorkerRequest, WorkerRequestKind, WorkerResponse,
    epoch_ms,
};
pub use tracing::init_tracing;
pub use worker::{PoolStatus, WorkerConfig, WorkerHealth, WorkerState};
