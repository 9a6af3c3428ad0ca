use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Lifecycle state of a worker slot. The supervisor and the child both track
/// this; the child reports its own view through health and heartbeat
/// messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    Starting,
    Ready,
    Busy,
    Stopping,
    Stopped,
    Crashed,
}

impl WorkerState {
    /// A worker in `Ready` or `Busy` can accept dispatched requests.
    pub fn is_healthy(self) -> bool {
        matches!(self, Self::Ready | Self::Busy)
    }
}

/// Configuration handed to a child worker in the `Init` message. The worker
/// id and sandbox root identify the slot; the remaining fields are policy
/// knobs enforced (or advisorily observed) inside the child.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerConfig {
    pub worker_id: String,
    pub sandbox_root: PathBuf,
    pub instance_id: String,
    pub key_fingerprint: String,
    pub max_concurrent: usize,
    pub request_timeout_ms: u64,
    pub heartbeat_interval_ms: u64,
    pub max_memory_bytes: u64,
    pub max_requests: u64,
}

/// Full health snapshot reported by a child worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerHealth {
    pub worker_id: String,
    pub pid: u32,
    pub state: WorkerState,
    pub memory_bytes: u64,
    pub requests_processed: u64,
    pub active_requests: usize,
    pub last_heartbeat_ms: u64,
    pub uptime_ms: u64,
    pub error_count: u64,
    /// Always reported as zero; real measurement is out of scope.
    pub cpu_usage: f64,
}

impl WorkerHealth {
    /// Placeholder snapshot for a slot that has not reported health yet.
    pub fn placeholder(worker_id: impl Into<String>, state: WorkerState) -> Self {
        Self {
            worker_id: worker_id.into(),
            pid: 0,
            state,
            memory_bytes: 0,
            requests_processed: 0,
            active_requests: 0,
            last_heartbeat_ms: 0,
            uptime_ms: 0,
            error_count: 0,
            cpu_usage: 0.0,
        }
    }
}

/// Aggregated pool status returned to external callers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoolStatus {
    pub total_workers: usize,
    pub healthy_workers: usize,
    pub busy_workers: usize,
    pub queued_requests: usize,
    pub routing_table_size: usize,
    pub workers: Vec<WorkerHealth>,
}
