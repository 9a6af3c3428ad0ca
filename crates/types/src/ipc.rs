use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::worker::{WorkerConfig, WorkerHealth, WorkerState};

/// Milliseconds since the unix epoch, used for every `ts` stamp on the wire.
pub fn epoch_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// A request dispatched to a worker. `request_id` uniquely identifies the
/// pending correlation in the supervisor for the lifetime between dispatch
/// and response or timeout.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerRequest {
    pub request_id: String,
    pub user_id: String,
    #[serde(flatten)]
    pub kind: WorkerRequestKind,
    /// Per-request override of the worker's configured request timeout.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WorkerRequestKind {
    AgentMessage {
        message: Value,
    },
    AgentCommand {
        command: String,
        #[serde(default)]
        args: Value,
    },
    Session {
        op: SessionOp,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        data: Option<Value>,
    },
    HealthCheck,
    Shutdown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionOp {
    Get,
    Set,
    Delete,
    List,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerResponse {
    pub request_id: String,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
    pub duration_ms: u64,
}

impl WorkerResponse {
    pub fn success(request_id: impl Into<String>, payload: Value, duration_ms: u64) -> Self {
        Self {
            request_id: request_id.into(),
            success: true,
            payload: Some(payload),
            error: None,
            error_code: None,
            duration_ms,
        }
    }

    pub fn failure(
        request_id: impl Into<String>,
        error: impl Into<String>,
        error_code: impl Into<String>,
        duration_ms: u64,
    ) -> Self {
        Self {
            request_id: request_id.into(),
            success: false,
            payload: None,
            error: Some(error.into()),
            error_code: Some(error_code.into()),
            duration_ms,
        }
    }
}

/// Partial health carried by periodic heartbeats.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeartbeatReport {
    pub state: WorkerState,
    pub active_requests: usize,
    pub memory_bytes: u64,
    pub requests_processed: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LimitReason {
    MemoryLimit,
    RequestLimit,
}

/// Out-of-band notifications from the worker. Limit events are advisory:
/// the child never terminates itself on a limit, the supervisor decides.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum WorkerEvent {
    LimitExceeded {
        reason: LimitReason,
        memory_bytes: u64,
        requests_processed: u64,
    },
    Stopped,
}

/// Messages flowing supervisor → worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SupervisorMessage {
    Init { config: WorkerConfig },
    Request { request: WorkerRequest },
    HealthCheck,
    Shutdown { grace_period_ms: u64 },
    Kill,
}

/// Messages flowing worker → supervisor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerMessage {
    Ready {
        worker_id: String,
    },
    Response {
        response: WorkerResponse,
    },
    Health {
        health: WorkerHealth,
    },
    Event {
        event: WorkerEvent,
    },
    Error {
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        code: Option<String>,
        #[serde(default)]
        fatal: bool,
    },
    Heartbeat {
        worker_id: String,
        health: HeartbeatReport,
    },
}

/// Wire envelope for supervisor → worker messages: the tagged message plus a
/// `ts` millisecond stamp applied at send time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SupervisorEnvelope {
    pub ts: u64,
    #[serde(flatten)]
    pub message: SupervisorMessage,
}

impl SupervisorEnvelope {
    pub fn now(message: SupervisorMessage) -> Self {
        Self {
            ts: epoch_ms(),
            message,
        }
    }
}

/// Wire envelope for worker → supervisor messages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerEnvelope {
    pub ts: u64,
    #[serde(flatten)]
    pub message: WorkerMessage,
}

impl WorkerEnvelope {
    pub fn now(message: WorkerMessage) -> Self {
        Self {
            ts: epoch_ms(),
            message,
        }
    }
}
