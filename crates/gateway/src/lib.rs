use std::time::Instant;

use pool::{PoolError, WorkerPool};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;
use types::{PoolStatus, SessionOp, WorkerRequest, WorkerRequestKind};
use uuid::Uuid;

/// Request shape accepted from external ingresses (HTTP handlers, chat
/// adapters, CLIs). Everything beyond the identity fields is optional; the
/// facade maps it onto a typed worker request.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GatewayRequest {
    /// `"agent"`, `"command"` or `"session"`; anything else (or nothing)
    /// maps to an agent message.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_key: Option<String>,
    #[serde(default)]
    pub payload: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_op: Option<SessionOp>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GatewayResponse {
    pub request_id: String,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub duration_ms: u64,
}

type UserIdExtractor = Box<dyn Fn(&GatewayRequest) -> String + Send + Sync>;

/// Thin facade over the worker pool: extracts a user identity, maps the
/// request kind, generates the request id and folds supervisor errors into a
/// failed response instead of surfacing them.
pub struct WorkerGateway {
    pool: WorkerPool,
    extract_user_id: UserIdExtractor,
}

impl WorkerGateway {
    pub fn new(pool: WorkerPool) -> Self {
        Self {
            pool,
            extract_user_id: Box::new(default_user_id),
        }
    }

    /// Replace the identity extraction (default: explicit id, then session
    /// key, then a fresh anonymous id).
    pub fn with_user_id_extractor<F>(mut self, extractor: F) -> Self
    where
        F: Fn(&GatewayRequest) -> String + Send + Sync + 'static,
    {
        self.extract_user_id = Box::new(extractor);
        self
    }

    pub fn pool(&self) -> &WorkerPool {
        &self.pool
    }

    pub async fn start(&self) -> Result<(), PoolError> {
        self.pool.start().await
    }

    pub async fn stop(&self, grace_period_ms: Option<u64>) -> Result<(), PoolError> {
        self.pool.stop(grace_period_ms).await
    }

    pub async fn route(&self, request: GatewayRequest) -> GatewayResponse {
        let started = Instant::now();
        let request_id = Uuid::new_v4().to_string();
        let user_id = (self.extract_user_id)(&request);
        let kind = map_request_kind(&request);
        debug!(request_id = %request_id, user_id = %user_id, "routing gateway request");

        let worker_request = WorkerRequest {
            request_id: request_id.clone(),
            user_id,
            kind,
            timeout_ms: request.timeout_ms,
        };

        match self.pool.send_request(worker_request).await {
            Ok(dispatched) => GatewayResponse {
                request_id,
                success: true,
                worker_id: Some(dispatched.worker_id),
                payload: dispatched.response.payload,
                error: None,
                duration_ms: started.elapsed().as_millis() as u64,
            },
            Err(error) => GatewayResponse {
                request_id,
                success: false,
                worker_id: None,
                payload: None,
                error: Some(error.to_string()),
                duration_ms: started.elapsed().as_millis() as u64,
            },
        }
    }

    pub async fn worker_for_user(&self, user_id: &str) -> Option<String> {
        self.pool.worker_for_user(user_id).await
    }

    pub async fn status(&self) -> PoolStatus {
        self.pool.status().await
    }
}

/// `user_id ?? session_key ?? "anon:<uuid>"`. Anonymous ids are freshly
/// generated per request, so they are deliberately non-sticky.
pub fn default_user_id(request: &GatewayRequest) -> String {
    request
        .user_id
        .clone()
        .filter(|id| !id.trim().is_empty())
        .or_else(|| {
            request
                .session_key
                .clone()
                .filter(|key| !key.trim().is_empty())
        })
        .unwrap_or_else(|| format!("anon:{}", Uuid::new_v4()))
}

fn map_request_kind(request: &GatewayRequest) -> WorkerRequestKind {
    match request.kind.as_deref() {
        Some("command") => WorkerRequestKind::AgentCommand {
            command: request.command.clone().unwrap_or_default(),
            args: request.payload.clone(),
        },
        Some("session") => WorkerRequestKind::Session {
            op: request.session_op.unwrap_or(SessionOp::Get),
            session_id: request.session_id.clone(),
            data: if request.payload.is_null() {
                None
            } else {
                Some(request.payload.clone())
            },
        },
        _ => WorkerRequestKind::AgentMessage {
            message: request.payload.clone(),
        },
    }
}
