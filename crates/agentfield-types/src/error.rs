use thiserror::Error;

/// Surface-level error taxonomy for the control plane.
///
/// Each variant maps to exactly one of the tags a caller sees in an error
/// response body, and to one HTTP status code at the service boundary.
#[derive(Debug, Error, Clone)]
pub enum ControlPlaneError {
    #[error("{0}")]
    BadRequest(String),

    #[error("target '{target_name}' not found")]
    TargetNotFound { target_name: String },

    #[error("agent '{node_id}' is not registered")]
    AgentUnknown { node_id: String },

    #[error("agent error ({status}): {body_prefix}")]
    AgentError { status: u16, body_prefix: String },

    #[error("timeout: {0}")]
    Timeout(String),

    #[error("agent_call_failed: {0}")]
    AgentCallFailed(String),

    #[error("async execution queue is full")]
    QueueFull,

    #[error("not found")]
    NotFound,

    #[error("internal error: {0}")]
    Internal(String),
}

impl ControlPlaneError {
    /// The stable tag used in taxonomy docs and logs (spec.md §7).
    pub fn tag(&self) -> &'static str {
        match self {
            ControlPlaneError::BadRequest(_) => "bad_request",
            ControlPlaneError::TargetNotFound { .. } => "target_not_found",
            ControlPlaneError::AgentUnknown { .. } => "agent_unknown",
            ControlPlaneError::AgentError { .. } => "agent_error",
            ControlPlaneError::Timeout(_) => "timeout",
            ControlPlaneError::AgentCallFailed(_) => "agent_call_failed",
            ControlPlaneError::QueueFull => "queue_full",
            ControlPlaneError::NotFound => "not_found",
            ControlPlaneError::Internal(_) => "internal",
        }
    }

    /// HTTP status this error surfaces as, per spec.md §6/§8.
    pub fn http_status(&self) -> u16 {
        match self {
            ControlPlaneError::BadRequest(_)
            | ControlPlaneError::TargetNotFound { .. }
            | ControlPlaneError::AgentUnknown { .. }
            | ControlPlaneError::AgentError { .. } => 400,
            ControlPlaneError::Timeout(_) => 504,
            ControlPlaneError::AgentCallFailed(_) => 400,
            ControlPlaneError::QueueFull => 503,
            ControlPlaneError::NotFound => 404,
            ControlPlaneError::Internal(_) => 500,
        }
    }
}
