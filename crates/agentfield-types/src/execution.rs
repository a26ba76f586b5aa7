use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(type_name = "text", rename_all = "lowercase"))]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    Queued,
    Running,
    Succeeded,
    Failed,
    Cancelled,
    Timeout,
    Pending,
    Unknown,
}

impl ExecutionStatus {
    /// Terminal statuses are monotone: once reached, only `updated_at` may change.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ExecutionStatus::Succeeded
                | ExecutionStatus::Failed
                | ExecutionStatus::Cancelled
                | ExecutionStatus::Timeout
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ExecutionStatus::Queued => "queued",
            ExecutionStatus::Running => "running",
            ExecutionStatus::Succeeded => "succeeded",
            ExecutionStatus::Failed => "failed",
            ExecutionStatus::Cancelled => "cancelled",
            ExecutionStatus::Timeout => "timeout",
            ExecutionStatus::Pending => "pending",
            ExecutionStatus::Unknown => "unknown",
        }
    }
}

/// Result payload: either stored inline or spilled to an external payload
/// store once it exceeds the inline threshold (spec.md §3, invariant 3).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultPayload {
    Inline(serde_json::Value),
    Spilled { uri: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Execution {
    pub execution_id: Uuid,
    pub run_id: Uuid,

    pub node_id: String,
    pub target_name: String,

    pub status: ExecutionStatus,

    pub parent_execution_id: Option<Uuid>,
    pub session_id: Option<String>,
    pub actor_id: Option<String>,

    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub duration_ms: Option<i64>,

    pub result: Option<ResultPayload>,
    pub error: Option<String>,

    pub webhook_registered: bool,
}

impl Execution {
    pub fn new(
        execution_id: Uuid,
        run_id: Uuid,
        node_id: String,
        target_name: String,
        parent_execution_id: Option<Uuid>,
        session_id: Option<String>,
        actor_id: Option<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            execution_id,
            run_id,
            node_id,
            target_name,
            status: ExecutionStatus::Queued,
            parent_execution_id,
            session_id,
            actor_id,
            started_at: None,
            completed_at: None,
            created_at: now,
            updated_at: now,
            duration_ms: None,
            result: None,
            error: None,
            webhook_registered: false,
        }
    }

    /// Applies a status transition in place, enforcing monotonicity
    /// (spec.md §3 invariant 1) and the completed_at/duration_ms pairing
    /// (invariant 2). Returns `false` (no-op) if the execution was already
    /// terminal.
    pub fn transition(
        &mut self,
        new_status: ExecutionStatus,
        result: Option<ResultPayload>,
        error: Option<String>,
        duration_ms: Option<i64>,
        now: DateTime<Utc>,
    ) -> bool {
        self.transition_with_start(new_status, result, error, duration_ms, None, now)
    }

    /// Same as [`Execution::transition`], additionally recording
    /// `started_at` the first time the execution leaves `queued` (used by
    /// the sync dispatch path, spec.md §4.1 step 7).
    pub fn transition_with_start(
        &mut self,
        new_status: ExecutionStatus,
        result: Option<ResultPayload>,
        error: Option<String>,
        duration_ms: Option<i64>,
        started_at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> bool {
        if self.status.is_terminal() {
            self.updated_at = now;
            return false;
        }

        self.status = new_status;
        if self.started_at.is_none() {
            self.started_at = started_at.or(self.started_at);
        }
        if result.is_some() {
            self.result = result;
        }
        if error.is_some() {
            self.error = error;
        }

        if new_status.is_terminal() {
            self.completed_at = Some(self.completed_at.unwrap_or(now));
            self.duration_ms = Some(duration_ms.unwrap_or_else(|| {
                self.started_at
                    .map(|s| (now - s).num_milliseconds().max(0))
                    .unwrap_or(0)
            }));
        }

        self.updated_at = now;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_transition_is_monotone() {
        let now = Utc::now();
        let mut e = Execution::new(
            Uuid::new_v4(),
            Uuid::new_v4(),
            "node-1".into(),
            "reasoner-a".into(),
            None,
            None,
            None,
            now,
        );
        e.started_at = Some(now);
        assert!(e.transition(ExecutionStatus::Succeeded, None, None, None, now));
        assert_eq!(e.status, ExecutionStatus::Succeeded);
        assert!(e.completed_at.is_some());
        assert!(e.duration_ms.is_some());

        let applied = e.transition(
            ExecutionStatus::Failed,
            None,
            Some("late update".into()),
            None,
            now,
        );
        assert!(!applied);
        assert_eq!(e.status, ExecutionStatus::Succeeded);
    }
}
