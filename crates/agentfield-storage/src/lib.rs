//! Abstract transactional storage interface (spec.md §6 "Storage Interface").
//!
//! The core depends only on the operations declared here. Two
//! implementations are provided: [`memory::InMemoryStorage`] (default,
//! used by tests and standalone demos) and [`pg::PgStorage`] (Postgres via
//! `sqlx`, for a real deployment). Neither implementation is itself part
//! of the dispatch/durability core described in spec.md §1 — the core is
//! generic over the `Storage` trait.

pub mod memory;
pub mod payload;
pub mod pg;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use uuid::Uuid;

use agentfield_types::{
    Execution, ExecutionStatus, ExecutionVc, ExecutionWebhook, ResultPayload, WebhookEvent,
};

#[derive(Debug, Error, Clone)]
pub enum StorageError {
    #[error("storage backend error: {0}")]
    Backend(String),
}

/// External payload store for result bytes that exceed the inline
/// threshold (spec.md §3 invariant 3: "if result exceeds the
/// inline-payload threshold it is spilled to the payload store and only
/// the URI is kept in the row"). Grounded on the pack's `BlobStorage`
/// trait (`queue-keeper-core::blob_storage`) — reduced to the two
/// operations this system needs, store-and-get-by-uri.
#[async_trait]
pub trait PayloadStore: Send + Sync {
    /// Stores `bytes` and returns an opaque URI that `get` can resolve.
    async fn put(&self, bytes: Vec<u8>) -> Result<String, StorageError>;

    async fn get(&self, uri: &str) -> Result<Option<Vec<u8>>, StorageError>;
}

/// A requested status transition, applied atomically against the current
/// row by the storage implementation (spec.md §3 invariant 1, §5 "per
/// execution id, all state transitions are linearized through the
/// storage compare-and-swap").
#[derive(Debug, Clone)]
pub struct ExecutionTransition {
    pub status: ExecutionStatus,
    pub result: Option<ResultPayload>,
    pub error: Option<String>,
    pub duration_ms: Option<i64>,
    /// Recorded the first time the execution leaves `queued` (spec.md
    /// §4.1 step 7, sync dispatch sets status to `running`).
    pub started_at: Option<DateTime<Utc>>,
}

impl ExecutionTransition {
    pub fn to(status: ExecutionStatus) -> Self {
        Self {
            status,
            result: None,
            error: None,
            duration_ms: None,
            started_at: None,
        }
    }

    pub fn with_result(mut self, result: ResultPayload) -> Self {
        self.result = Some(result);
        self
    }

    pub fn with_error(mut self, error: String) -> Self {
        self.error = Some(error);
        self
    }

    pub fn with_duration_ms(mut self, duration_ms: i64) -> Self {
        self.duration_ms = Some(duration_ms);
        self
    }

    pub fn with_started_at(mut self, started_at: DateTime<Utc>) -> Self {
        self.started_at = Some(started_at);
        self
    }
}

/// Outcome of an attempted transition: the execution row after the
/// attempt, and whether this specific call is the one that pushed the
/// execution into a terminal state (used to emit exactly one
/// `completed` event per execution, spec.md §4.1).
#[derive(Debug, Clone)]
pub struct ExecutionUpdateOutcome {
    pub execution: Execution,
    pub became_terminal: bool,
}

#[derive(Debug, Clone, Default)]
pub struct VcFilter {
    pub execution_id: Option<Uuid>,
    pub workflow_id: Option<Uuid>,
    pub status: Option<ExecutionStatus>,
}

#[async_trait]
pub trait Storage: Send + Sync {
    // --- Execution records ---

    async fn create_execution(&self, execution: Execution) -> Result<(), StorageError>;

    async fn get_execution(&self, execution_id: Uuid) -> Result<Option<Execution>, StorageError>;

    /// Atomically applies `transition` to the execution identified by
    /// `execution_id`, unless it is already terminal (in which case only
    /// `updated_at` changes and `became_terminal` is `false`).
    /// Returns `Ok(None)` if no such execution exists.
    async fn update_execution(
        &self,
        execution_id: Uuid,
        transition: ExecutionTransition,
        now: DateTime<Utc>,
    ) -> Result<Option<ExecutionUpdateOutcome>, StorageError>;

    async fn batch_get_executions(
        &self,
        execution_ids: &[Uuid],
    ) -> Result<Vec<Option<Execution>>, StorageError>;

    // --- Webhook queue ---

    async fn create_webhook(&self, webhook: ExecutionWebhook) -> Result<(), StorageError>;

    async fn get_webhook(
        &self,
        execution_id: Uuid,
    ) -> Result<Option<ExecutionWebhook>, StorageError>;

    /// Rows with `status = pending` and `next_attempt_at <= now`, read-only
    /// (the poller's sweep, spec.md §4.4).
    async fn list_due_webhooks(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<ExecutionWebhook>, StorageError>;

    /// The sole mutual-exclusion primitive for webhook delivery: an atomic
    /// `pending -> delivering` compare-and-swap (spec.md §3, §4.4, §9).
    /// Returns `None` if the row wasn't in `pending` (lost the race, or
    /// already delivered/failed/cancelled).
    async fn try_lease_webhook(
        &self,
        execution_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Option<ExecutionWebhook>, StorageError>;

    async fn mark_webhook_delivered(
        &self,
        execution_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<(), StorageError>;

    async fn mark_webhook_retry(
        &self,
        execution_id: Uuid,
        next_attempt_at: DateTime<Utc>,
        attempt_count: i32,
        last_error: String,
        now: DateTime<Utc>,
    ) -> Result<(), StorageError>;

    async fn mark_webhook_failed(
        &self,
        execution_id: Uuid,
        attempt_count: i32,
        last_error: String,
        now: DateTime<Utc>,
    ) -> Result<(), StorageError>;

    /// Cancels a webhook row still in `pending` (never `delivering`),
    /// resolving the spec.md §9 open question: in-flight (delivering)
    /// webhooks cannot be unregistered.
    async fn cancel_pending_webhook(&self, execution_id: Uuid) -> Result<bool, StorageError>;

    async fn append_webhook_event(&self, event: WebhookEvent) -> Result<(), StorageError>;

    async fn list_webhook_events(
        &self,
        execution_id: Uuid,
    ) -> Result<Vec<WebhookEvent>, StorageError>;

    // --- VC storage (append-only) ---

    async fn put_vc(&self, vc: ExecutionVc) -> Result<(), StorageError>;

    async fn get_vc_by_execution(
        &self,
        execution_id: Uuid,
    ) -> Result<Option<ExecutionVc>, StorageError>;

    async fn query_vcs(&self, filter: VcFilter) -> Result<Vec<ExecutionVc>, StorageError>;

    async fn list_workflow_ids(&self) -> Result<Vec<Uuid>, StorageError>;

    async fn list_workflow_component_vcs(
        &self,
        workflow_id: Uuid,
    ) -> Result<Vec<ExecutionVc>, StorageError>;
}

/// Applies `transition` to `execution` in place following the same rules a
/// `Storage::update_execution` implementation must enforce. Shared by
/// every backend so the monotonicity invariant can't drift between them.
pub fn apply_transition(
    execution: &mut Execution,
    transition: &ExecutionTransition,
    now: DateTime<Utc>,
) -> bool {
    let was_terminal = execution.status.is_terminal();
    let applied = execution.transition_with_start(
        transition.status,
        transition.result.clone(),
        transition.error.clone(),
        transition.duration_ms,
        transition.started_at,
        now,
    );
    applied && !was_terminal && transition.status.is_terminal()
}
