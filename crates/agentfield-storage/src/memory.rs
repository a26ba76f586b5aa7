//! In-memory [`Storage`] implementation: the default backend for tests and
//! standalone demos, grounded on the teacher's `vdb::storage::InMemoryStorage`
//! (an `Arc<RwLock<HashMap<..>>>` guarded store).

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use agentfield_types::{Execution, ExecutionVc, ExecutionWebhook, WebhookEvent, WebhookStatus};

use crate::{apply_transition, ExecutionTransition, ExecutionUpdateOutcome, Storage, StorageError, VcFilter};

#[derive(Default)]
struct Inner {
    executions: HashMap<Uuid, Execution>,
    webhooks: HashMap<Uuid, ExecutionWebhook>,
    webhook_events: Vec<WebhookEvent>,
    vcs: HashMap<Uuid, ExecutionVc>,
}

/// Storage backend with no external dependency, suitable for tests and
/// for running the service without a database.
#[derive(Default)]
pub struct InMemoryStorage {
    inner: RwLock<Inner>,
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Storage for InMemoryStorage {
    async fn create_execution(&self, execution: Execution) -> Result<(), StorageError> {
        let mut inner = self.inner.write().unwrap();
        inner.executions.insert(execution.execution_id, execution);
        Ok(())
    }

    async fn get_execution(&self, execution_id: Uuid) -> Result<Option<Execution>, StorageError> {
        let inner = self.inner.read().unwrap();
        Ok(inner.executions.get(&execution_id).cloned())
    }

    async fn update_execution(
        &self,
        execution_id: Uuid,
        transition: ExecutionTransition,
        now: DateTime<Utc>,
    ) -> Result<Option<ExecutionUpdateOutcome>, StorageError> {
        let mut inner = self.inner.write().unwrap();
        let Some(execution) = inner.executions.get_mut(&execution_id) else {
            return Ok(None);
        };
        let became_terminal = apply_transition(execution, &transition, now);
        Ok(Some(ExecutionUpdateOutcome {
            execution: execution.clone(),
            became_terminal,
        }))
    }

    async fn batch_get_executions(
        &self,
        execution_ids: &[Uuid],
    ) -> Result<Vec<Option<Execution>>, StorageError> {
        let inner = self.inner.read().unwrap();
        Ok(execution_ids
            .iter()
            .map(|id| inner.executions.get(id).cloned())
            .collect())
    }

    async fn create_webhook(&self, webhook: ExecutionWebhook) -> Result<(), StorageError> {
        let mut inner = self.inner.write().unwrap();
        inner.webhooks.insert(webhook.execution_id, webhook);
        Ok(())
    }

    async fn get_webhook(
        &self,
        execution_id: Uuid,
    ) -> Result<Option<ExecutionWebhook>, StorageError> {
        let inner = self.inner.read().unwrap();
        Ok(inner.webhooks.get(&execution_id).cloned())
    }

    async fn list_due_webhooks(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<ExecutionWebhook>, StorageError> {
        let inner = self.inner.read().unwrap();
        let mut due: Vec<ExecutionWebhook> = inner
            .webhooks
            .values()
            .filter(|w| w.status == WebhookStatus::Pending && w.next_attempt_at <= now)
            .cloned()
            .collect();
        due.sort_by_key(|w| w.next_attempt_at);
        due.truncate(limit);
        Ok(due)
    }

    async fn try_lease_webhook(
        &self,
        execution_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Option<ExecutionWebhook>, StorageError> {
        let mut inner = self.inner.write().unwrap();
        let Some(webhook) = inner.webhooks.get_mut(&execution_id) else {
            return Ok(None);
        };
        if webhook.status != WebhookStatus::Pending {
            return Ok(None);
        }
        webhook.status = WebhookStatus::Delivering;
        webhook.last_attempt_at = Some(now);
        Ok(Some(webhook.clone()))
    }

    async fn mark_webhook_delivered(
        &self,
        execution_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<(), StorageError> {
        let mut inner = self.inner.write().unwrap();
        if let Some(webhook) = inner.webhooks.get_mut(&execution_id) {
            webhook.status = WebhookStatus::Delivered;
            webhook.last_attempt_at = Some(now);
            webhook.last_error = None;
        }
        Ok(())
    }

    async fn mark_webhook_retry(
        &self,
        execution_id: Uuid,
        next_attempt_at: DateTime<Utc>,
        attempt_count: i32,
        last_error: String,
        now: DateTime<Utc>,
    ) -> Result<(), StorageError> {
        let mut inner = self.inner.write().unwrap();
        if let Some(webhook) = inner.webhooks.get_mut(&execution_id) {
            webhook.status = WebhookStatus::Pending;
            webhook.attempt_count = attempt_count;
            webhook.next_attempt_at = next_attempt_at;
            webhook.last_attempt_at = Some(now);
            webhook.last_error = Some(last_error);
        }
        Ok(())
    }

    async fn mark_webhook_failed(
        &self,
        execution_id: Uuid,
        attempt_count: i32,
        last_error: String,
        now: DateTime<Utc>,
    ) -> Result<(), StorageError> {
        let mut inner = self.inner.write().unwrap();
        if let Some(webhook) = inner.webhooks.get_mut(&execution_id) {
            webhook.status = WebhookStatus::Failed;
            webhook.attempt_count = attempt_count;
            webhook.last_attempt_at = Some(now);
            webhook.last_error = Some(last_error);
        }
        Ok(())
    }

    async fn cancel_pending_webhook(&self, execution_id: Uuid) -> Result<bool, StorageError> {
        let mut inner = self.inner.write().unwrap();
        if let Some(webhook) = inner.webhooks.get_mut(&execution_id) {
            if webhook.status == WebhookStatus::Pending {
                webhook.status = WebhookStatus::Failed;
                webhook.last_error = Some("cancelled".to_string());
                return Ok(true);
            }
        }
        Ok(false)
    }

    async fn append_webhook_event(&self, event: WebhookEvent) -> Result<(), StorageError> {
        let mut inner = self.inner.write().unwrap();
        inner.webhook_events.push(event);
        Ok(())
    }

    async fn list_webhook_events(
        &self,
        execution_id: Uuid,
    ) -> Result<Vec<WebhookEvent>, StorageError> {
        let inner = self.inner.read().unwrap();
        Ok(inner
            .webhook_events
            .iter()
            .filter(|e| e.execution_id == execution_id)
            .cloned()
            .collect())
    }

    async fn put_vc(&self, vc: ExecutionVc) -> Result<(), StorageError> {
        let mut inner = self.inner.write().unwrap();
        inner.vcs.insert(vc.execution_id, vc);
        Ok(())
    }

    async fn get_vc_by_execution(
        &self,
        execution_id: Uuid,
    ) -> Result<Option<ExecutionVc>, StorageError> {
        let inner = self.inner.read().unwrap();
        Ok(inner.vcs.get(&execution_id).cloned())
    }

    async fn query_vcs(&self, filter: VcFilter) -> Result<Vec<ExecutionVc>, StorageError> {
        let inner = self.inner.read().unwrap();
        Ok(inner
            .vcs
            .values()
            .filter(|vc| {
                filter
                    .execution_id
                    .map(|id| id == vc.execution_id)
                    .unwrap_or(true)
                    && filter
                        .workflow_id
                        .map(|id| id == vc.workflow_id)
                        .unwrap_or(true)
                    && filter.status.map(|s| s == vc.status).unwrap_or(true)
            })
            .cloned()
            .collect())
    }

    async fn list_workflow_ids(&self) -> Result<Vec<Uuid>, StorageError> {
        let inner = self.inner.read().unwrap();
        let mut ids: Vec<Uuid> = inner.vcs.values().map(|vc| vc.workflow_id).collect();
        ids.sort();
        ids.dedup();
        Ok(ids)
    }

    async fn list_workflow_component_vcs(
        &self,
        workflow_id: Uuid,
    ) -> Result<Vec<ExecutionVc>, StorageError> {
        let inner = self.inner.read().unwrap();
        let mut components: Vec<ExecutionVc> = inner
            .vcs
            .values()
            .filter(|vc| vc.workflow_id == workflow_id)
            .cloned()
            .collect();
        components.sort_by_key(|vc| vc.created_at);
        Ok(components)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use agentfield_types::ExecutionStatus;

    fn new_execution() -> Execution {
        Execution::new(
            Uuid::new_v4(),
            Uuid::new_v4(),
            "node-1".into(),
            "reasoner-a".into(),
            None,
            None,
            None,
            Utc::now(),
        )
    }

    #[tokio::test]
    async fn lease_is_exclusive() {
        let storage = InMemoryStorage::new();
        let execution = new_execution();
        let webhook = ExecutionWebhook::new(
            execution.execution_id,
            agentfield_types::WebhookSpec {
                url: "https://example.com/hook".into(),
                secret: None,
                headers: Default::default(),
            },
            Utc::now(),
        );
        storage.create_webhook(webhook).await.unwrap();

        let first = storage
            .try_lease_webhook(execution.execution_id, Utc::now())
            .await
            .unwrap();
        assert!(first.is_some());

        let second = storage
            .try_lease_webhook(execution.execution_id, Utc::now())
            .await
            .unwrap();
        assert!(second.is_none());
    }

    #[tokio::test]
    async fn update_execution_is_monotone() {
        let storage = InMemoryStorage::new();
        let execution = new_execution();
        storage.create_execution(execution.clone()).await.unwrap();

        let outcome = storage
            .update_execution(
                execution.execution_id,
                ExecutionTransition {
                    status: ExecutionStatus::Succeeded,
                    result: None,
                    error: None,
                    duration_ms: Some(10),
                    started_at: None,
                },
                Utc::now(),
            )
            .await
            .unwrap()
            .unwrap();
        assert!(outcome.became_terminal);

        let second = storage
            .update_execution(
                execution.execution_id,
                ExecutionTransition {
                    status: ExecutionStatus::Failed,
                    result: None,
                    error: Some("late".into()),
                    duration_ms: None,
                    started_at: None,
                },
                Utc::now(),
            )
            .await
            .unwrap()
            .unwrap();
        assert!(!second.became_terminal);
        assert_eq!(second.execution.status, ExecutionStatus::Succeeded);
    }
}
