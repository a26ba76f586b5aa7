//! Postgres-backed [`Storage`], grounded on the teacher's `webhooks.rs` /
//! `worker_loop.rs` lease pattern: a `FOR UPDATE SKIP LOCKED`-guarded
//! `pending -> delivering` compare-and-swap so exactly one dispatcher
//! worker ever holds a given webhook's lease at a time.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value as Json;
use sqlx::{postgres::PgPoolOptions, PgPool, Row};
use std::collections::BTreeMap;
use uuid::Uuid;

use agentfield_types::{
    Execution, ExecutionStatus, ExecutionVc, ExecutionWebhook, ResultPayload, WebhookEvent,
    WebhookStatus,
};

use crate::{ExecutionTransition, ExecutionUpdateOutcome, Storage, StorageError, VcFilter};

pub struct PgStorage {
    pool: PgPool,
}

impl PgStorage {
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, StorageError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn migrate(&self) -> Result<(), StorageError> {
        sqlx::migrate!("../../services/orchestrator/migrations")
            .run(&self.pool)
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))
    }
}

fn result_to_json(result: &Option<ResultPayload>) -> Option<Json> {
    result.as_ref().map(|r| serde_json::to_value(r).unwrap())
}

fn json_to_result(value: Option<Json>) -> Option<ResultPayload> {
    value.and_then(|v| serde_json::from_value(v).ok())
}

fn headers_to_json(headers: &BTreeMap<String, String>) -> Json {
    serde_json::to_value(headers).unwrap_or(Json::Object(Default::default()))
}

fn json_to_headers(value: Json) -> BTreeMap<String, String> {
    serde_json::from_value(value).unwrap_or_default()
}

fn row_to_execution(row: &sqlx::postgres::PgRow) -> Result<Execution, StorageError> {
    Ok(Execution {
        execution_id: row.try_get("execution_id").map_err(pg_err)?,
        run_id: row.try_get("run_id").map_err(pg_err)?,
        node_id: row.try_get("node_id").map_err(pg_err)?,
        target_name: row.try_get("target_name").map_err(pg_err)?,
        status: row.try_get("status").map_err(pg_err)?,
        parent_execution_id: row.try_get("parent_execution_id").map_err(pg_err)?,
        session_id: row.try_get("session_id").map_err(pg_err)?,
        actor_id: row.try_get("actor_id").map_err(pg_err)?,
        started_at: row.try_get("started_at").map_err(pg_err)?,
        completed_at: row.try_get("completed_at").map_err(pg_err)?,
        created_at: row.try_get("created_at").map_err(pg_err)?,
        updated_at: row.try_get("updated_at").map_err(pg_err)?,
        duration_ms: row.try_get("duration_ms").map_err(pg_err)?,
        result: json_to_result(row.try_get("result").map_err(pg_err)?),
        error: row.try_get("error").map_err(pg_err)?,
        webhook_registered: row.try_get("webhook_registered").map_err(pg_err)?,
    })
}

fn row_to_webhook(row: &sqlx::postgres::PgRow) -> Result<ExecutionWebhook, StorageError> {
    Ok(ExecutionWebhook {
        execution_id: row.try_get("execution_id").map_err(pg_err)?,
        url: row.try_get("url").map_err(pg_err)?,
        secret: row.try_get("secret").map_err(pg_err)?,
        headers: json_to_headers(row.try_get("headers").map_err(pg_err)?),
        status: row.try_get("status").map_err(pg_err)?,
        attempt_count: row.try_get("attempt_count").map_err(pg_err)?,
        next_attempt_at: row.try_get("next_attempt_at").map_err(pg_err)?,
        last_attempt_at: row.try_get("last_attempt_at").map_err(pg_err)?,
        last_error: row.try_get("last_error").map_err(pg_err)?,
    })
}

fn row_to_vc(row: &sqlx::postgres::PgRow) -> Result<ExecutionVc, StorageError> {
    Ok(ExecutionVc {
        vc_id: row.try_get("vc_id").map_err(pg_err)?,
        execution_id: row.try_get("execution_id").map_err(pg_err)?,
        workflow_id: row.try_get("workflow_id").map_err(pg_err)?,
        session_id: row.try_get("session_id").map_err(pg_err)?,
        issuer_did: row.try_get("issuer_did").map_err(pg_err)?,
        target_did: row.try_get("target_did").map_err(pg_err)?,
        caller_did: row.try_get("caller_did").map_err(pg_err)?,
        input_hash: row.try_get("input_hash").map_err(pg_err)?,
        output_hash: row.try_get("output_hash").map_err(pg_err)?,
        status: row.try_get("status").map_err(pg_err)?,
        vc_document: row.try_get("vc_document").map_err(pg_err)?,
        signature: row.try_get("signature").map_err(pg_err)?,
        storage_uri: row.try_get("storage_uri").map_err(pg_err)?,
        document_size: row.try_get::<i64, _>("document_size").map_err(pg_err)? as usize,
        created_at: row.try_get("created_at").map_err(pg_err)?,
    })
}

fn pg_err(e: sqlx::Error) -> StorageError {
    StorageError::Backend(e.to_string())
}

#[async_trait]
impl Storage for PgStorage {
    async fn create_execution(&self, execution: Execution) -> Result<(), StorageError> {
        sqlx::query(
            r#"
            INSERT INTO executions (
                execution_id, run_id, node_id, target_name, status,
                parent_execution_id, session_id, actor_id,
                started_at, completed_at, created_at, updated_at, duration_ms,
                result, error, webhook_registered
            ) VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11,$12,$13,$14,$15,$16)
            "#,
        )
        .bind(execution.execution_id)
        .bind(execution.run_id)
        .bind(&execution.node_id)
        .bind(&execution.target_name)
        .bind(execution.status)
        .bind(execution.parent_execution_id)
        .bind(&execution.session_id)
        .bind(&execution.actor_id)
        .bind(execution.started_at)
        .bind(execution.completed_at)
        .bind(execution.created_at)
        .bind(execution.updated_at)
        .bind(execution.duration_ms)
        .bind(result_to_json(&execution.result))
        .bind(&execution.error)
        .bind(execution.webhook_registered)
        .execute(&self.pool)
        .await
        .map_err(pg_err)?;
        Ok(())
    }

    async fn get_execution(&self, execution_id: Uuid) -> Result<Option<Execution>, StorageError> {
        let row = sqlx::query("SELECT * FROM executions WHERE execution_id = $1")
            .bind(execution_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(pg_err)?;
        row.as_ref().map(row_to_execution).transpose()
    }

    async fn update_execution(
        &self,
        execution_id: Uuid,
        transition: ExecutionTransition,
        now: DateTime<Utc>,
    ) -> Result<Option<ExecutionUpdateOutcome>, StorageError> {
        let mut tx = self.pool.begin().await.map_err(pg_err)?;

        let row = sqlx::query("SELECT * FROM executions WHERE execution_id = $1 FOR UPDATE")
            .bind(execution_id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(pg_err)?;
        let Some(row) = row else {
            tx.rollback().await.ok();
            return Ok(None);
        };
        let mut execution = row_to_execution(&row)?;

        let became_terminal = crate::apply_transition(&mut execution, &transition, now);

        sqlx::query(
            r#"
            UPDATE executions SET
                status = $1, result = COALESCE($2, result), error = COALESCE($3, error),
                completed_at = $4, duration_ms = $5, updated_at = $6
            WHERE execution_id = $7
            "#,
        )
        .bind(execution.status)
        .bind(result_to_json(&execution.result))
        .bind(&execution.error)
        .bind(execution.completed_at)
        .bind(execution.duration_ms)
        .bind(execution.updated_at)
        .bind(execution_id)
        .execute(&mut *tx)
        .await
        .map_err(pg_err)?;

        tx.commit().await.map_err(pg_err)?;
        Ok(Some(ExecutionUpdateOutcome {
            execution,
            became_terminal,
        }))
    }

    async fn batch_get_executions(
        &self,
        execution_ids: &[Uuid],
    ) -> Result<Vec<Option<Execution>>, StorageError> {
        let rows = sqlx::query("SELECT * FROM executions WHERE execution_id = ANY($1)")
            .bind(execution_ids)
            .fetch_all(&self.pool)
            .await
            .map_err(pg_err)?;
        let mut found = std::collections::HashMap::new();
        for row in &rows {
            let execution = row_to_execution(row)?;
            found.insert(execution.execution_id, execution);
        }
        Ok(execution_ids.iter().map(|id| found.get(id).cloned()).collect())
    }

    async fn create_webhook(&self, webhook: ExecutionWebhook) -> Result<(), StorageError> {
        sqlx::query(
            r#"
            INSERT INTO execution_webhooks (
                execution_id, url, secret, headers, status,
                attempt_count, next_attempt_at, last_attempt_at, last_error
            ) VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9)
            "#,
        )
        .bind(webhook.execution_id)
        .bind(&webhook.url)
        .bind(&webhook.secret)
        .bind(headers_to_json(&webhook.headers))
        .bind(webhook.status)
        .bind(webhook.attempt_count)
        .bind(webhook.next_attempt_at)
        .bind(webhook.last_attempt_at)
        .bind(&webhook.last_error)
        .execute(&self.pool)
        .await
        .map_err(pg_err)?;
        Ok(())
    }

    async fn get_webhook(
        &self,
        execution_id: Uuid,
    ) -> Result<Option<ExecutionWebhook>, StorageError> {
        let row = sqlx::query("SELECT * FROM execution_webhooks WHERE execution_id = $1")
            .bind(execution_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(pg_err)?;
        row.as_ref().map(row_to_webhook).transpose()
    }

    async fn list_due_webhooks(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<ExecutionWebhook>, StorageError> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM execution_webhooks
            WHERE status = 'pending' AND next_attempt_at <= $1
            ORDER BY next_attempt_at
            LIMIT $2
            "#,
        )
        .bind(now)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(pg_err)?;
        rows.iter().map(row_to_webhook).collect()
    }

    async fn try_lease_webhook(
        &self,
        execution_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Option<ExecutionWebhook>, StorageError> {
        let mut tx = self.pool.begin().await.map_err(pg_err)?;

        let row = sqlx::query(
            r#"
            SELECT * FROM execution_webhooks
            WHERE execution_id = $1 AND status = 'pending'
            FOR UPDATE SKIP LOCKED
            "#,
        )
        .bind(execution_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(pg_err)?;

        let Some(row) = row else {
            tx.rollback().await.ok();
            return Ok(None);
        };
        let mut webhook = row_to_webhook(&row)?;

        sqlx::query(
            "UPDATE execution_webhooks SET status = 'delivering', last_attempt_at = $1 WHERE execution_id = $2",
        )
        .bind(now)
        .bind(execution_id)
        .execute(&mut *tx)
        .await
        .map_err(pg_err)?;

        tx.commit().await.map_err(pg_err)?;

        webhook.status = WebhookStatus::Delivering;
        webhook.last_attempt_at = Some(now);
        Ok(Some(webhook))
    }

    async fn mark_webhook_delivered(
        &self,
        execution_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<(), StorageError> {
        sqlx::query(
            "UPDATE execution_webhooks SET status = 'delivered', last_attempt_at = $1, last_error = NULL WHERE execution_id = $2",
        )
        .bind(now)
        .bind(execution_id)
        .execute(&self.pool)
        .await
        .map_err(pg_err)?;
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
        sqlx::query(
            r#"
            UPDATE execution_webhooks SET
                status = 'pending', attempt_count = $1, next_attempt_at = $2,
                last_attempt_at = $3, last_error = $4
            WHERE execution_id = $5
            "#,
        )
        .bind(attempt_count)
        .bind(next_attempt_at)
        .bind(now)
        .bind(last_error)
        .bind(execution_id)
        .execute(&self.pool)
        .await
        .map_err(pg_err)?;
        Ok(())
    }

    async fn mark_webhook_failed(
        &self,
        execution_id: Uuid,
        attempt_count: i32,
        last_error: String,
        now: DateTime<Utc>,
    ) -> Result<(), StorageError> {
        sqlx::query(
            r#"
            UPDATE execution_webhooks SET
                status = 'failed', attempt_count = $1, last_attempt_at = $2, last_error = $3
            WHERE execution_id = $4
            "#,
        )
        .bind(attempt_count)
        .bind(now)
        .bind(last_error)
        .bind(execution_id)
        .execute(&self.pool)
        .await
        .map_err(pg_err)?;
        Ok(())
    }

    async fn cancel_pending_webhook(&self, execution_id: Uuid) -> Result<bool, StorageError> {
        let result = sqlx::query(
            "UPDATE execution_webhooks SET status = 'failed', last_error = 'cancelled' WHERE execution_id = $1 AND status = 'pending'",
        )
        .bind(execution_id)
        .execute(&self.pool)
        .await
        .map_err(pg_err)?;
        Ok(result.rows_affected() > 0)
    }

    async fn append_webhook_event(&self, event: WebhookEvent) -> Result<(), StorageError> {
        sqlx::query(
            r#"
            INSERT INTO webhook_events (
                execution_id, attempt, http_status, response_body_prefix, error, timestamp
            ) VALUES ($1,$2,$3,$4,$5,$6)
            "#,
        )
        .bind(event.execution_id)
        .bind(event.attempt)
        .bind(event.http_status.map(|s| s as i32))
        .bind(&event.response_body_prefix)
        .bind(&event.error)
        .bind(event.timestamp)
        .execute(&self.pool)
        .await
        .map_err(pg_err)?;
        Ok(())
    }

    async fn list_webhook_events(
        &self,
        execution_id: Uuid,
    ) -> Result<Vec<WebhookEvent>, StorageError> {
        let rows = sqlx::query(
            "SELECT * FROM webhook_events WHERE execution_id = $1 ORDER BY attempt",
        )
        .bind(execution_id)
        .fetch_all(&self.pool)
        .await
        .map_err(pg_err)?;
        rows.iter()
            .map(|row| {
                Ok(WebhookEvent {
                    execution_id: row.try_get("execution_id").map_err(pg_err)?,
                    attempt: row.try_get("attempt").map_err(pg_err)?,
                    http_status: row
                        .try_get::<Option<i32>, _>("http_status")
                        .map_err(pg_err)?
                        .map(|s| s as u16),
                    response_body_prefix: row.try_get("response_body_prefix").map_err(pg_err)?,
                    error: row.try_get("error").map_err(pg_err)?,
                    timestamp: row.try_get("timestamp").map_err(pg_err)?,
                })
            })
            .collect()
    }

    async fn put_vc(&self, vc: ExecutionVc) -> Result<(), StorageError> {
        sqlx::query(
            r#"
            INSERT INTO execution_vcs (
                vc_id, execution_id, workflow_id, session_id, issuer_did, target_did,
                caller_did, input_hash, output_hash, status, vc_document, signature,
                storage_uri, document_size, created_at
            ) VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11,$12,$13,$14,$15)
            "#,
        )
        .bind(vc.vc_id)
        .bind(vc.execution_id)
        .bind(vc.workflow_id)
        .bind(&vc.session_id)
        .bind(&vc.issuer_did)
        .bind(&vc.target_did)
        .bind(&vc.caller_did)
        .bind(&vc.input_hash)
        .bind(&vc.output_hash)
        .bind(vc.status)
        .bind(&vc.vc_document)
        .bind(&vc.signature)
        .bind(&vc.storage_uri)
        .bind(vc.document_size as i64)
        .bind(vc.created_at)
        .execute(&self.pool)
        .await
        .map_err(pg_err)?;
        Ok(())
    }

    async fn get_vc_by_execution(
        &self,
        execution_id: Uuid,
    ) -> Result<Option<ExecutionVc>, StorageError> {
        let row = sqlx::query("SELECT * FROM execution_vcs WHERE execution_id = $1")
            .bind(execution_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(pg_err)?;
        row.as_ref().map(row_to_vc).transpose()
    }

    async fn query_vcs(&self, filter: VcFilter) -> Result<Vec<ExecutionVc>, StorageError> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM execution_vcs
            WHERE ($1::uuid IS NULL OR execution_id = $1)
              AND ($2::uuid IS NULL OR workflow_id = $2)
              AND ($3::text IS NULL OR status = $3)
            ORDER BY created_at
            "#,
        )
        .bind(filter.execution_id)
        .bind(filter.workflow_id)
        .bind(filter.status.map(|s: ExecutionStatus| s.as_str()))
        .fetch_all(&self.pool)
        .await
        .map_err(pg_err)?;
        rows.iter().map(row_to_vc).collect()
    }

    async fn list_workflow_ids(&self) -> Result<Vec<Uuid>, StorageError> {
        let rows = sqlx::query("SELECT DISTINCT workflow_id FROM execution_vcs ORDER BY workflow_id")
            .fetch_all(&self.pool)
            .await
            .map_err(pg_err)?;
        rows.iter()
            .map(|row| row.try_get("workflow_id").map_err(pg_err))
            .collect()
    }

    async fn list_workflow_component_vcs(
        &self,
        workflow_id: Uuid,
    ) -> Result<Vec<ExecutionVc>, StorageError> {
        let rows = sqlx::query(
            "SELECT * FROM execution_vcs WHERE workflow_id = $1 ORDER BY created_at",
        )
        .bind(workflow_id)
        .fetch_all(&self.pool)
        .await
        .map_err(pg_err)?;
        rows.iter().map(row_to_vc).collect()
    }
}
