//! Webhook dispatcher (spec.md §4.4): a claim -> sign -> send ->
//! record-result pipeline split into a poller, a bounded channel of
//! signed requests, a pool of sender tasks gated by a semaphore, and a
//! result channel drained back into storage updates. Shape lifted
//! directly from the pack's `dwctl` webhook dispatcher, adapted from its
//! Postgres claim query to this system's `Storage::try_lease_webhook`
//! CAS and from a tick-driven loop to one internal poll/notify loop.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use reqwest::Client;
use serde_json::json;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex, Notify, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use agentfield_storage::Storage;
use agentfield_types::{Execution, ExecutionStatus, ExecutionWebhook, ResultPayload, WebhookEvent};

use crate::backoff::{compute_backoff, parse_retry_after};
use crate::signing::sign;

#[derive(Debug, Clone)]
pub struct WebhookDispatcherConfig {
    pub timeout: Duration,
    pub max_attempts: i32,
    pub retry_backoff: Duration,
    pub max_retry_backoff: Duration,
    pub poll_interval: Duration,
    pub poll_batch_size: usize,
    pub worker_count: usize,
    pub queue_size: usize,
    pub response_body_limit: usize,
}

impl Default for WebhookDispatcherConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            max_attempts: 8,
            retry_backoff: Duration::from_secs(5),
            max_retry_backoff: Duration::from_secs(600),
            poll_interval: Duration::from_secs(2),
            poll_batch_size: 50,
            worker_count: 8,
            queue_size: 256,
            response_body_limit: 2048,
        }
    }
}

#[derive(Debug, Error)]
pub enum WebhookError {
    #[error("webhook dispatcher not started")]
    NotStarted,
}

struct SignedRequest {
    execution_id: Uuid,
    url: String,
    headers: Vec<(String, String)>,
    body: Vec<u8>,
    attempt: i32,
}

struct SendResult {
    execution_id: Uuid,
    attempt: i32,
    http_status: Option<u16>,
    response_body_prefix: String,
    error: Option<String>,
    retry_after: Option<Duration>,
}

struct RunningState {
    cancellation: CancellationToken,
    notify: Arc<Notify>,
    poller: tokio::task::JoinHandle<()>,
    sender: tokio::task::JoinHandle<()>,
}

/// `Start`/`Stop` are idempotent (spec.md §4.4). `Notify` on a stopped
/// dispatcher fails with [`WebhookError::NotStarted`].
pub struct WebhookDispatcher {
    storage: Arc<dyn Storage>,
    config: WebhookDispatcherConfig,
    client: Client,
    state: Mutex<Option<RunningState>>,
}

impl WebhookDispatcher {
    pub fn new(storage: Arc<dyn Storage>, config: WebhookDispatcherConfig) -> Self {
        let client = Client::builder()
            .timeout(config.timeout)
            .build()
            .expect("webhook HTTP client builds with a fixed timeout");
        Self {
            storage,
            config,
            client,
            state: Mutex::new(None),
        }
    }

    pub async fn start(&self) {
        let mut state = self.state.lock().await;
        if state.is_some() {
            return;
        }

        let cancellation = CancellationToken::new();
        let notify = Arc::new(Notify::new());
        let (send_tx, send_rx) = mpsc::channel::<SignedRequest>(self.config.queue_size);
        let (result_tx, result_rx) = mpsc::channel::<SendResult>(self.config.queue_size);

        let sender = tokio::spawn(run_sender(
            send_rx,
            result_tx,
            self.client.clone(),
            self.config.worker_count,
            self.config.response_body_limit,
            cancellation.clone(),
        ));

        let poller = tokio::spawn(run_poller(
            self.storage.clone(),
            self.config.clone(),
            send_tx,
            result_rx,
            notify.clone(),
            cancellation.clone(),
        ));

        info!("webhook dispatcher started");
        *state = Some(RunningState {
            cancellation,
            notify,
            poller,
            sender,
        });
    }

    /// Hints the poller to sweep immediately rather than waiting for the
    /// next `poll_interval`. Best-effort — the poller would find the row
    /// on its own sweep regardless.
    pub async fn notify(&self, execution_id: Uuid) -> Result<(), WebhookError> {
        let state = self.state.lock().await;
        match state.as_ref() {
            Some(running) => {
                debug!(%execution_id, "webhook dispatcher notified");
                running.notify.notify_one();
                Ok(())
            }
            None => Err(WebhookError::NotStarted),
        }
    }

    /// Cancels a `pending` webhook row directly (spec.md §9, `SPEC_FULL.md`
    /// §4.4b): used when the owning execution is cancelled.
    pub async fn cancel_pending(&self, execution_id: Uuid) -> Result<bool, agentfield_storage::StorageError> {
        self.storage.cancel_pending_webhook(execution_id).await
    }

    pub async fn stop(&self, deadline: Duration) {
        let mut state = self.state.lock().await;
        if let Some(running) = state.take() {
            running.cancellation.cancel();
            let _ = tokio::time::timeout(deadline, async {
                let _ = running.poller.await;
                let _ = running.sender.await;
            })
            .await;
            info!("webhook dispatcher stopped");
        }
    }
}

async fn run_poller(
    storage: Arc<dyn Storage>,
    config: WebhookDispatcherConfig,
    send_tx: mpsc::Sender<SignedRequest>,
    mut result_rx: mpsc::Receiver<SendResult>,
    notify: Arc<Notify>,
    cancellation: CancellationToken,
) {
    loop {
        tokio::select! {
            biased;
            _ = cancellation.cancelled() => {
                debug!("webhook poller shutting down");
                return;
            }
            _ = tokio::time::sleep(config.poll_interval) => {}
            _ = notify.notified() => {}
        }

        sweep_due_webhooks(&storage, &config, &send_tx).await;
        drain_results(&storage, &config, &mut result_rx).await;
    }
}

async fn sweep_due_webhooks(
    storage: &Arc<dyn Storage>,
    config: &WebhookDispatcherConfig,
    send_tx: &mpsc::Sender<SignedRequest>,
) {
    let due = match storage.list_due_webhooks(Utc::now(), config.poll_batch_size).await {
        Ok(rows) => rows,
        Err(e) => {
            warn!(error = %e, "webhook poller: failed to list due webhooks");
            return;
        }
    };

    for webhook in due {
        let leased = match storage.try_lease_webhook(webhook.execution_id, Utc::now()).await {
            Ok(Some(webhook)) => webhook,
            Ok(None) => continue,
            Err(e) => {
                warn!(error = %e, execution_id = %webhook.execution_id, "webhook poller: lease failed");
                continue;
            }
        };

        let execution = match storage.get_execution(leased.execution_id).await {
            Ok(Some(execution)) => execution,
            Ok(None) => {
                warn!(execution_id = %leased.execution_id, "webhook poller: execution record missing, failing webhook");
                let _ = storage
                    .mark_webhook_failed(leased.execution_id, leased.attempt_count, "execution record missing".to_string(), Utc::now())
                    .await;
                continue;
            }
            Err(e) => {
                warn!(error = %e, execution_id = %leased.execution_id, "webhook poller: failed to load execution");
                continue;
            }
        };

        let request = match build_signed_request(&leased, &execution) {
            Ok(request) => request,
            Err(e) => {
                warn!(error = %e, execution_id = %leased.execution_id, "webhook poller: failed to build request, marking failed");
                let _ = storage
                    .mark_webhook_failed(leased.execution_id, leased.attempt_count, e, Utc::now())
                    .await;
                continue;
            }
        };

        if send_tx.try_send(request).is_err() {
            warn!(execution_id = %leased.execution_id, "webhook poller: sender channel full, will retry next sweep");
            let _ = storage
                .mark_webhook_retry(
                    leased.execution_id,
                    Utc::now() + chrono::Duration::seconds(1),
                    leased.attempt_count,
                    "sender channel saturated".to_string(),
                    Utc::now(),
                )
                .await;
        }
    }
}

/// `{event, execution_id, run_id, status, result or error, started_at,
/// completed_at, duration_ms, attempt}` (spec.md §4.4 step 2).
fn build_signed_request(webhook: &ExecutionWebhook, execution: &Execution) -> Result<SignedRequest, String> {
    let event = if execution.status == ExecutionStatus::Succeeded {
        "execution.completed"
    } else {
        "execution.failed"
    };

    let mut payload = json!({
        "event": event,
        "execution_id": execution.execution_id,
        "run_id": execution.run_id,
        "status": execution.status.as_str(),
        "started_at": execution.started_at,
        "completed_at": execution.completed_at,
        "duration_ms": execution.duration_ms,
        "attempt": webhook.attempt_count + 1,
    });

    match &execution.result {
        Some(ResultPayload::Inline(value)) => payload["result"] = value.clone(),
        Some(ResultPayload::Spilled { uri }) => payload["result"] = json!({"uri": uri}),
        None => {}
    }
    if let Some(error) = &execution.error {
        payload["error"] = json!(error);
    }

    let body = serde_json::to_vec(&payload).map_err(|e| e.to_string())?;

    let mut headers: Vec<(String, String)> = vec![("Content-Type".to_string(), "application/json".to_string())];
    if let Some(secret) = &webhook.secret {
        headers.push(("X-AgentField-Signature".to_string(), sign(secret, &body)));
    }
    for (key, value) in &webhook.headers {
        headers.push((key.clone(), value.clone()));
    }

    Ok(SignedRequest {
        execution_id: webhook.execution_id,
        url: webhook.url.clone(),
        headers,
        body,
        attempt: webhook.attempt_count + 1,
    })
}

async fn drain_results(storage: &Arc<dyn Storage>, config: &WebhookDispatcherConfig, result_rx: &mut mpsc::Receiver<SendResult>) {
    while let Ok(result) = result_rx.try_recv() {
        let body_prefix = result.response_body_prefix;
        let event = WebhookEvent {
            execution_id: result.execution_id,
            attempt: result.attempt,
            http_status: result.http_status,
            response_body_prefix: body_prefix,
            error: result.error.clone(),
            timestamp: Utc::now(),
        };
        if let Err(e) = storage.append_webhook_event(event).await {
            warn!(error = %e, execution_id = %result.execution_id, "failed to append webhook event");
        }

        let delivered = matches!(result.http_status, Some(status) if (200..300).contains(&status));
        if delivered {
            if let Err(e) = storage.mark_webhook_delivered(result.execution_id, Utc::now()).await {
                warn!(error = %e, execution_id = %result.execution_id, "failed to mark webhook delivered");
            }
            continue;
        }

        if result.attempt >= config.max_attempts {
            let message = result.error.clone().unwrap_or_else(|| "max attempts reached".to_string());
            if let Err(e) = storage.mark_webhook_failed(result.execution_id, result.attempt, message, Utc::now()).await {
                warn!(error = %e, execution_id = %result.execution_id, "failed to mark webhook failed");
            }
            continue;
        }

        let delay = compute_backoff(result.attempt, config.retry_backoff, config.max_retry_backoff, result.retry_after);
        let next_attempt_at = Utc::now() + chrono::Duration::from_std(delay).unwrap_or_default();
        let message = result.error.unwrap_or_else(|| "non-2xx response".to_string());
        if let Err(e) = storage
            .mark_webhook_retry(result.execution_id, next_attempt_at, result.attempt, message, Utc::now())
            .await
        {
            warn!(error = %e, execution_id = %result.execution_id, "failed to schedule webhook retry");
        }
    }
}

async fn run_sender(
    mut send_rx: mpsc::Receiver<SignedRequest>,
    result_tx: mpsc::Sender<SendResult>,
    client: Client,
    worker_count: usize,
    response_body_limit: usize,
    cancellation: CancellationToken,
) {
    let semaphore = Arc::new(Semaphore::new(worker_count.max(1)));

    loop {
        let request = tokio::select! {
            biased;
            _ = cancellation.cancelled() => {
                debug!("webhook sender shutting down");
                return;
            }
            request = send_rx.recv() => match request {
                Some(request) => request,
                None => return,
            },
        };

        let permit = match semaphore.clone().acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => return,
        };
        let client = client.clone();
        let result_tx = result_tx.clone();

        tokio::spawn(async move {
            let _permit = permit;
            let result = send_one(&client, &request, response_body_limit).await;
            let _ = result_tx.send(result).await;
        });
    }
}

async fn send_one(client: &Client, request: &SignedRequest, response_body_limit: usize) -> SendResult {
    let mut builder = client.post(&request.url).body(request.body.clone());
    for (key, value) in &request.headers {
        builder = builder.header(key, value);
    }

    match builder.send().await {
        Ok(response) => {
            let status = response.status();
            let retry_after = response
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(parse_retry_after);
            let body = response.text().await.unwrap_or_default();
            let prefix: String = body.chars().take(response_body_limit).collect();

            SendResult {
                execution_id: request.execution_id,
                attempt: request.attempt,
                http_status: Some(status.as_u16()),
                response_body_prefix: prefix,
                error: if status.is_success() {
                    None
                } else {
                    Some(format!("webhook receiver returned {status}"))
                },
                retry_after,
            }
        }
        Err(e) => SendResult {
            execution_id: request.execution_id,
            attempt: request.attempt,
            http_status: None,
            response_body_prefix: String::new(),
            error: Some(e.to_string()),
            retry_after: None,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use agentfield_storage::memory::InMemoryStorage;
    use agentfield_types::WebhookSpec;
    use std::collections::BTreeMap;
    use wiremock::matchers::{header_exists, method};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn seed_succeeded_execution(storage: &Arc<dyn Storage>, execution_id: Uuid) {
        let mut execution = Execution::new(execution_id, Uuid::new_v4(), "node-1".into(), "reasoner-a".into(), None, None, None, Utc::now());
        execution.status = ExecutionStatus::Succeeded;
        execution.completed_at = Some(Utc::now());
        execution.duration_ms = Some(5);
        execution.result = Some(ResultPayload::Inline(json!({"answer": 42})));
        storage.create_execution(execution).await.unwrap();
    }

    #[tokio::test]
    async fn delivers_signed_webhook_and_marks_delivered() {
        let mock_server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(header_exists("X-AgentField-Signature"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&mock_server)
            .await;

        let storage: Arc<dyn Storage> = Arc::new(InMemoryStorage::new());
        let execution_id = Uuid::new_v4();
        seed_succeeded_execution(&storage, execution_id).await;
        storage
            .create_webhook(ExecutionWebhook::new(
                execution_id,
                WebhookSpec {
                    url: format!("{}/hook", mock_server.uri()),
                    secret: Some("test-secret".to_string()),
                    headers: BTreeMap::new(),
                },
                Utc::now(),
            ))
            .await
            .unwrap();

        let dispatcher = WebhookDispatcher::new(
            storage.clone(),
            WebhookDispatcherConfig {
                poll_interval: Duration::from_millis(20),
                ..WebhookDispatcherConfig::default()
            },
        );
        dispatcher.start().await;
        dispatcher.notify(execution_id).await.unwrap();

        tokio::time::sleep(Duration::from_millis(200)).await;
        dispatcher.stop(Duration::from_secs(1)).await;

        let webhook = storage.get_webhook(execution_id).await.unwrap().unwrap();
        assert_eq!(webhook.status, agentfield_types::WebhookStatus::Delivered);

        let events = storage.list_webhook_events(execution_id).await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].http_status, Some(200));
    }

    #[tokio::test]
    async fn notify_before_start_fails() {
        let storage: Arc<dyn Storage> = Arc::new(InMemoryStorage::new());
        let dispatcher = WebhookDispatcher::new(storage, WebhookDispatcherConfig::default());
        let result = dispatcher.notify(Uuid::new_v4()).await;
        assert!(matches!(result, Err(WebhookError::NotStarted)));
    }

    #[tokio::test]
    async fn failing_receiver_schedules_retry_with_incremented_attempt() {
        let mock_server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&mock_server)
            .await;

        let storage: Arc<dyn Storage> = Arc::new(InMemoryStorage::new());
        let execution_id = Uuid::new_v4();
        seed_succeeded_execution(&storage, execution_id).await;
        storage
            .create_webhook(ExecutionWebhook::new(
                execution_id,
                WebhookSpec {
                    url: format!("{}/hook", mock_server.uri()),
                    secret: None,
                    headers: BTreeMap::new(),
                },
                Utc::now(),
            ))
            .await
            .unwrap();

        let dispatcher = WebhookDispatcher::new(
            storage.clone(),
            WebhookDispatcherConfig {
                poll_interval: Duration::from_millis(20),
                max_attempts: 5,
                retry_backoff: Duration::from_secs(30),
                ..WebhookDispatcherConfig::default()
            },
        );
        dispatcher.start().await;
        dispatcher.notify(execution_id).await.unwrap();

        tokio::time::sleep(Duration::from_millis(200)).await;
        dispatcher.stop(Duration::from_secs(1)).await;

        let webhook = storage.get_webhook(execution_id).await.unwrap().unwrap();
        assert_eq!(webhook.status, agentfield_types::WebhookStatus::Pending);
        assert_eq!(webhook.attempt_count, 1);
        assert!(webhook.next_attempt_at > Utc::now());
    }
}
