//! Execution Controller (spec.md §4.1): the single public entry point for
//! dispatching work to agent nodes and recording its outcome. Grounded on
//! the pack's `StandardExecutionService` shape — a struct holding its
//! collaborators behind `Arc<dyn Trait>` and one method per public
//! operation — generalized from that example's domain-specific execution
//! model to this system's target/webhook/VC-aware state machine.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::Value;
use tracing::{info, warn};
use uuid::Uuid;

use agentfield_eventbus::{EventBus, EventReceiver, ExecutionEvent};
use agentfield_storage::{ExecutionTransition, PayloadStore, Storage, StorageError};
use agentfield_types::{
    ControlPlaneError, Execution, ExecutionStatus, ExecutionWebhook, ResultPayload, Target,
    WebhookSpec,
};
use agentfield_vc::{GenerateContext, VcService};
use agentfield_webhooks::WebhookDispatcher;
use agentfield_workerpool::{Job, WorkerPool};

use crate::agent_directory::{AgentDirectory, AgentRecord};

const MAX_BATCH_STATUS_IDS: usize = 50;

/// Results serialized larger than this are spilled to the payload store
/// and only their URI is kept on the execution row (spec.md §3
/// invariant 3). 16 KiB keeps ordinary JSON results inline while
/// diverting anything large enough to bloat the row.
const INLINE_PAYLOAD_THRESHOLD_BYTES: usize = 16 * 1024;

pub struct ExecuteRequest {
    pub target: String,
    pub input: Value,
    pub webhook: Option<WebhookSpec>,
    pub timeout: Duration,
    pub run_id: Option<Uuid>,
    pub parent_execution_id: Option<Uuid>,
    pub session_id: Option<String>,
    pub actor_id: Option<String>,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct ExecuteResponse {
    pub execution_id: Uuid,
    pub run_id: Uuid,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    pub duration_ms: Option<i64>,
    pub webhook_registered: bool,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct AsyncAck {
    pub execution_id: Uuid,
    pub run_id: Uuid,
    pub status: String,
    pub webhook_registered: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub webhook_error: Option<String>,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct StatusResponse {
    pub execution_id: Uuid,
    pub run_id: Uuid,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub duration_ms: Option<i64>,
    pub webhook_registered: bool,
}

fn to_status_response(execution: &Execution) -> StatusResponse {
    StatusResponse {
        execution_id: execution.execution_id,
        run_id: execution.run_id,
        status: execution.status.as_str().to_string(),
        result: execution.result.as_ref().and_then(result_to_json),
        error: execution.error.clone(),
        duration_ms: execution.duration_ms,
        webhook_registered: execution.webhook_registered,
    }
}

fn result_to_json(result: &ResultPayload) -> Option<Value> {
    match result {
        ResultPayload::Inline(value) => Some(value.clone()),
        ResultPayload::Spilled { uri } => Some(serde_json::json!({ "uri": uri })),
    }
}

fn storage_err(e: StorageError) -> ControlPlaneError {
    ControlPlaneError::Internal(e.to_string())
}

#[derive(Debug, Clone)]
pub struct ControllerConfig {
    pub vc_enabled_for_terminal: bool,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            vc_enabled_for_terminal: true,
        }
    }
}

/// The dispatch-and-record core shared by the sync path (awaited inline)
/// and the async path (driven from inside a worker-pool job). Holds
/// everything needed to run one execution through to a terminal status
/// except the agent directory, which only `prepare` (the controller)
/// needs.
struct Dispatcher {
    storage: Arc<dyn Storage>,
    event_bus: Arc<EventBus>,
    webhook_dispatcher: Arc<WebhookDispatcher>,
    vc_service: Option<Arc<VcService>>,
    payload_store: Arc<dyn PayloadStore>,
    http_client: reqwest::Client,
    config: ControllerConfig,
}

struct PreparedExecution {
    execution: Execution,
    agent: AgentRecord,
    target: Target,
}

enum AgentCallOutcome {
    Success(Value),
    AgentError { status: u16, body_prefix: String },
    TransportError(String),
    Deferred,
}

impl Dispatcher {
    async fn dispatch_and_wait(
        &self,
        prepared: PreparedExecution,
        input: Value,
        mut subscription: EventReceiver,
    ) -> Result<ExecuteResponse, ControlPlaneError> {
        let execution_id = prepared.execution.execution_id;
        let run_id = prepared.execution.run_id;
        let webhook_registered = prepared.execution.webhook_registered;

        self.storage
            .update_execution(
                execution_id,
                ExecutionTransition::to(ExecutionStatus::Running).with_started_at(Utc::now()),
                Utc::now(),
            )
            .await
            .map_err(storage_err)?;

        let call = self
            .call_agent(&prepared.agent, &prepared.target.target_name, &input, &prepared.execution)
            .await;

        match call {
            AgentCallOutcome::Success(result) => {
                let status = self
                    .update_status_internal(
                        execution_id,
                        ExecutionStatus::Succeeded,
                        Some(result.clone()),
                        None,
                        None,
                        Some(&input),
                    )
                    .await?;
                Ok(ExecuteResponse {
                    execution_id,
                    run_id,
                    status: status.status,
                    result: Some(result),
                    duration_ms: status.duration_ms,
                    webhook_registered,
                })
            }
            AgentCallOutcome::AgentError { status: http_status, body_prefix } => {
                let message = format!("agent error ({http_status}): {body_prefix}");
                self.update_status_internal(execution_id, ExecutionStatus::Failed, None, Some(message), None, Some(&input))
                    .await?;
                Err(ControlPlaneError::AgentError {
                    status: http_status,
                    body_prefix,
                })
            }
            AgentCallOutcome::TransportError(message) => {
                self.update_status_internal(execution_id, ExecutionStatus::Failed, None, Some(message.clone()), None, Some(&input))
                    .await?;
                Err(ControlPlaneError::AgentCallFailed(message))
            }
            AgentCallOutcome::Deferred => {
                // Close-the-race: probe storage once in case the terminal
                // write already committed before we subscribed (spec.md
                // §4.1, §9).
                if let Some(execution) = self.storage.get_execution(execution_id).await.map_err(storage_err)? {
                    if execution.status.is_terminal() {
                        return Ok(ExecuteResponse {
                            execution_id,
                            run_id,
                            status: execution.status.as_str().to_string(),
                            result: execution.result.as_ref().and_then(result_to_json),
                            duration_ms: execution.duration_ms,
                            webhook_registered,
                        });
                    }
                }

                loop {
                    match subscription.recv().await {
                        Ok(event) if event.execution_id == execution_id => {
                            let execution = self
                                .storage
                                .get_execution(execution_id)
                                .await
                                .map_err(storage_err)?
                                .ok_or(ControlPlaneError::NotFound)?;
                            return Ok(ExecuteResponse {
                                execution_id,
                                run_id,
                                status: execution.status.as_str().to_string(),
                                result: execution.result.as_ref().and_then(result_to_json),
                                duration_ms: execution.duration_ms,
                                webhook_registered,
                            });
                        }
                        Ok(_) => continue,
                        Err(_) => return Err(ControlPlaneError::Internal("event_bus_unavailable".to_string())),
                    }
                }
            }
        }
    }

    async fn update_status_internal(
        &self,
        execution_id: Uuid,
        status: ExecutionStatus,
        result: Option<Value>,
        error: Option<String>,
        duration_ms: Option<i64>,
        input_for_vc: Option<&Value>,
    ) -> Result<StatusResponse, ControlPlaneError> {
        let mut transition = ExecutionTransition::to(status);
        if let Some(result) = &result {
            transition = transition.with_result(self.to_result_payload(execution_id, result).await);
        }
        if let Some(error) = &error {
            transition = transition.with_error(error.clone());
        }
        if let Some(duration_ms) = duration_ms {
            transition = transition.with_duration_ms(duration_ms);
        }

        let outcome = self
            .storage
            .update_execution(execution_id, transition, Utc::now())
            .await
            .map_err(storage_err)?
            .ok_or(ControlPlaneError::NotFound)?;

        if outcome.became_terminal {
            info!(%execution_id, status = outcome.execution.status.as_str(), "execution reached terminal state");
            self.event_bus.publish(ExecutionEvent::completed(
                execution_id,
                outcome.execution.run_id,
                outcome.execution.status,
            ));

            if outcome.execution.webhook_registered {
                if let Err(e) = self.webhook_dispatcher.notify(execution_id).await {
                    warn!(%execution_id, error = %e, "failed to notify webhook dispatcher");
                }
            }

            if self.config.vc_enabled_for_terminal {
                if let Some(vc_service) = &self.vc_service {
                    let input_bytes = input_for_vc
                        .map(|v| serde_json::to_vec(v).unwrap_or_default())
                        .unwrap_or_default();
                    let output_bytes = outcome
                        .execution
                        .result
                        .as_ref()
                        .and_then(result_to_json)
                        .map(|v| serde_json::to_vec(&v).unwrap_or_default())
                        .unwrap_or_default();

                    let vc_result = vc_service
                        .generate_execution_vc(GenerateContext {
                            execution_id,
                            workflow_id: outcome.execution.run_id,
                            session_id: outcome.execution.session_id.clone(),
                            caller_did: outcome
                                .execution
                                .actor_id
                                .clone()
                                .unwrap_or_else(|| "did:agentfield:anonymous".to_string()),
                            target_did_hint: format!("did:agentfield:{}", outcome.execution.node_id),
                            input_bytes,
                            output_bytes,
                            status: outcome.execution.status,
                            error: outcome.execution.error.clone(),
                            duration_ms: outcome.execution.duration_ms,
                        })
                        .await;
                    if let Err(e) = vc_result {
                        warn!(%execution_id, error = %e, "VC issuance failed");
                    }
                }
            }
        }

        Ok(to_status_response(&outcome.execution))
    }

    /// Spills `result` to the payload store and returns a `Spilled` URI
    /// reference once it exceeds [`INLINE_PAYLOAD_THRESHOLD_BYTES`]
    /// (spec.md §3 invariant 3); falls back to `Inline` if serialization
    /// or the store write fails, since a result too large to spill
    /// cleanly is still better recorded inline than lost.
    async fn to_result_payload(&self, execution_id: Uuid, result: &Value) -> ResultPayload {
        let bytes = match serde_json::to_vec(result) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(%execution_id, error = %e, "failed to serialize result for spill sizing; storing inline");
                return ResultPayload::Inline(result.clone());
            }
        };

        if bytes.len() <= INLINE_PAYLOAD_THRESHOLD_BYTES {
            return ResultPayload::Inline(result.clone());
        }

        match self.payload_store.put(bytes).await {
            Ok(uri) => {
                info!(%execution_id, %uri, "result spilled to payload store");
                ResultPayload::Spilled { uri }
            }
            Err(e) => {
                warn!(%execution_id, error = %e, "failed to spill oversized result; storing inline");
                ResultPayload::Inline(result.clone())
            }
        }
    }

    async fn call_agent(&self, agent: &AgentRecord, target_name: &str, input: &Value, execution: &Execution) -> AgentCallOutcome {
        let url = format!("{}/reasoners/{}", agent.base_url.trim_end_matches('/'), target_name);
        let mut request = self.http_client.post(url).json(&serde_json::json!({ "input": input }));

        request = request
            .header("X-Run-ID", execution.run_id.to_string())
            .header("X-Execution-ID", execution.execution_id.to_string());
        if let Some(parent) = execution.parent_execution_id {
            request = request.header("X-Parent-Execution-ID", parent.to_string());
        }
        if let Some(session_id) = &execution.session_id {
            request = request.header("X-Session-ID", session_id);
        }
        if let Some(actor_id) = &execution.actor_id {
            request = request.header("X-Actor-ID", actor_id);
        }

        match request.send().await {
            Ok(response) => {
                let status = response.status();
                if status.as_u16() == 202 {
                    return AgentCallOutcome::Deferred;
                }
                if status.is_success() {
                    match response.json::<Value>().await {
                        Ok(value) => AgentCallOutcome::Success(value),
                        Err(e) => AgentCallOutcome::TransportError(format!("failed to decode agent response: {e}")),
                    }
                } else {
                    let body = response.text().await.unwrap_or_default();
                    let prefix: String = body.chars().take(500).collect();
                    AgentCallOutcome::AgentError {
                        status: status.as_u16(),
                        body_prefix: prefix,
                    }
                }
            }
            Err(e) => {
                let message = if e.is_timeout() {
                    format!("timeout: deadline exceeded calling agent: {e}")
                } else {
                    e.to_string()
                };
                AgentCallOutcome::TransportError(message)
            }
        }
    }
}

pub struct ExecutionController {
    dispatcher: Arc<Dispatcher>,
    storage: Arc<dyn Storage>,
    event_bus: Arc<EventBus>,
    worker_pool: Arc<WorkerPool>,
    webhook_dispatcher: Arc<WebhookDispatcher>,
    agent_directory: Arc<dyn AgentDirectory>,
}

impl ExecutionController {
    pub fn new(
        storage: Arc<dyn Storage>,
        event_bus: Arc<EventBus>,
        worker_pool: Arc<WorkerPool>,
        webhook_dispatcher: Arc<WebhookDispatcher>,
        vc_service: Option<Arc<VcService>>,
        agent_directory: Arc<dyn AgentDirectory>,
        payload_store: Arc<dyn PayloadStore>,
        config: ControllerConfig,
    ) -> Self {
        let dispatcher = Arc::new(Dispatcher {
            storage: storage.clone(),
            event_bus: event_bus.clone(),
            webhook_dispatcher: webhook_dispatcher.clone(),
            vc_service,
            payload_store,
            http_client: reqwest::Client::new(),
            config,
        });
        Self {
            dispatcher,
            storage,
            event_bus,
            worker_pool,
            webhook_dispatcher,
            agent_directory,
        }
    }

    /// Preparation steps 1-6 (spec.md §4.1), shared by sync and async
    /// dispatch.
    async fn prepare(&self, req: &ExecuteRequest) -> Result<(PreparedExecution, Option<String>), ControlPlaneError> {
        let target = Target::parse(&req.target)?;

        let agent = self
            .agent_directory
            .get(&target.node_id)
            .await
            .ok_or_else(|| ControlPlaneError::AgentUnknown {
                node_id: target.node_id.clone(),
            })?;

        if !agent.has_target(&target.target_name) {
            return Err(ControlPlaneError::TargetNotFound {
                target_name: target.target_name.clone(),
            });
        }

        let execution_id = Uuid::new_v4();
        let run_id = req.run_id.unwrap_or_else(Uuid::new_v4);
        let now = Utc::now();

        let mut webhook_error = None;
        let webhook_registered = match &req.webhook {
            Some(spec) => match spec.validate() {
                Ok(()) => true,
                Err(e) => {
                    warn!(%execution_id, error = %e, "webhook validation failed, continuing without registration");
                    webhook_error = Some(e.to_string());
                    false
                }
            },
            None => false,
        };

        let mut execution = Execution::new(
            execution_id,
            run_id,
            target.node_id.clone(),
            target.target_name.clone(),
            req.parent_execution_id,
            req.session_id.clone(),
            req.actor_id.clone(),
            now,
        );
        execution.webhook_registered = webhook_registered;

        self.storage
            .create_execution(execution.clone())
            .await
            .map_err(storage_err)?;

        if webhook_registered {
            if let Some(spec) = &req.webhook {
                let webhook = ExecutionWebhook::new(execution_id, spec.clone(), now);
                if let Err(e) = self.storage.create_webhook(webhook).await {
                    warn!(%execution_id, error = %e, "failed to persist webhook row");
                }
            }
        }

        Ok((
            PreparedExecution {
                execution,
                agent,
                target,
            },
            webhook_error,
        ))
    }

    pub async fn execute_sync(&self, req: ExecuteRequest) -> Result<ExecuteResponse, ControlPlaneError> {
        let timeout = req.timeout;
        let (prepared, _webhook_error) = self.prepare(&req).await?;
        let execution_id = prepared.execution.execution_id;

        let subscription = self.event_bus.subscribe(execution_id);

        match tokio::time::timeout(timeout, self.dispatcher.dispatch_and_wait(prepared, req.input, subscription)).await {
            Ok(result) => result,
            Err(_) => {
                self.storage
                    .update_execution(execution_id, ExecutionTransition::to(ExecutionStatus::Timeout), Utc::now())
                    .await
                    .map_err(storage_err)?;
                Err(ControlPlaneError::Timeout(format!(
                    "execution {execution_id} exceeded its deadline"
                )))
            }
        }
    }

    pub async fn execute_async(&self, req: ExecuteRequest) -> Result<AsyncAck, ControlPlaneError> {
        let (prepared, webhook_error) = self.prepare(&req).await?;
        let execution_id = prepared.execution.execution_id;
        let run_id = prepared.execution.run_id;
        let webhook_registered = prepared.execution.webhook_registered;

        let job: Box<dyn Job> = Box::new(AsyncDispatchJob {
            dispatcher: self.dispatcher.clone(),
            event_bus: self.event_bus.clone(),
            prepared,
            input: req.input,
            timeout: req.timeout,
        });

        if !self.worker_pool.submit(job) {
            self.storage
                .update_execution(
                    execution_id,
                    ExecutionTransition::to(ExecutionStatus::Failed).with_error("queue_full".to_string()),
                    Utc::now(),
                )
                .await
                .map_err(storage_err)?;
            return Err(ControlPlaneError::QueueFull);
        }

        Ok(AsyncAck {
            execution_id,
            run_id,
            status: ExecutionStatus::Queued.as_str().to_string(),
            webhook_registered,
            webhook_error,
        })
    }

    pub async fn update_status(
        &self,
        execution_id: Uuid,
        status: ExecutionStatus,
        result: Option<Value>,
        error: Option<String>,
        duration_ms: Option<i64>,
    ) -> Result<StatusResponse, ControlPlaneError> {
        self.dispatcher
            .update_status_internal(execution_id, status, result, error, duration_ms, None)
            .await
    }

    pub async fn get_status(&self, execution_id: Uuid) -> Result<StatusResponse, ControlPlaneError> {
        let execution = self
            .storage
            .get_execution(execution_id)
            .await
            .map_err(storage_err)?
            .ok_or(ControlPlaneError::NotFound)?;
        Ok(to_status_response(&execution))
    }

    pub async fn batch_status(&self, execution_ids: Vec<Uuid>) -> Result<HashMap<Uuid, Option<StatusResponse>>, ControlPlaneError> {
        if execution_ids.len() > MAX_BATCH_STATUS_IDS {
            return Err(ControlPlaneError::BadRequest(format!(
                "batch-status accepts at most {MAX_BATCH_STATUS_IDS} ids, got {}",
                execution_ids.len()
            )));
        }

        let executions = self
            .storage
            .batch_get_executions(&execution_ids)
            .await
            .map_err(storage_err)?;

        Ok(execution_ids
            .into_iter()
            .zip(executions)
            .map(|(id, execution)| (id, execution.as_ref().map(to_status_response)))
            .collect())
    }

    /// `SPEC_FULL.md` §4.1c: transitions a non-terminal execution to
    /// `cancelled` through the same CAS path as any other status update.
    /// Idempotent: cancelling an already-terminal execution returns its
    /// existing terminal status without error.
    pub async fn cancel_execution(&self, execution_id: Uuid) -> Result<StatusResponse, ControlPlaneError> {
        let existing = self
            .storage
            .get_execution(execution_id)
            .await
            .map_err(storage_err)?
            .ok_or(ControlPlaneError::NotFound)?;

        if existing.status.is_terminal() {
            return Ok(to_status_response(&existing));
        }

        let response = self
            .dispatcher
            .update_status_internal(execution_id, ExecutionStatus::Cancelled, None, None, None, None)
            .await?;

        if let Err(e) = self.webhook_dispatcher.cancel_pending(execution_id).await {
            warn!(%execution_id, error = %e, "failed to cancel pending webhook on execution cancellation");
        }

        Ok(response)
    }
}

/// The worker-pool job for an async dispatch: it reruns the same
/// dispatch-and-wait logic as sync but discards the returned response,
/// since the caller already received its `202` acknowledgement (spec.md
/// §4.2: "invokes the controller's inline execution routine"). The
/// deadline carried on the original request still applies here (spec.md
/// §5: "every inbound request carries a deadline") — without it, a hung
/// agent call would leave the execution stuck in `running` forever.
struct AsyncDispatchJob {
    dispatcher: Arc<Dispatcher>,
    event_bus: Arc<EventBus>,
    prepared: PreparedExecution,
    input: Value,
    timeout: Duration,
}

#[async_trait::async_trait]
impl Job for AsyncDispatchJob {
    async fn run(self: Box<Self>) {
        let execution_id = self.prepared.execution.execution_id;
        let subscription = self.event_bus.subscribe(execution_id);
        let dispatcher = self.dispatcher.clone();
        let timeout = self.timeout;

        match tokio::time::timeout(timeout, dispatcher.dispatch_and_wait(self.prepared, self.input, subscription)).await {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => {
                warn!(%execution_id, error = %e, "async dispatch job ended with an error (already recorded on the execution)");
            }
            Err(_) => {
                if let Err(e) = dispatcher
                    .storage
                    .update_execution(execution_id, ExecutionTransition::to(ExecutionStatus::Timeout), Utc::now())
                    .await
                {
                    warn!(%execution_id, error = %e, "failed to mark timed-out async execution");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use agentfield_storage::memory::InMemoryStorage;
    use agentfield_storage::payload::InMemoryPayloadStore;
    use agentfield_workerpool::WorkerPoolConfig;
    use serde_json::json;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn test_controller(agent_base_url: String) -> ExecutionController {
        let storage: Arc<dyn Storage> = Arc::new(InMemoryStorage::new());
        let event_bus = Arc::new(EventBus::new(64));
        let worker_pool = Arc::new(WorkerPool::start(WorkerPoolConfig {
            worker_count: 4,
            queue_capacity: 16,
        }));
        let webhook_dispatcher = Arc::new(WebhookDispatcher::new(
            storage.clone(),
            agentfield_webhooks::WebhookDispatcherConfig::default(),
        ));
        let directory = agent_directory::InMemoryAgentDirectory::new();
        directory.register(
            "node-1",
            AgentRecord {
                base_url: agent_base_url,
                reasoners: vec!["reasoner-a".to_string()],
            },
        );

        ExecutionController::new(
            storage,
            event_bus,
            worker_pool,
            webhook_dispatcher,
            None,
            Arc::new(directory),
            Arc::new(InMemoryPayloadStore::new()),
            ControllerConfig::default(),
        )
    }

    fn basic_request(target: &str) -> ExecuteRequest {
        ExecuteRequest {
            target: target.to_string(),
            input: json!({"x": 1}),
            webhook: None,
            timeout: Duration::from_secs(5),
            run_id: None,
            parent_execution_id: None,
            session_id: None,
            actor_id: None,
        }
    }

    #[tokio::test]
    async fn execute_sync_returns_agent_result_on_success() {
        let mock_server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/reasoners/reasoner-a"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"answer": 42})))
            .mount(&mock_server)
            .await;

        let controller = test_controller(mock_server.uri());
        let response = controller.execute_sync(basic_request("node-1.reasoner-a")).await.unwrap();

        assert_eq!(response.status, "succeeded");
        assert_eq!(response.result, Some(json!({"answer": 42})));
        assert!(response.duration_ms.is_some());

        let status = controller.get_status(response.execution_id).await.unwrap();
        assert_eq!(status.status, "succeeded");
    }

    #[tokio::test]
    async fn execute_sync_records_agent_error() {
        let mock_server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/reasoners/reasoner-a"))
            .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
            .mount(&mock_server)
            .await;

        let controller = test_controller(mock_server.uri());
        let err = controller.execute_sync(basic_request("node-1.reasoner-a")).await.unwrap_err();
        assert!(matches!(err, ControlPlaneError::AgentError { status: 500, .. }));
    }

    #[tokio::test]
    async fn execute_sync_rejects_unknown_target_without_calling_agent() {
        let mock_server = MockServer::start().await;
        // No mock mounted: any request would fail the test via wiremock's
        // default 404-on-unmatched behavior, which is fine here since we
        // assert no call happens at all.
        let controller = test_controller(mock_server.uri());
        let err = controller
            .execute_sync(basic_request("node-1.reasoner-unknown"))
            .await
            .unwrap_err();
        assert!(matches!(err, ControlPlaneError::TargetNotFound { .. }));
    }

    #[tokio::test]
    async fn execute_sync_rejects_unknown_agent() {
        let mock_server = MockServer::start().await;
        let controller = test_controller(mock_server.uri());
        let err = controller
            .execute_sync(basic_request("node-unknown.reasoner-a"))
            .await
            .unwrap_err();
        assert!(matches!(err, ControlPlaneError::AgentUnknown { .. }));
    }

    #[tokio::test]
    async fn execute_sync_times_out_and_marks_execution() {
        let mock_server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/reasoners/reasoner-a"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_millis(200)))
            .mount(&mock_server)
            .await;

        let controller = test_controller(mock_server.uri());
        let mut req = basic_request("node-1.reasoner-a");
        req.timeout = Duration::from_millis(20);

        let err = controller.execute_sync(req).await.unwrap_err();
        assert!(matches!(err, ControlPlaneError::Timeout(_)));
    }

    #[tokio::test]
    async fn execute_async_acks_then_settles_to_terminal() {
        let mock_server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/reasoners/reasoner-a"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"ok": true})))
            .mount(&mock_server)
            .await;

        let controller = test_controller(mock_server.uri());
        let ack = controller.execute_async(basic_request("node-1.reasoner-a")).await.unwrap();
        assert_eq!(ack.status, "queued");

        for _ in 0..20 {
            let status = controller.get_status(ack.execution_id).await.unwrap();
            if status.status != "queued" && status.status != "running" {
                assert_eq!(status.status, "succeeded");
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("async execution never reached a terminal state");
    }

    #[tokio::test]
    async fn execute_async_reports_queue_full() {
        let storage: Arc<dyn Storage> = Arc::new(InMemoryStorage::new());
        let event_bus = Arc::new(EventBus::new(64));
        let worker_pool = Arc::new(WorkerPool::start(WorkerPoolConfig {
            worker_count: 0,
            queue_capacity: 1,
        }));
        let webhook_dispatcher = Arc::new(WebhookDispatcher::new(
            storage.clone(),
            agentfield_webhooks::WebhookDispatcherConfig::default(),
        ));
        let directory = agent_directory::InMemoryAgentDirectory::new();
        directory.register(
            "node-1",
            AgentRecord {
                base_url: "http://localhost:1".to_string(),
                reasoners: vec!["reasoner-a".to_string()],
            },
        );
        let controller = ExecutionController::new(
            storage,
            event_bus,
            worker_pool,
            webhook_dispatcher,
            None,
            Arc::new(directory),
            Arc::new(InMemoryPayloadStore::new()),
            ControllerConfig::default(),
        );

        let first = controller.execute_async(basic_request("node-1.reasoner-a")).await;
        assert!(first.is_ok());
        let second = controller.execute_async(basic_request("node-1.reasoner-a")).await;
        assert!(matches!(second.unwrap_err(), ControlPlaneError::QueueFull));
    }

    #[tokio::test]
    async fn cancel_execution_is_idempotent_on_terminal_state() {
        let mock_server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/reasoners/reasoner-a"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"ok": true})))
            .mount(&mock_server)
            .await;

        let controller = test_controller(mock_server.uri());
        let response = controller.execute_sync(basic_request("node-1.reasoner-a")).await.unwrap();

        let cancelled = controller.cancel_execution(response.execution_id).await.unwrap();
        assert_eq!(cancelled.status, "succeeded");
    }

    #[tokio::test]
    async fn batch_status_rejects_oversized_batch() {
        let mock_server = MockServer::start().await;
        let controller = test_controller(mock_server.uri());
        let ids: Vec<Uuid> = (0..51).map(|_| Uuid::new_v4()).collect();
        let err = controller.batch_status(ids).await.unwrap_err();
        assert!(matches!(err, ControlPlaneError::BadRequest(_)));
    }

    #[tokio::test]
    async fn oversized_result_is_spilled_to_payload_store() {
        let mock_server = MockServer::start().await;
        let big = "x".repeat(INLINE_PAYLOAD_THRESHOLD_BYTES + 1);
        Mock::given(method("POST"))
            .and(path("/reasoners/reasoner-a"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"big": big})))
            .mount(&mock_server)
            .await;

        let controller = test_controller(mock_server.uri());
        let response = controller.execute_sync(basic_request("node-1.reasoner-a")).await.unwrap();

        // The synchronous response always carries the full agent result;
        // the spill only affects what's persisted on the execution row.
        let status = controller.get_status(response.execution_id).await.unwrap();
        let result = status.result.expect("terminal execution carries a result");
        let uri = result.get("uri").and_then(Value::as_str).expect("oversized result spills to a uri, not inline JSON");
        assert!(uri.starts_with("mem://"));
    }
}
