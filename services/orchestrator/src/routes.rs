use std::time::Duration;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use agentfield_controller::ExecuteRequest;
use agentfield_types::{ControlPlaneError, ExecutionStatus, WebhookSpec};
use agentfield_vc::{GenerateContext, Jwk};

use crate::error::ApiError;
use crate::state::SharedState;

#[derive(Debug, Deserialize)]
pub struct ExecuteBody {
    pub input: Value,
    #[serde(default)]
    pub webhook: Option<WebhookSpec>,
    pub run_id: Option<Uuid>,
    pub parent_execution_id: Option<Uuid>,
    pub session_id: Option<String>,
    pub actor_id: Option<String>,
}

fn into_request(target: String, body: ExecuteBody, timeout: Duration) -> ExecuteRequest {
    ExecuteRequest {
        target,
        input: body.input,
        webhook: body.webhook,
        timeout,
        run_id: body.run_id,
        parent_execution_id: body.parent_execution_id,
        session_id: body.session_id,
        actor_id: body.actor_id,
    }
}

pub async fn execute_sync(
    State(state): State<SharedState>,
    Path(target): Path<String>,
    Json(body): Json<ExecuteBody>,
) -> Result<impl IntoResponse, ApiError> {
    let req = into_request(target, body, state.config.exec_default_timeout);
    let response = state.controller.execute_sync(req).await?;
    Ok((StatusCode::OK, Json(response)))
}

pub async fn execute_async(
    State(state): State<SharedState>,
    Path(target): Path<String>,
    Json(body): Json<ExecuteBody>,
) -> Result<impl IntoResponse, ApiError> {
    let req = into_request(target, body, state.config.exec_default_timeout);
    let ack = state.controller.execute_async(req).await?;
    Ok((StatusCode::ACCEPTED, Json(ack)))
}

pub async fn get_execution(
    State(state): State<SharedState>,
    Path(execution_id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    let status = state.controller.get_status(execution_id).await?;
    Ok((StatusCode::OK, Json(status)))
}

#[derive(Debug, Deserialize)]
pub struct UpdateStatusBody {
    pub status: String,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub duration_ms: Option<i64>,
}

fn parse_status(raw: &str) -> Result<ExecutionStatus, ControlPlaneError> {
    match raw {
        "queued" => Ok(ExecutionStatus::Queued),
        "running" => Ok(ExecutionStatus::Running),
        "succeeded" | "completed" => Ok(ExecutionStatus::Succeeded),
        "failed" => Ok(ExecutionStatus::Failed),
        "cancelled" => Ok(ExecutionStatus::Cancelled),
        "timeout" => Ok(ExecutionStatus::Timeout),
        "pending" => Ok(ExecutionStatus::Pending),
        other => Err(ControlPlaneError::BadRequest(format!("unknown status '{other}'"))),
    }
}

pub async fn update_status(
    State(state): State<SharedState>,
    Path(execution_id): Path<Uuid>,
    Json(body): Json<UpdateStatusBody>,
) -> Result<impl IntoResponse, ApiError> {
    let status = parse_status(&body.status)?;
    let response = state
        .controller
        .update_status(execution_id, status, body.result, body.error, body.duration_ms)
        .await?;
    Ok((StatusCode::OK, Json(response)))
}

#[derive(Debug, Deserialize)]
pub struct BatchStatusBody {
    pub execution_ids: Vec<Uuid>,
}

pub async fn batch_status(
    State(state): State<SharedState>,
    Json(body): Json<BatchStatusBody>,
) -> Result<impl IntoResponse, ApiError> {
    let statuses = state.controller.batch_status(body.execution_ids).await?;
    Ok((StatusCode::OK, Json(statuses)))
}

pub async fn cancel_execution(
    State(state): State<SharedState>,
    Path(execution_id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    let response = state.controller.cancel_execution(execution_id).await?;
    Ok((StatusCode::OK, Json(response)))
}

#[derive(Debug, Deserialize)]
pub struct DidRegisterBody {
    pub did: String,
    pub public_key_jwk: Jwk,
}

pub async fn did_register(State(state): State<SharedState>, Json(body): Json<DidRegisterBody>) -> impl IntoResponse {
    state.did_resolver.register(body.did, body.public_key_jwk);
    StatusCode::OK
}

pub async fn did_resolve(State(state): State<SharedState>, Path(did): Path<String>) -> Result<impl IntoResponse, ApiError> {
    match state.did_resolver.resolve(&did).await {
        Some(record) => Ok((StatusCode::OK, Json(record))),
        None => Err(ApiError(ControlPlaneError::NotFound)),
    }
}

#[derive(Debug, Deserialize)]
pub struct DidVerifyBody {
    pub vc_document: Value,
}

pub async fn did_verify(State(state): State<SharedState>, Json(body): Json<DidVerifyBody>) -> impl IntoResponse {
    let result = state.vc_service.verify_vc(&body.vc_document).await;
    (StatusCode::OK, Json(result))
}

pub async fn workflow_vc_chain(
    State(state): State<SharedState>,
    Path(workflow_id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    let chain = state
        .vc_service
        .get_workflow_vc_chain(workflow_id)
        .await
        .map_err(|e| ApiError(ControlPlaneError::Internal(e.to_string())))?;
    Ok((StatusCode::OK, Json(chain)))
}

#[derive(Debug, Deserialize)]
pub struct IssueVcBody {
    pub execution_id: Uuid,
    pub workflow_id: Uuid,
    #[serde(default)]
    pub session_id: Option<String>,
    pub caller_did: String,
    pub target_did_hint: String,
    #[serde(default)]
    pub input: Value,
    #[serde(default)]
    pub output: Value,
    pub status: String,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub duration_ms: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct IssueVcResponse {
    pub vc: Option<agentfield_types::ExecutionVc>,
}

pub async fn issue_execution_vc(
    State(state): State<SharedState>,
    Json(body): Json<IssueVcBody>,
) -> Result<impl IntoResponse, ApiError> {
    let status = parse_status(&body.status)?;
    let ctx = GenerateContext {
        execution_id: body.execution_id,
        workflow_id: body.workflow_id,
        session_id: body.session_id,
        caller_did: body.caller_did,
        target_did_hint: body.target_did_hint,
        input_bytes: serde_json::to_vec(&body.input).unwrap_or_default(),
        output_bytes: serde_json::to_vec(&body.output).unwrap_or_default(),
        status,
        error: body.error,
        duration_ms: body.duration_ms,
    };
    let vc = state
        .vc_service
        .generate_execution_vc(ctx)
        .await
        .map_err(|e| ApiError(ControlPlaneError::Internal(e.to_string())))?;
    Ok((StatusCode::OK, Json(IssueVcResponse { vc })))
}
