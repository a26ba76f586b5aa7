use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

use agentfield_types::ControlPlaneError;

/// Wraps [`ControlPlaneError`] so this crate can provide the
/// [`IntoResponse`] impl the orphan rules forbid upstream (spec.md §6/§7
/// status-code table).
pub struct ApiError(pub ControlPlaneError);

impl From<ControlPlaneError> for ApiError {
    fn from(e: ControlPlaneError) -> Self {
        ApiError(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.0.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let body = Json(json!({
            "error": self.0.tag(),
            "message": self.0.to_string(),
        }));
        (status, body).into_response()
    }
}
