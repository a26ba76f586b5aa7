use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

use crate::error::ControlPlaneError;

/// The webhook spec as carried on an execute request body (spec.md §6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookSpec {
    pub url: String,
    pub secret: Option<String>,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
}

const MAX_URL_LEN: usize = 4096;

impl WebhookSpec {
    /// URL validation performed before persisting a webhook row (spec.md §4.4).
    /// Reachability is never checked here.
    pub fn validate(&self) -> Result<(), ControlPlaneError> {
        if self.url.len() > MAX_URL_LEN {
            return Err(ControlPlaneError::BadRequest(format!(
                "webhook url exceeds {MAX_URL_LEN} bytes"
            )));
        }
        let parsed = url::Url::parse(&self.url)
            .map_err(|e| ControlPlaneError::BadRequest(format!("invalid webhook url: {e}")))?;
        match parsed.scheme() {
            "http" | "https" => {}
            other => {
                return Err(ControlPlaneError::BadRequest(format!(
                    "webhook url scheme '{other}' not allowed"
                )))
            }
        }
        if parsed.host_str().is_none() {
            return Err(ControlPlaneError::BadRequest(
                "webhook url missing host".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(type_name = "text", rename_all = "lowercase"))]
#[serde(rename_all = "lowercase")]
pub enum WebhookStatus {
    Pending,
    Delivering,
    Delivered,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionWebhook {
    pub execution_id: Uuid,
    pub url: String,
    pub secret: Option<String>,
    pub headers: BTreeMap<String, String>,
    pub status: WebhookStatus,
    pub attempt_count: i32,
    pub next_attempt_at: DateTime<Utc>,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

impl ExecutionWebhook {
    pub fn new(execution_id: Uuid, spec: WebhookSpec, now: DateTime<Utc>) -> Self {
        Self {
            execution_id,
            url: spec.url,
            secret: spec.secret,
            headers: spec.headers,
            status: WebhookStatus::Pending,
            attempt_count: 0,
            next_attempt_at: now,
            last_attempt_at: None,
            last_error: None,
        }
    }
}

/// One delivery attempt, appended to the audit log regardless of outcome.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookEvent {
    pub execution_id: Uuid,
    pub attempt: i32,
    pub http_status: Option<u16>,
    pub response_body_prefix: String,
    pub error: Option<String>,
    pub timestamp: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_http_and_https() {
        let spec = WebhookSpec {
            url: "https://example.com/hook".into(),
            secret: None,
            headers: BTreeMap::new(),
        };
        assert!(spec.validate().is_ok());
    }

    #[test]
    fn rejects_bad_scheme() {
        let spec = WebhookSpec {
            url: "ftp://example.com/hook".into(),
            secret: None,
            headers: BTreeMap::new(),
        };
        assert!(spec.validate().is_err());
    }

    #[test]
    fn rejects_oversized_url() {
        let spec = WebhookSpec {
            url: format!("https://example.com/{}", "a".repeat(MAX_URL_LEN)),
            secret: None,
            headers: BTreeMap::new(),
        };
        assert!(spec.validate().is_err());
    }
}
