use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::execution::ExecutionStatus;

/// A persisted, signed Verifiable Credential row (spec.md §3).
///
/// `vc_document` is the full W3C JSON-LD credential; every other field here
/// must be byte-identical to its counterpart inside
/// `vc_document.credentialSubject` (enforced by verification, spec.md §4.6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionVc {
    pub vc_id: Uuid,
    pub execution_id: Uuid,
    pub workflow_id: Uuid,
    pub session_id: Option<String>,
    pub issuer_did: String,
    pub target_did: String,
    pub caller_did: String,
    pub input_hash: String,
    pub output_hash: String,
    pub status: ExecutionStatus,
    pub vc_document: serde_json::Value,
    pub signature: String,
    pub storage_uri: Option<String>,
    pub document_size: usize,
    pub created_at: DateTime<Utc>,
}

/// An aggregate credential over a set of component execution VCs
/// (spec.md §4.6, workflow VC rollup).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowVc {
    pub workflow_id: Uuid,
    pub status: ExecutionStatus,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub component_vc_ids: Vec<Uuid>,
}

/// The chain of component VCs making up one workflow, in creation order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowVcChain {
    pub workflow_id: Uuid,
    pub workflow_vc: WorkflowVc,
    pub components: Vec<ExecutionVc>,
}

/// Priority order for workflow status rollup, first match wins
/// (spec.md §4.6): failed, timeout, cancelled, running, queued, pending,
/// unknown, succeeded.
pub fn rollup_status(statuses: &[ExecutionStatus]) -> ExecutionStatus {
    const PRIORITY: [ExecutionStatus; 8] = [
        ExecutionStatus::Failed,
        ExecutionStatus::Timeout,
        ExecutionStatus::Cancelled,
        ExecutionStatus::Running,
        ExecutionStatus::Queued,
        ExecutionStatus::Pending,
        ExecutionStatus::Unknown,
        ExecutionStatus::Succeeded,
    ];
    for candidate in PRIORITY {
        if statuses.contains(&candidate) {
            return candidate;
        }
    }
    ExecutionStatus::Unknown
}

/// Canonical normalization so `succeeded`/`completed` compare equal
/// (spec.md §4.6, comprehensive verification).
pub fn normalize_status_str(s: &str) -> &str {
    match s {
        "completed" => "succeeded",
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failed_beats_everything() {
        let statuses = vec![
            ExecutionStatus::Succeeded,
            ExecutionStatus::Running,
            ExecutionStatus::Failed,
        ];
        assert_eq!(rollup_status(&statuses), ExecutionStatus::Failed);
    }

    #[test]
    fn all_succeeded_rolls_up_succeeded() {
        let statuses = vec![ExecutionStatus::Succeeded, ExecutionStatus::Succeeded];
        assert_eq!(rollup_status(&statuses), ExecutionStatus::Succeeded);
    }

    #[test]
    fn normalizes_completed_alias() {
        assert_eq!(normalize_status_str("completed"), "succeeded");
        assert_eq!(normalize_status_str("failed"), "failed");
    }
}
