//! Verifiable Credential issuance and verification service (spec.md
//! §4.6). Grounded on the teacher's `VerifiableKV` Ed25519 signing flow in
//! `vdb::lib` — generalized from signing append-only KV events to signing
//! W3C VC JSON-LD documents — and on `claims::store` for the
//! append-only persisted-credential pattern.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use chrono::{DateTime, Utc};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier};
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

use agentfield_storage::{Storage, StorageError, VcFilter};
use agentfield_types::{rollup_status, normalize_status_str, ExecutionStatus, ExecutionVc, WorkflowVc, WorkflowVcChain};

use crate::did::{DidResolver, Jwk};
use crate::document::{attach_proof, build_unsigned_document, hash_payload, normalize_error_message, signing_bytes, CredentialSubjectInput};

#[derive(Debug, Error)]
pub enum VcError {
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("execution vc not found for execution {0}")]
    NotFound(Uuid),
    #[error("malformed vc document: {0}")]
    Malformed(String),
}

#[derive(Debug, Clone)]
pub struct VcConfig {
    pub enabled: bool,
    pub hash_sensitive_data: bool,
    pub persist: bool,
}

impl Default for VcConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            hash_sensitive_data: true,
            persist: true,
        }
    }
}

/// Inputs for one issuance call, gathered by the caller (typically the
/// controller's `UpdateStatus` path) before invoking the VC service.
#[derive(Debug, Clone)]
pub struct GenerateContext {
    pub execution_id: Uuid,
    pub workflow_id: Uuid,
    pub session_id: Option<String>,
    pub caller_did: String,
    pub target_did_hint: String,
    pub input_bytes: Vec<u8>,
    pub output_bytes: Vec<u8>,
    pub status: ExecutionStatus,
    pub error: Option<String>,
    pub duration_ms: Option<i64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct VerifyResult {
    pub valid: bool,
    pub issuer_did: Option<String>,
    pub issued_at: Option<DateTime<Utc>>,
    pub message: Option<String>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ComprehensiveIssue {
    pub field: String,
    pub severity: &'static str,
    pub message: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ComprehensiveReport {
    pub valid: bool,
    pub issues: Vec<ComprehensiveIssue>,
}

/// Issues and verifies Verifiable Credentials for terminal executions.
/// The signer is always this service's own issuer DID key — "caller DID"
/// resolution (spec.md §4.6 step 1) is best-effort and informational
/// only, recorded on the credential subject but never used to select a
/// signing key.
pub struct VcService {
    issuer_did: String,
    signing_key: SigningKey,
    resolver: Arc<dyn DidResolver>,
    storage: Arc<dyn Storage>,
    config: VcConfig,
    issuance_success: AtomicU64,
    issuance_failure: AtomicU64,
}

impl VcService {
    pub fn new(
        issuer_did: String,
        signing_key: SigningKey,
        resolver: Arc<dyn DidResolver>,
        storage: Arc<dyn Storage>,
        config: VcConfig,
    ) -> Self {
        Self {
            issuer_did,
            signing_key,
            resolver,
            storage,
            config,
            issuance_success: AtomicU64::new(0),
            issuance_failure: AtomicU64::new(0),
        }
    }

    /// Snapshot of issuance outcomes since startup (no metrics crate is
    /// introduced; these are surfaced only through `tracing` spans at
    /// issuance time, this accessor exists for tests).
    pub fn issuance_counts(&self) -> (u64, u64) {
        (
            self.issuance_success.load(Ordering::Relaxed),
            self.issuance_failure.load(Ordering::Relaxed),
        )
    }

    pub fn issuer_did(&self) -> &str {
        &self.issuer_did
    }

    pub fn public_jwk(&self) -> Jwk {
        Jwk::public_from(&self.signing_key.verifying_key())
    }

    /// `Ok(None)` means issuance is disabled by policy, not an error
    /// (spec.md §4.6 contract).
    pub async fn generate_execution_vc(
        &self,
        ctx: GenerateContext,
    ) -> Result<Option<ExecutionVc>, VcError> {
        if !self.config.enabled {
            return Ok(None);
        }

        let target_did = self
            .resolver
            .resolve(&ctx.target_did_hint)
            .await
            .map(|record| record.did)
            .unwrap_or_default();

        let (input_hash, output_hash) = if self.config.hash_sensitive_data {
            (hash_payload(&ctx.input_bytes), hash_payload(&ctx.output_bytes))
        } else {
            (String::new(), String::new())
        };

        let error_message = ctx.error.as_deref().map(normalize_error_message);

        let subject = CredentialSubjectInput {
            execution_id: ctx.execution_id,
            workflow_id: ctx.workflow_id,
            session_id: ctx.session_id.clone(),
            caller_did: ctx.caller_did.clone(),
            target_did: target_did.clone(),
            input_hash: input_hash.clone(),
            output_hash: output_hash.clone(),
            timestamp: Utc::now(),
            duration_ms: ctx.duration_ms,
            status: ctx.status,
            error_message: error_message.clone(),
        };

        let document = build_unsigned_document(&self.issuer_did, &subject);
        let bytes = signing_bytes(&document);
        let signature: Signature = self.signing_key.sign(&bytes);
        let signature_b64 = URL_SAFE_NO_PAD.encode(signature.to_bytes());
        let verification_method = format!("{}#key-1", self.issuer_did);
        let document = attach_proof(document, &verification_method, &signature_b64);
        let document_size = match serde_json::to_vec(&document) {
            Ok(bytes) => bytes.len(),
            Err(e) => {
                self.issuance_failure.fetch_add(1, Ordering::Relaxed);
                warn!(execution_id = %ctx.execution_id, error = %e, "execution vc issuance failed");
                return Err(VcError::Malformed(e.to_string()));
            }
        };

        let vc = ExecutionVc {
            vc_id: Uuid::new_v4(),
            execution_id: ctx.execution_id,
            workflow_id: ctx.workflow_id,
            session_id: ctx.session_id,
            issuer_did: self.issuer_did.clone(),
            target_did,
            caller_did: ctx.caller_did,
            input_hash,
            output_hash,
            status: ctx.status,
            vc_document: document,
            signature: signature_b64,
            storage_uri: None,
            document_size,
            created_at: Utc::now(),
        };

        if self.config.persist {
            if let Err(e) = self.storage.put_vc(vc.clone()).await {
                self.issuance_failure.fetch_add(1, Ordering::Relaxed);
                warn!(execution_id = %ctx.execution_id, error = %e, "execution vc persistence failed");
                return Err(VcError::from(e));
            }
        }

        self.issuance_success.fetch_add(1, Ordering::Relaxed);
        info!(execution_id = %ctx.execution_id, vc_id = %vc.vc_id, "execution vc issued");
        Ok(Some(vc))
    }

    /// Re-serializes `document` with an empty proof, resolves the issuer
    /// DID, and verifies the Ed25519 signature over those canonical bytes
    /// (spec.md §4.6 "Verification").
    pub async fn verify_vc(&self, document: &Value) -> VerifyResult {
        let issuer_did = match document.get("issuer").and_then(Value::as_str) {
            Some(issuer) => issuer.to_string(),
            None => {
                return VerifyResult {
                    valid: false,
                    issuer_did: None,
                    issued_at: None,
                    message: None,
                    error: Some("document missing 'issuer'".to_string()),
                }
            }
        };

        let proof_value = document
            .get("proof")
            .and_then(|p| p.get("proofValue"))
            .and_then(Value::as_str);
        let Some(proof_value) = proof_value else {
            return VerifyResult {
                valid: false,
                issuer_did: Some(issuer_did),
                issued_at: None,
                message: None,
                error: Some("document missing proof.proofValue".to_string()),
            };
        };

        let Some(record) = self.resolver.resolve(&issuer_did).await else {
            return VerifyResult {
                valid: false,
                issuer_did: Some(issuer_did.clone()),
                issued_at: None,
                message: None,
                error: Some(format!("unable to resolve issuer did {issuer_did}")),
            };
        };

        let verifying_key = match record.public_key_jwk.to_verifying_key() {
            Ok(key) => key,
            Err(e) => {
                return VerifyResult {
                    valid: false,
                    issuer_did: Some(issuer_did),
                    issued_at: None,
                    message: None,
                    error: Some(e.to_string()),
                }
            }
        };

        let signature_bytes = match URL_SAFE_NO_PAD.decode(proof_value) {
            Ok(bytes) => bytes,
            Err(e) => {
                return VerifyResult {
                    valid: false,
                    issuer_did: Some(issuer_did),
                    issued_at: None,
                    message: None,
                    error: Some(format!("malformed proofValue: {e}")),
                }
            }
        };
        let signature = match Signature::from_slice(&signature_bytes) {
            Ok(sig) => sig,
            Err(e) => {
                return VerifyResult {
                    valid: false,
                    issuer_did: Some(issuer_did),
                    issued_at: None,
                    message: None,
                    error: Some(format!("malformed signature: {e}")),
                }
            }
        };

        let bytes = signing_bytes(document);
        let issued_at = document
            .get("issuanceDate")
            .and_then(Value::as_str)
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|dt| dt.with_timezone(&Utc));

        match verifying_key.verify(&bytes, &signature) {
            Ok(()) => VerifyResult {
                valid: true,
                issuer_did: Some(issuer_did),
                issued_at,
                message: Some("signature valid".to_string()),
                error: None,
            },
            Err(e) => VerifyResult {
                valid: false,
                issuer_did: Some(issuer_did),
                issued_at,
                message: None,
                error: Some(e.to_string()),
            },
        }
    }

    pub async fn query_execution_vcs(&self, filter: VcFilter) -> Result<Vec<ExecutionVc>, VcError> {
        Ok(self.storage.query_vcs(filter).await?)
    }

    pub async fn list_workflow_vcs(&self) -> Result<Vec<WorkflowVc>, VcError> {
        let workflow_ids = self.storage.list_workflow_ids().await?;
        let mut workflow_vcs = Vec::with_capacity(workflow_ids.len());
        for workflow_id in workflow_ids {
            let components = self.storage.list_workflow_component_vcs(workflow_id).await?;
            workflow_vcs.push(rollup_workflow_vc(workflow_id, &components));
        }
        Ok(workflow_vcs)
    }

    pub async fn get_workflow_vc_chain(&self, workflow_id: Uuid) -> Result<WorkflowVcChain, VcError> {
        let components = self.storage.list_workflow_component_vcs(workflow_id).await?;
        let workflow_vc = rollup_workflow_vc(workflow_id, &components);
        Ok(WorkflowVcChain {
            workflow_id,
            workflow_vc,
            components,
        })
    }

    /// Deep verification: structural signature check plus an equality
    /// assertion between every stored metadata scalar and its embedded
    /// document counterpart (spec.md §4.6 "Comprehensive verification").
    pub async fn verify_execution_vc_comprehensive(
        &self,
        execution_id: Uuid,
    ) -> Result<ComprehensiveReport, VcError> {
        let vc = self
            .storage
            .get_vc_by_execution(execution_id)
            .await?
            .ok_or(VcError::NotFound(execution_id))?;

        let signature_check = self.verify_vc(&vc.vc_document).await;
        let mut issues = Vec::new();
        if !signature_check.valid {
            issues.push(ComprehensiveIssue {
                field: "proof".to_string(),
                severity: "critical",
                message: signature_check
                    .error
                    .clone()
                    .unwrap_or_else(|| "signature invalid".to_string()),
            });
        }

        let subject = vc.vc_document.get("credentialSubject").cloned().unwrap_or_default();
        check_scalar(&mut issues, "issuer", &vc.issuer_did, vc.vc_document.get("issuer").and_then(Value::as_str));
        check_uuid(&mut issues, "execution_id", vc.execution_id, subject.get("execution_id"));
        check_uuid(&mut issues, "workflow_id", vc.workflow_id, subject.get("workflow_id"));
        check_scalar(&mut issues, "caller", &vc.caller_did, subject.get("caller").and_then(Value::as_str));
        check_scalar(&mut issues, "target", &vc.target_did, subject.get("target").and_then(Value::as_str));
        check_scalar(
            &mut issues,
            "session_id",
            vc.session_id.as_deref().unwrap_or(""),
            subject.get("session_id").and_then(Value::as_str).or(Some("")),
        );

        let embedded_status = subject
            .get("execution")
            .and_then(|e| e.get("status"))
            .and_then(Value::as_str)
            .unwrap_or("");
        if normalize_status_str(vc.status.as_str()) != normalize_status_str(embedded_status) {
            issues.push(ComprehensiveIssue {
                field: "status".to_string(),
                severity: "critical",
                message: format!("stored status {} != embedded status {embedded_status}", vc.status.as_str()),
            });
        }

        let embedded_input_hash = subject
            .get("execution")
            .and_then(|e| e.get("input_hash"))
            .and_then(Value::as_str)
            .unwrap_or("");
        check_scalar(&mut issues, "input_hash", &vc.input_hash, Some(embedded_input_hash));

        let embedded_output_hash = subject
            .get("execution")
            .and_then(|e| e.get("output_hash"))
            .and_then(Value::as_str)
            .unwrap_or("");
        check_scalar(&mut issues, "output_hash", &vc.output_hash, Some(embedded_output_hash));

        Ok(ComprehensiveReport {
            valid: signature_check.valid && issues.is_empty(),
            issues,
        })
    }
}

fn check_scalar(issues: &mut Vec<ComprehensiveIssue>, field: &str, expected: &str, actual: Option<&str>) {
    if actual != Some(expected) {
        issues.push(ComprehensiveIssue {
            field: field.to_string(),
            severity: "critical",
            message: format!("stored {field} {expected:?} != embedded {actual:?}"),
        });
    }
}

fn check_uuid(issues: &mut Vec<ComprehensiveIssue>, field: &str, expected: Uuid, actual: Option<&Value>) {
    let matches = actual
        .and_then(Value::as_str)
        .and_then(|s| s.parse::<Uuid>().ok())
        .map(|id| id == expected)
        .unwrap_or(false);
    if !matches {
        issues.push(ComprehensiveIssue {
            field: field.to_string(),
            severity: "critical",
            message: format!("stored {field} {expected} missing or mismatched in document"),
        });
    }
}

fn rollup_workflow_vc(workflow_id: Uuid, components: &[ExecutionVc]) -> WorkflowVc {
    let statuses: Vec<ExecutionStatus> = components.iter().map(|c| c.status).collect();
    let status = rollup_status(&statuses);
    let start_time = components
        .iter()
        .map(|c| c.created_at)
        .min()
        .unwrap_or_else(Utc::now);
    let end_time = if status.is_terminal() {
        components.iter().map(|c| c.created_at).max()
    } else {
        None
    };
    WorkflowVc {
        workflow_id,
        status,
        start_time,
        end_time,
        component_vc_ids: components.iter().map(|c| c.vc_id).collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::did::InMemoryDidResolver;
    use agentfield_storage::memory::InMemoryStorage;
    use rand_core::OsRng;

    fn issuer() -> (String, SigningKey) {
        ("did:agentfield:issuer".to_string(), SigningKey::generate(&mut OsRng))
    }

    fn service_with(resolver: Arc<InMemoryDidResolver>) -> (VcService, SigningKey) {
        let (issuer_did, signing_key) = issuer();
        let (public, _) = Jwk::keypair_from(&signing_key);
        resolver.register(issuer_did.clone(), public);
        let storage: Arc<dyn Storage> = Arc::new(InMemoryStorage::new());
        let service = VcService::new(
            issuer_did,
            signing_key.clone(),
            resolver,
            storage,
            VcConfig::default(),
        );
        (service, signing_key)
    }

    #[tokio::test]
    async fn issuance_produces_a_verifiable_document() {
        let resolver = Arc::new(InMemoryDidResolver::new());
        let (service, _signing_key) = service_with(resolver);

        let vc = service
            .generate_execution_vc(GenerateContext {
                execution_id: Uuid::new_v4(),
                workflow_id: Uuid::new_v4(),
                session_id: None,
                caller_did: "did:agentfield:caller".into(),
                target_did_hint: "did:agentfield:unregistered-target".into(),
                input_bytes: b"{\"foo\":\"bar\"}".to_vec(),
                output_bytes: b"{\"answer\":42}".to_vec(),
                status: ExecutionStatus::Succeeded,
                error: None,
                duration_ms: Some(42),
            })
            .await
            .unwrap()
            .unwrap();

        assert_eq!(vc.target_did, "");
        let result = service.verify_vc(&vc.vc_document).await;
        assert!(result.valid, "{:?}", result.error);
    }

    #[tokio::test]
    async fn disabled_policy_returns_none() {
        let resolver = Arc::new(InMemoryDidResolver::new());
        let (issuer_did, signing_key) = issuer();
        let storage: Arc<dyn Storage> = Arc::new(InMemoryStorage::new());
        let service = VcService::new(
            issuer_did,
            signing_key,
            resolver,
            storage,
            VcConfig {
                enabled: false,
                ..VcConfig::default()
            },
        );

        let vc = service
            .generate_execution_vc(GenerateContext {
                execution_id: Uuid::new_v4(),
                workflow_id: Uuid::new_v4(),
                session_id: None,
                caller_did: "did:agentfield:caller".into(),
                target_did_hint: "did:agentfield:target".into(),
                input_bytes: vec![],
                output_bytes: vec![],
                status: ExecutionStatus::Succeeded,
                error: None,
                duration_ms: None,
            })
            .await
            .unwrap();
        assert!(vc.is_none());
    }

    #[tokio::test]
    async fn tampered_document_fails_verification() {
        let resolver = Arc::new(InMemoryDidResolver::new());
        let (service, _) = service_with(resolver);

        let mut vc = service
            .generate_execution_vc(GenerateContext {
                execution_id: Uuid::new_v4(),
                workflow_id: Uuid::new_v4(),
                session_id: None,
                caller_did: "did:agentfield:caller".into(),
                target_did_hint: "did:agentfield:target".into(),
                input_bytes: vec![1],
                output_bytes: vec![2],
                status: ExecutionStatus::Succeeded,
                error: None,
                duration_ms: None,
            })
            .await
            .unwrap()
            .unwrap();

        vc.vc_document["credentialSubject"]["caller"] = serde_json::json!("did:agentfield:attacker");
        let result = service.verify_vc(&vc.vc_document).await;
        assert!(!result.valid);
    }

    #[tokio::test]
    async fn comprehensive_verification_flags_metadata_drift() {
        let resolver = Arc::new(InMemoryDidResolver::new());
        let (service, _) = service_with(resolver);

        let vc = service
            .generate_execution_vc(GenerateContext {
                execution_id: Uuid::new_v4(),
                workflow_id: Uuid::new_v4(),
                session_id: None,
                caller_did: "did:agentfield:caller".into(),
                target_did_hint: "did:agentfield:target".into(),
                input_bytes: vec![1],
                output_bytes: vec![2],
                status: ExecutionStatus::Succeeded,
                error: None,
                duration_ms: None,
            })
            .await
            .unwrap()
            .unwrap();

        let report = service
            .verify_execution_vc_comprehensive(vc.execution_id)
            .await
            .unwrap();
        assert!(report.valid, "{:?}", report.issues);
    }
}
