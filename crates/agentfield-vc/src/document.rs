//! W3C Verifiable Credential document assembly and canonical signing
//! bytes (spec.md §4.6 steps 2-6).

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use agentfield_types::ExecutionStatus;

const MAX_ERROR_MESSAGE_LEN: usize = 500;

/// base64url(SHA-256(bytes)). `null` is hashed as the 4-byte literal
/// `"null"`, matching the spec's canonical-payload rule for a JSON body
/// of `null`.
pub fn hash_payload(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    URL_SAFE_NO_PAD.encode(hasher.finalize())
}

/// Truncates `message` to 500 characters, appending `"...[truncated]"` if
/// it was longer (spec.md §4.6 step 3).
pub fn normalize_error_message(message: &str) -> String {
    if message.chars().count() <= MAX_ERROR_MESSAGE_LEN {
        return message.to_string();
    }
    let truncated: String = message.chars().take(MAX_ERROR_MESSAGE_LEN).collect();
    format!("{truncated}...[truncated]")
}

#[derive(Debug, Clone)]
pub struct CredentialSubjectInput {
    pub execution_id: Uuid,
    pub workflow_id: Uuid,
    pub session_id: Option<String>,
    pub caller_did: String,
    pub target_did: String,
    pub input_hash: String,
    pub output_hash: String,
    pub timestamp: DateTime<Utc>,
    pub duration_ms: Option<i64>,
    pub status: ExecutionStatus,
    pub error_message: Option<String>,
}

/// Builds the credential document with an empty `proof` object, ready to
/// be signed (spec.md §4.6 steps 4-5).
pub fn build_unsigned_document(issuer_did: &str, subject: &CredentialSubjectInput) -> Value {
    let mut execution = json!({
        "input_hash": subject.input_hash,
        "output_hash": subject.output_hash,
        "timestamp": subject.timestamp.to_rfc3339(),
        "duration_ms": subject.duration_ms,
        "status": subject.status.as_str(),
    });
    if let Some(error_message) = &subject.error_message {
        execution["error_message"] = json!(error_message);
    }

    json!({
        "@context": [
            "https://www.w3.org/2018/credentials/v1",
            "https://agentfield.example/credentials/v1",
        ],
        "type": ["VerifiableCredential", "AgentFieldExecutionCredential"],
        "issuer": issuer_did,
        "issuanceDate": Utc::now().to_rfc3339(),
        "credentialSubject": {
            "execution_id": subject.execution_id,
            "workflow_id": subject.workflow_id,
            "session_id": subject.session_id,
            "caller": subject.caller_did,
            "target": subject.target_did,
            "execution": execution,
            "audit": {
                "issuer_did": issuer_did,
            },
        },
        "proof": {},
    })
}

/// The exact bytes that get Ed25519-signed / verified: the document
/// re-serialized with `proof` forced back to `{}` (spec.md §4.6 step 6,
/// and "Verification" paragraph: "re-serialize the document with empty
/// proof"). `serde_json::Value::Object` sorts keys via its internal
/// `BTreeMap`, so this is canonical without a separate canonicalization
/// pass.
pub fn signing_bytes(document: &Value) -> Vec<u8> {
    let mut document = document.clone();
    if let Some(object) = document.as_object_mut() {
        object.insert("proof".to_string(), json!({}));
    }
    serde_json::to_vec(&document).expect("VC document is always serializable")
}

pub fn attach_proof(mut document: Value, verification_method: &str, signature_b64url: &str) -> Value {
    document["proof"] = json!({
        "type": "Ed25519Signature2020",
        "created": Utc::now().to_rfc3339(),
        "verificationMethod": verification_method,
        "proofPurpose": "assertionMethod",
        "proofValue": signature_b64url,
    });
    document
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncates_long_error_messages() {
        let message = "x".repeat(600);
        let normalized = normalize_error_message(&message);
        assert!(normalized.ends_with("...[truncated]"));
        assert_eq!(normalized.chars().count(), MAX_ERROR_MESSAGE_LEN + "...[truncated]".len());
    }

    #[test]
    fn leaves_short_error_messages_untouched() {
        assert_eq!(normalize_error_message("boom"), "boom");
    }

    #[test]
    fn hash_is_deterministic_and_sensitive_to_content() {
        let a = hash_payload(b"hello");
        let b = hash_payload(b"hello");
        let c = hash_payload(b"goodbye");
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn signing_bytes_ignore_existing_proof_contents() {
        let subject = CredentialSubjectInput {
            execution_id: Uuid::new_v4(),
            workflow_id: Uuid::new_v4(),
            session_id: None,
            caller_did: "did:agentfield:caller".into(),
            target_did: "did:agentfield:target".into(),
            input_hash: "abc".into(),
            output_hash: "def".into(),
            timestamp: Utc::now(),
            duration_ms: Some(12),
            status: ExecutionStatus::Succeeded,
            error_message: None,
        };
        let document = build_unsigned_document("did:agentfield:issuer", &subject);
        let signed = attach_proof(document.clone(), "did:agentfield:issuer#key-1", "sig");
        assert_eq!(signing_bytes(&document), signing_bytes(&signed));
    }
}
