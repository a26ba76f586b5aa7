//! Minimal DID resolution (spec.md §4.6 supplement, `SPEC_FULL.md` §4.6b).
//! Full DID/keystore bootstrap is out of scope; this is the smallest
//! interface the issuance/verification pipeline needs to look up an
//! Ed25519 public key by DID, grounded on the teacher's `VerifyingKey`
//! handling in `vdb::lib`.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use ed25519_dalek::{SigningKey, VerifyingKey};
use serde::{Deserialize, Serialize};

/// JSON Web Key, restricted to the OKP/Ed25519 case this service issues
/// and resolves.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Jwk {
    pub kty: String,
    pub crv: String,
    pub x: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub d: Option<String>,
}

impl Jwk {
    pub fn public_from(verifying_key: &VerifyingKey) -> Self {
        Self {
            kty: "OKP".to_string(),
            crv: "Ed25519".to_string(),
            x: URL_SAFE_NO_PAD.encode(verifying_key.as_bytes()),
            d: None,
        }
    }

    pub fn keypair_from(signing_key: &SigningKey) -> (Self, Self) {
        let verifying_key = signing_key.verifying_key();
        let public = Self::public_from(&verifying_key);
        let private = Self {
            d: Some(URL_SAFE_NO_PAD.encode(signing_key.to_bytes())),
            ..public.clone()
        };
        (public, private)
    }

    pub fn to_verifying_key(&self) -> Result<VerifyingKey, DidError> {
        let bytes = URL_SAFE_NO_PAD
            .decode(&self.x)
            .map_err(|e| DidError::MalformedKey(e.to_string()))?;
        let bytes: [u8; 32] = bytes
            .try_into()
            .map_err(|_| DidError::MalformedKey("public key is not 32 bytes".to_string()))?;
        VerifyingKey::from_bytes(&bytes).map_err(|e| DidError::MalformedKey(e.to_string()))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DidRecord {
    pub did: String,
    pub public_key_jwk: Jwk,
}

#[derive(Debug, thiserror::Error)]
pub enum DidError {
    #[error("did not found: {0}")]
    NotFound(String),
    #[error("malformed key: {0}")]
    MalformedKey(String),
}

/// Resolves a DID to its public key material. Target DID resolution is
/// best-effort by contract (spec.md §4.6 step 1): callers treat a
/// `None`/`Err` as "leave the field empty", not a hard failure.
#[async_trait]
pub trait DidResolver: Send + Sync {
    async fn resolve(&self, did: &str) -> Option<DidRecord>;
}

/// Reference in-process registry, sufficient for a single-node deployment
/// and for tests.
#[derive(Default)]
pub struct InMemoryDidResolver {
    records: RwLock<HashMap<String, DidRecord>>,
}

impl InMemoryDidResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, did: impl Into<String>, public_key_jwk: Jwk) {
        let did = did.into();
        self.records.write().unwrap().insert(
            did.clone(),
            DidRecord {
                did,
                public_key_jwk,
            },
        );
    }
}

#[async_trait]
impl DidResolver for InMemoryDidResolver {
    async fn resolve(&self, did: &str) -> Option<DidRecord> {
        self.records.read().unwrap().get(did).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ed25519_dalek::SigningKey;
    use rand_core::OsRng;

    #[tokio::test]
    async fn register_then_resolve_roundtrips() {
        let signing_key = SigningKey::generate(&mut OsRng);
        let (public, _private) = Jwk::keypair_from(&signing_key);
        let resolver = InMemoryDidResolver::new();
        resolver.register("did:agentfield:node-1", public.clone());

        let record = resolver.resolve("did:agentfield:node-1").await.unwrap();
        assert_eq!(record.public_key_jwk.x, public.x);
        assert!(resolver.resolve("did:agentfield:unknown").await.is_none());
    }

    #[test]
    fn jwk_roundtrips_through_verifying_key() {
        let signing_key = SigningKey::generate(&mut OsRng);
        let (public, _) = Jwk::keypair_from(&signing_key);
        let recovered = public.to_verifying_key().unwrap();
        assert_eq!(recovered, signing_key.verifying_key());
    }
}
