pub mod did;
pub mod document;
pub mod service;

pub use did::{DidRecord, DidResolver, InMemoryDidResolver, Jwk};
pub use document::{hash_payload, normalize_error_message};
pub use service::{ComprehensiveIssue, ComprehensiveReport, GenerateContext, VcConfig, VcError, VcService, VerifyResult};
