use anyhow::{bail, Context, Result};
use std::time::Duration;

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub database_url: Option<String>,
    pub bind_addr: String,

    pub exec_async_queue_capacity: usize,
    pub worker_count: usize,
    pub exec_default_timeout: Duration,

    pub webhook_worker_count: usize,
    pub webhook_queue_size: usize,
    pub webhook_poll_interval: Duration,
    pub webhook_max_attempts: i32,
    pub webhook_retry_backoff: Duration,
    pub webhook_max_retry_backoff: Duration,

    pub issuer_did: String,
    pub issuer_signing_key_b64: Option<String>,
    pub vc_enabled: bool,
    pub vc_hash_sensitive_data: bool,
    pub vc_persist: bool,

    pub agents_static_file: Option<String>,

    /// Directory for spilled oversized results (spec.md §3 invariant 3).
    /// Absence selects an in-memory payload store, same fallback as
    /// `database_url`.
    pub payload_store_dir: Option<String>,
}

impl AppConfig {
    pub fn from_env() -> Result<Self> {
        let database_url = std::env::var("DATABASE_URL").ok();
        let bind_addr = std::env::var("ORCH_BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:8080".to_string());

        let exec_async_queue_capacity = env_usize("AGENTFIELD_EXEC_ASYNC_QUEUE_CAPACITY", 1024)?;
        let worker_count = env_usize("AGENTFIELD_WORKER_COUNT", 32)?;
        let exec_default_timeout = Duration::from_millis(env_u64("AGENTFIELD_EXEC_TIMEOUT_MS", 30_000)?);

        let webhook_worker_count = env_usize("AGENTFIELD_WEBHOOK_WORKER_COUNT", 8)?;
        let webhook_queue_size = env_usize("AGENTFIELD_WEBHOOK_QUEUE_SIZE", 256)?;
        let webhook_poll_interval = Duration::from_millis(env_u64("AGENTFIELD_WEBHOOK_POLL_INTERVAL_MS", 2_000)?);
        let webhook_max_attempts = env_usize("AGENTFIELD_WEBHOOK_MAX_ATTEMPTS", 8)? as i32;
        let webhook_retry_backoff = Duration::from_millis(env_u64("AGENTFIELD_WEBHOOK_RETRY_BACKOFF_MS", 5_000)?);
        let webhook_max_retry_backoff = Duration::from_millis(env_u64("AGENTFIELD_WEBHOOK_MAX_RETRY_BACKOFF_MS", 600_000)?);

        let issuer_did = std::env::var("AGENTFIELD_ISSUER_DID").unwrap_or_else(|_| "did:agentfield:orchestrator".to_string());
        let issuer_signing_key_b64 = std::env::var("AGENTFIELD_ISSUER_SIGNING_KEY").ok();
        let vc_enabled = env_bool("AGENTFIELD_VC_ENABLED", true);
        let vc_hash_sensitive_data = env_bool("AGENTFIELD_VC_HASH_SENSITIVE_DATA", true);
        let vc_persist = env_bool("AGENTFIELD_VC_PERSIST", true);

        let agents_static_file = std::env::var("AGENTFIELD_AGENTS_STATIC_FILE").ok();
        let payload_store_dir = std::env::var("AGENTFIELD_PAYLOAD_STORE_DIR").ok();

        if let Some(url) = &database_url {
            if !url.starts_with("postgres://") && !url.starts_with("postgresql://") {
                bail!("DATABASE_URL must be a postgres:// connection string");
            }
        }

        Ok(Self {
            database_url,
            bind_addr,
            exec_async_queue_capacity,
            worker_count,
            exec_default_timeout,
            webhook_worker_count,
            webhook_queue_size,
            webhook_poll_interval,
            webhook_max_attempts,
            webhook_retry_backoff,
            webhook_max_retry_backoff,
            issuer_did,
            issuer_signing_key_b64,
            vc_enabled,
            vc_hash_sensitive_data,
            vc_persist,
            agents_static_file,
            payload_store_dir,
        })
    }
}

fn env_usize(key: &str, default: usize) -> Result<usize> {
    match std::env::var(key) {
        Ok(v) => v.parse().with_context(|| format!("{key} must be a non-negative integer")),
        Err(_) => Ok(default),
    }
}

fn env_u64(key: &str, default: u64) -> Result<u64> {
    match std::env::var(key) {
        Ok(v) => v.parse().with_context(|| format!("{key} must be a non-negative integer")),
        Err(_) => Ok(default),
    }
}

fn env_bool(key: &str, default: bool) -> bool {
    std::env::var(key)
        .ok()
        .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "yes" | "YES"))
        .unwrap_or(default)
}
