mod config;
mod error;
mod routes;
mod state;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::routing::{get, post, put};
use axum::Router;
use ed25519_dalek::SigningKey;
use rand_core::OsRng;
use sqlx::PgPool;
use tower_http::cors::CorsLayer;
use tracing::info;

use agentfield_controller::{AgentRecord, ControllerConfig, ExecutionController, InMemoryAgentDirectory};
use agentfield_eventbus::EventBus;
use agentfield_storage::memory::InMemoryStorage;
use agentfield_storage::payload::{FsPayloadStore, InMemoryPayloadStore};
use agentfield_storage::pg::PgStorage;
use agentfield_storage::{PayloadStore, Storage};
use agentfield_vc::{InMemoryDidResolver, Jwk, VcConfig, VcService};
use agentfield_webhooks::{WebhookDispatcher, WebhookDispatcherConfig};
use agentfield_workerpool::{WorkerPool, WorkerPoolConfig};

use crate::config::AppConfig;
use crate::state::AppState;

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cfg = AppConfig::from_env()?;

    let storage: Arc<dyn Storage> = match &cfg.database_url {
        Some(database_url) => {
            let pg_pool = PgPool::connect(database_url)
                .await
                .context("failed to connect to Postgres")?;
            let storage = PgStorage::from_pool(pg_pool);
            storage.migrate().await.context("failed to run migrations")?;
            Arc::new(storage)
        }
        None => {
            tracing::warn!("DATABASE_URL not set; running against an in-memory store (state is lost on restart)");
            Arc::new(InMemoryStorage::new())
        }
    };

    let event_bus = Arc::new(EventBus::default());

    let worker_pool = Arc::new(WorkerPool::start(WorkerPoolConfig {
        worker_count: cfg.worker_count,
        queue_capacity: cfg.exec_async_queue_capacity,
    }));

    let webhook_dispatcher = Arc::new(WebhookDispatcher::new(
        storage.clone(),
        WebhookDispatcherConfig {
            worker_count: cfg.webhook_worker_count,
            queue_size: cfg.webhook_queue_size,
            poll_interval: cfg.webhook_poll_interval,
            max_attempts: cfg.webhook_max_attempts,
            retry_backoff: cfg.webhook_retry_backoff,
            max_retry_backoff: cfg.webhook_max_retry_backoff,
            ..WebhookDispatcherConfig::default()
        },
    ));
    webhook_dispatcher.start().await;

    let signing_key = load_or_generate_signing_key(&cfg)?;
    let did_resolver = Arc::new(InMemoryDidResolver::new());
    let (public_jwk, _private_jwk) = Jwk::keypair_from(&signing_key);
    did_resolver.register(cfg.issuer_did.clone(), public_jwk);

    let vc_service = Arc::new(VcService::new(
        cfg.issuer_did.clone(),
        signing_key,
        did_resolver.clone(),
        storage.clone(),
        VcConfig {
            enabled: cfg.vc_enabled,
            hash_sensitive_data: cfg.vc_hash_sensitive_data,
            persist: cfg.vc_persist,
        },
    ));

    let agent_directory = Arc::new(InMemoryAgentDirectory::new());
    load_static_agents(&cfg, &agent_directory)?;

    let payload_store: Arc<dyn PayloadStore> = match &cfg.payload_store_dir {
        Some(dir) => Arc::new(FsPayloadStore::new(dir)),
        None => {
            tracing::warn!("AGENTFIELD_PAYLOAD_STORE_DIR not set; spilled results are held in memory only");
            Arc::new(InMemoryPayloadStore::new())
        }
    };

    let controller = ExecutionController::new(
        storage.clone(),
        event_bus.clone(),
        worker_pool.clone(),
        webhook_dispatcher.clone(),
        Some(vc_service.clone()),
        agent_directory.clone(),
        payload_store,
        ControllerConfig {
            vc_enabled_for_terminal: cfg.vc_enabled,
        },
    );

    // Periodic event-bus GC: a subscriber can drop (request finished or
    // timed out) well before the next publish for its execution id
    // (spec.md §9 "lossy event fan-out").
    let sweep_bus = event_bus.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(60));
        loop {
            interval.tick().await;
            sweep_bus.sweep();
        }
    });

    let app_state = AppState::new(controller, vc_service, did_resolver, agent_directory, cfg.clone());

    let app = Router::new()
        .route("/api/v1/execute/:target", post(routes::execute_sync))
        .route("/api/v1/execute/async/:target", post(routes::execute_async))
        .route("/api/v1/executions/:execution_id", get(routes::get_execution))
        .route("/api/v1/executions/:execution_id/status", put(routes::update_status))
        .route("/api/v1/executions/:execution_id/cancel", post(routes::cancel_execution))
        .route("/api/v1/executions/batch-status", post(routes::batch_status))
        .route("/api/v1/did/register", post(routes::did_register))
        .route("/api/v1/did/resolve/:did", get(routes::did_resolve))
        .route("/api/v1/did/verify", post(routes::did_verify))
        .route("/api/v1/did/workflow/:workflow_id/vc-chain", get(routes::workflow_vc_chain))
        .route("/api/v1/execution/vc", post(routes::issue_execution_vc))
        .layer(CorsLayer::permissive())
        .with_state(app_state);

    let addr = &cfg.bind_addr;
    info!("orchestrator listening on http://{addr}");
    let listener = tokio::net::TcpListener::bind(addr).await.context("failed to bind listen address")?;
    axum::serve(listener, app).await.context("server error")?;

    Ok(())
}

fn load_or_generate_signing_key(cfg: &AppConfig) -> Result<SigningKey> {
    use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};

    match &cfg.issuer_signing_key_b64 {
        Some(encoded) => {
            let bytes = URL_SAFE_NO_PAD
                .decode(encoded)
                .context("AGENTFIELD_ISSUER_SIGNING_KEY is not valid base64url")?;
            let bytes: [u8; 32] = bytes
                .try_into()
                .map_err(|_| anyhow::anyhow!("AGENTFIELD_ISSUER_SIGNING_KEY must decode to 32 bytes"))?;
            Ok(SigningKey::from_bytes(&bytes))
        }
        None => {
            tracing::warn!("AGENTFIELD_ISSUER_SIGNING_KEY not set; generating an ephemeral issuer key for this process");
            Ok(SigningKey::generate(&mut OsRng))
        }
    }
}

/// Optional static agent registration from a JSON file
/// (`{"node-1": {"base_url": "...", "reasoners": ["a","b"]}}`), since
/// agent registration/heartbeat is out of scope (spec.md §1) but the
/// controller needs some way to resolve a node id during local runs and
/// tests.
fn load_static_agents(cfg: &AppConfig, directory: &InMemoryAgentDirectory) -> Result<()> {
    let Some(path) = &cfg.agents_static_file else {
        return Ok(());
    };
    let raw = std::fs::read_to_string(path).with_context(|| format!("failed to read {path}"))?;
    let parsed: std::collections::HashMap<String, StaticAgent> =
        serde_json::from_str(&raw).with_context(|| format!("failed to parse {path} as agent directory JSON"))?;
    for (node_id, agent) in parsed {
        directory.register(
            node_id,
            AgentRecord {
                base_url: agent.base_url,
                reasoners: agent.reasoners,
            },
        );
    }
    Ok(())
}

#[derive(serde::Deserialize)]
struct StaticAgent {
    base_url: String,
    reasoners: Vec<String>,
}
