use std::sync::Arc;

use agentfield_controller::{ExecutionController, InMemoryAgentDirectory};
use agentfield_vc::{InMemoryDidResolver, VcService};

use crate::config::AppConfig;

pub type SharedState = Arc<AppState>;

pub struct AppState {
    pub controller: ExecutionController,
    pub vc_service: Arc<VcService>,
    pub did_resolver: Arc<InMemoryDidResolver>,
    pub agent_directory: Arc<InMemoryAgentDirectory>,
    pub config: AppConfig,
}

impl AppState {
    pub fn new(
        controller: ExecutionController,
        vc_service: Arc<VcService>,
        did_resolver: Arc<InMemoryDidResolver>,
        agent_directory: Arc<InMemoryAgentDirectory>,
        config: AppConfig,
    ) -> SharedState {
        Arc::new(Self {
            controller,
            vc_service,
            did_resolver,
            agent_directory,
            config,
        })
    }
}
