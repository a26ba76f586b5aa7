//! Agent registration, heartbeat, and MCP health probing are out of
//! scope (spec.md §1); the controller's preparation steps still need
//! *some* interface to resolve `node_id -> {base_url, reasoners}`. This
//! is the smallest such interface, with an in-memory reference
//! implementation so the controller is testable standalone — a real
//! deployment substitutes one backed by the external registration
//! subsystem.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;

#[derive(Debug, Clone)]
pub struct AgentRecord {
    pub base_url: String,
    pub reasoners: Vec<String>,
}

impl AgentRecord {
    pub fn has_target(&self, target_name: &str) -> bool {
        self.reasoners.iter().any(|r| r == target_name)
    }
}

#[async_trait]
pub trait AgentDirectory: Send + Sync {
    async fn get(&self, node_id: &str) -> Option<AgentRecord>;
}

#[derive(Default)]
pub struct InMemoryAgentDirectory {
    records: RwLock<HashMap<String, AgentRecord>>,
}

impl InMemoryAgentDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, node_id: impl Into<String>, record: AgentRecord) {
        self.records.write().unwrap().insert(node_id.into(), record);
    }
}

#[async_trait]
impl AgentDirectory for InMemoryAgentDirectory {
    async fn get(&self, node_id: &str) -> Option<AgentRecord> {
        self.records.read().unwrap().get(node_id).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn registers_and_resolves() {
        let directory = InMemoryAgentDirectory::new();
        directory.register(
            "node-1",
            AgentRecord {
                base_url: "http://localhost:9000".to_string(),
                reasoners: vec!["reasoner-a".to_string()],
            },
        );

        let record = directory.get("node-1").await.unwrap();
        assert!(record.has_target("reasoner-a"));
        assert!(!record.has_target("reasoner-b"));
        assert!(directory.get("node-unknown").await.is_none());
    }
}
