//! Execution Controller crate (spec.md §4.1): dispatch preparation, sync
//! and async execution, status updates, and cancellation, wired together
//! over the storage/event-bus/worker-pool/webhook/VC collaborators
//! defined in their own crates.

pub mod agent_directory;
pub mod controller;

pub use agent_directory::{AgentDirectory, AgentRecord, InMemoryAgentDirectory};
pub use controller::{
    AsyncAck, ControllerConfig, ExecuteRequest, ExecuteResponse, ExecutionController,
    StatusResponse,
};
