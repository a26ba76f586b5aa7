pub mod error;
pub mod execution;
pub mod target;
pub mod vc;
pub mod webhook;

pub use error::ControlPlaneError;
pub use execution::{Execution, ExecutionStatus, ResultPayload};
pub use target::Target;
pub use vc::{normalize_status_str, rollup_status, ExecutionVc, WorkflowVc, WorkflowVcChain};
pub use webhook::{ExecutionWebhook, WebhookEvent, WebhookSpec, WebhookStatus};
