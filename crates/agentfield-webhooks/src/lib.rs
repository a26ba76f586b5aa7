pub mod backoff;
pub mod dispatcher;
pub mod signing;

pub use dispatcher::{WebhookDispatcher, WebhookDispatcherConfig, WebhookError};
