//! External boundaries: order execution and alert delivery.

mod alerts;
mod execution;

pub use alerts::{AlertDispatcher, AlertEvent, LogDispatcher, WebhookDispatcher};
pub use execution::{DryRunClient, ExecutionClient, ExecutionError, Fill, HttpExecutionClient};
