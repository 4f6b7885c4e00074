//! Job execution: requests, results and the coordinator that turns one into
//! the other.

mod coordinator;
mod result;

pub use coordinator::{CoordinatorConfig, ExecutionCoordinator};
pub use result::{ExecutionError, ExecutionRequest, ExecutionResult, RunStatus, TriggerKind};
