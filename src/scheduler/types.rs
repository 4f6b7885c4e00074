//! Scheduler type definitions.
//!
//! This module contains error types, state enums, and command types for the scheduler.

use crate::core::types::{JobId, RunId};
use crate::sandbox::SandboxError;
use thiserror::Error;
use tokio::sync::oneshot;

/// Errors that can occur in the scheduler.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// The sandbox runtime could not be built.
    #[error("sandbox runtime error: {0}")]
    Runtime(#[from] SandboxError),

    /// No job could be registered.
    #[error("no jobs registered")]
    NoJobs,

    /// Job not found.
    #[error("job not found: {0}")]
    JobNotFound(String),

    /// Channel error.
    #[error("channel error: {0}")]
    ChannelError(String),
}

/// State of the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    /// Scheduler is running.
    Running,
    /// Timers are stopped and in-flight runs are draining.
    ShuttingDown,
    /// Scheduler is stopped and its runtime released.
    Stopped,
}

/// Commands that can be sent to the scheduler.
pub(crate) enum SchedulerCommand {
    /// Trigger a job manually.
    Trigger {
        job_id: JobId,
        response: oneshot::Sender<Result<RunId, SchedulerError>>,
    },
    /// Shutdown the scheduler.
    Shutdown { response: oneshot::Sender<()> },
}
