//! Execution requests and results.

use chrono::{DateTime, Utc};
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

use crate::core::types::{JobId, RunId};

/// Why a run did not succeed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExecutionError {
    /// The module file could not be read.
    #[error("failed to read module '{path}': {message}")]
    Read { path: PathBuf, message: String },

    /// The module bytes are not a valid WebAssembly module.
    #[error("failed to compile module '{path}': {message}")]
    Compile { path: PathBuf, message: String },

    /// Linking or instantiation failed, or `_start` is missing.
    #[error("failed to instantiate module: {0}")]
    Instantiate(String),

    /// The guest trapped (unreachable, out-of-bounds access, limit violation).
    #[error("guest trapped: {0}")]
    Trap(String),

    /// The guest called `proc_exit` with a non-zero code.
    #[error("guest exited with code {0}")]
    Exit(i32),

    /// The run exceeded its deadline and was aborted.
    #[error("run exceeded deadline of {0:?}")]
    TimedOut(Duration),

    /// The run was aborted during shutdown.
    #[error("run aborted during shutdown")]
    Aborted,

    /// The host side of the run panicked.
    #[error("execution panicked: {0}")]
    Panic(String),

    /// The job was already at its in-flight limit.
    #[error("job is busy ({in_flight} run(s) in flight)")]
    Busy { in_flight: usize },

    /// The request named a job that is not registered.
    #[error("unknown job: {0}")]
    UnknownJob(String),
}

/// Final status of one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RunStatus {
    Succeeded,
    Failed,
    Skipped,
    TimedOut,
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RunStatus::Succeeded => "succeeded",
            RunStatus::Failed => "failed",
            RunStatus::Skipped => "skipped",
            RunStatus::TimedOut => "timed_out",
        };
        f.write_str(s)
    }
}

/// How a request came about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerKind {
    /// Fired by the job's schedule.
    Scheduled,
    /// Requested through a scheduler handle.
    Manual,
}

/// A point-in-time trigger for one job.
#[derive(Debug, Clone)]
pub struct ExecutionRequest {
    pub job_id: JobId,
    pub run_id: RunId,
    pub fire_time: DateTime<Utc>,
    pub kind: TriggerKind,
}

impl ExecutionRequest {
    /// A request fired by the schedule at `fire_time`.
    pub fn scheduled(job_id: JobId, fire_time: DateTime<Utc>) -> Self {
        Self {
            job_id,
            run_id: RunId::new(),
            fire_time,
            kind: TriggerKind::Scheduled,
        }
    }

    /// A manual request firing now.
    pub fn manual(job_id: JobId) -> Self {
        Self {
            job_id,
            run_id: RunId::new(),
            fire_time: Utc::now(),
            kind: TriggerKind::Manual,
        }
    }
}

/// Outcome of one run.
#[derive(Debug, Clone)]
pub struct ExecutionResult {
    pub status: RunStatus,
    pub error: Option<ExecutionError>,
    pub started_at: DateTime<Utc>,
    pub duration: Duration,
    /// Captured guest stdout, when output capture is enabled.
    pub stdout: Option<String>,
    /// Captured guest stderr, when output capture is enabled.
    pub stderr: Option<String>,
    /// Code passed to `proc_exit`, if the guest called it.
    pub exit_code: Option<i32>,
    /// Captured stdout or stderr reached the capture limit and was cut.
    pub output_truncated: bool,
}

impl ExecutionResult {
    pub fn succeeded(started_at: DateTime<Utc>, duration: Duration) -> Self {
        Self {
            status: RunStatus::Succeeded,
            error: None,
            started_at,
            duration,
            stdout: None,
            stderr: None,
            exit_code: None,
            output_truncated: false,
        }
    }

    /// A non-success result; the status follows from the error.
    pub fn from_error(
        error: ExecutionError,
        started_at: DateTime<Utc>,
        duration: Duration,
    ) -> Self {
        let status = match error {
            ExecutionError::TimedOut(_) => RunStatus::TimedOut,
            ExecutionError::Busy { .. } => RunStatus::Skipped,
            _ => RunStatus::Failed,
        };
        Self {
            status,
            error: Some(error),
            started_at,
            duration,
            stdout: None,
            stderr: None,
            exit_code: None,
            output_truncated: false,
        }
    }

    /// A trigger that was not executed because the job was busy.
    pub fn skipped(in_flight: usize) -> Self {
        Self::from_error(
            ExecutionError::Busy { in_flight },
            Utc::now(),
            Duration::ZERO,
        )
    }

    pub(crate) fn with_output(mut self, stdout: Option<String>, stderr: Option<String>) -> Self {
        self.stdout = stdout;
        self.stderr = stderr;
        self
    }

    pub(crate) fn with_truncation(mut self, truncated: bool) -> Self {
        self.output_truncated = truncated;
        self
    }

    pub(crate) fn with_exit_code(mut self, code: Option<i32>) -> Self {
        self.exit_code = code;
        self
    }

    pub fn is_success(&self) -> bool {
        self.status == RunStatus::Succeeded
    }
}
