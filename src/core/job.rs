//! Job descriptors.
//!
//! A [`JobDescriptor`] names a WebAssembly module, the schedule it fires on and
//! the environment it sees. Descriptors are immutable once registered.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use super::environment::Environment;
use super::types::JobId;

/// What to do with a trigger that arrives while the job is already running.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum OverlapPolicy {
    /// Drop the trigger and report it as skipped.
    #[default]
    Skip,
    /// Hold up to `depth` triggers until a slot frees up; anything beyond is skipped.
    Queue(usize),
}

/// Per-job concurrency policy: how many runs may be in flight and what
/// happens to triggers beyond that.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConcurrencyPolicy {
    max_in_flight: usize,
    overlap: OverlapPolicy,
}

impl ConcurrencyPolicy {
    /// Skip-if-busy with the given in-flight limit.
    ///
    /// A zero limit or a zero queue depth is rejected when the job is registered.
    pub fn skip_if_busy(max_in_flight: usize) -> Self {
        Self {
            max_in_flight,
            overlap: OverlapPolicy::Skip,
        }
    }

    /// Bounded queue of `depth` waiting triggers behind `max_in_flight` running ones.
    pub fn queue(max_in_flight: usize, depth: usize) -> Self {
        Self {
            max_in_flight,
            overlap: OverlapPolicy::Queue(depth),
        }
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight
    }

    pub fn overlap(&self) -> OverlapPolicy {
        self.overlap
    }
}

impl Default for ConcurrencyPolicy {
    fn default() -> Self {
        Self::skip_if_busy(1)
    }
}

/// A named, independently scheduled sandboxed unit of work.
#[derive(Debug, Clone)]
pub struct JobDescriptor {
    id: JobId,
    module_path: PathBuf,
    schedule: String,
    timezone: String,
    env: Environment,
    args: Vec<String>,
    timeout: Option<Duration>,
    concurrency: ConcurrencyPolicy,
    enabled: bool,
}

impl JobDescriptor {
    /// Create a descriptor. The schedule is only parsed at registration time.
    pub fn new(
        name: impl Into<JobId>,
        module_path: impl Into<PathBuf>,
        schedule: impl Into<String>,
    ) -> Self {
        Self {
            id: name.into(),
            module_path: module_path.into(),
            schedule: schedule.into(),
            timezone: "UTC".to_string(),
            env: Environment::new(),
            args: Vec::new(),
            timeout: None,
            concurrency: ConcurrencyPolicy::default(),
            enabled: true,
        }
    }

    /// Evaluate the schedule in the given IANA timezone.
    pub fn with_timezone(mut self, timezone: impl Into<String>) -> Self {
        self.timezone = timezone.into();
        self
    }

    pub fn with_env(mut self, env: Environment) -> Self {
        self.env = env;
        self
    }

    /// Extra arguments passed after `argv[0]`.
    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    /// Abort runs that take longer than `timeout`.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_concurrency(mut self, concurrency: ConcurrencyPolicy) -> Self {
        self.concurrency = concurrency;
        self
    }

    /// Disabled jobs are registered but never fire on their own.
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn id(&self) -> &JobId {
        &self.id
    }

    pub fn name(&self) -> &str {
        self.id.as_str()
    }

    pub fn module_path(&self) -> &Path {
        &self.module_path
    }

    pub fn schedule(&self) -> &str {
        &self.schedule
    }

    pub fn timezone(&self) -> &str {
        &self.timezone
    }

    pub fn env(&self) -> &Environment {
        &self.env
    }

    pub fn args(&self) -> &[String] {
        &self.args
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    pub fn concurrency(&self) -> ConcurrencyPolicy {
        self.concurrency
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }
}
