//! Configuration types.
//!
//! Serde representations of the YAML config file. These are plain data; the
//! builder turns them into [`JobDescriptor`](crate::core::job::JobDescriptor)s
//! and a [`SchedulerConfig`](crate::scheduler::SchedulerConfig).

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;

use crate::sandbox::DEFAULT_MAX_OUTPUT_BYTES;

/// Root of a config file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CronConfig {
    /// Global settings.
    #[serde(default)]
    pub settings: Settings,
    /// Job definitions.
    #[serde(default)]
    pub jobs: Vec<JobConfig>,
}

/// Settings shared by every job.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Deadline for jobs without `timeout_secs`. Absent means unbounded.
    pub default_timeout_secs: Option<u64>,
    /// How long shutdown waits for running jobs.
    pub shutdown_grace_secs: u64,
    /// Per-instance linear memory cap.
    pub max_memory_mib: Option<u64>,
    /// Where guest stdout and stderr go.
    pub output: OutputConfig,
    /// Capture limit per stream, in bytes.
    pub max_output_bytes: usize,
    /// Environment variables merged under each job's own.
    pub env: HashMap<String, String>,
    /// Directory relative `wasm_path`s are joined to. Absent means the
    /// working directory.
    pub base_dir: Option<PathBuf>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            default_timeout_secs: None,
            shutdown_grace_secs: 30,
            max_memory_mib: None,
            output: OutputConfig::default(),
            max_output_bytes: DEFAULT_MAX_OUTPUT_BYTES,
            env: HashMap::new(),
            base_dir: None,
        }
    }
}

/// Output handling for guest streams.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputConfig {
    /// Capture and report through the log.
    #[default]
    Capture,
    /// Pass straight through to the process's streams.
    Inherit,
}

/// Job configuration from YAML.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobConfig {
    /// Unique job name.
    pub name: String,
    /// Module path; relative paths resolve against `settings.base_dir`.
    pub wasm_path: PathBuf,
    /// Schedule expression, optionally with a timezone.
    pub schedule: ScheduleConfig,
    /// Environment variables visible to the guest.
    #[serde(default)]
    pub env: HashMap<String, String>,
    /// Extra argv entries after the job name.
    #[serde(default)]
    pub args: Vec<String>,
    /// Per-run deadline in seconds.
    pub timeout_secs: Option<u64>,
    /// What to do when a trigger arrives while the job is busy.
    #[serde(default)]
    pub concurrency: ConcurrencyConfig,
    /// Maximum runs of this job in flight at once.
    pub max_concurrency: Option<usize>,
    /// Whether the job is enabled.
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_true() -> bool {
    true
}

/// Schedule configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ScheduleConfig {
    /// Simple cron expression string.
    Simple(String),
    /// Detailed schedule with timezone.
    Detailed {
        /// Cron expression or shortcut.
        cron: String,
        /// Timezone for the schedule.
        timezone: Option<String>,
    },
}

impl ScheduleConfig {
    /// Get the cron expression.
    pub fn cron(&self) -> &str {
        match self {
            ScheduleConfig::Simple(s) => s,
            ScheduleConfig::Detailed { cron, .. } => cron,
        }
    }

    /// Get the timezone, if specified.
    pub fn timezone(&self) -> Option<&str> {
        match self {
            ScheduleConfig::Simple(_) => None,
            ScheduleConfig::Detailed { timezone, .. } => timezone.as_deref(),
        }
    }
}

/// Overlap handling: `skip` or `{ queue: N }`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConcurrencyConfig {
    /// Drop triggers that arrive while the job is at its limit.
    #[default]
    Skip,
    /// Queue up to this many triggers; further ones are dropped.
    Queue(usize),
}
