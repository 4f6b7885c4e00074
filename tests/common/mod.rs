//! Common test utilities for integration tests.

use chrono::{Timelike, Utc};
use cronbox::testing::{RecordingHandler, fixtures};
use cronbox::{Event, Scheduler, SchedulerConfig};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

/// Cron expression that fires at the top of every second.
pub const EVERY_SECOND: &str = "* * * * * *";

/// A temporary directory of fixture modules.
pub struct ModuleDir {
    dir: TempDir,
}

impl ModuleDir {
    pub fn new() -> Self {
        Self {
            dir: TempDir::new().unwrap(),
        }
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Write a fixture and return its path.
    pub fn write(&self, name: &str, source: &str) -> PathBuf {
        fixtures::write_module(self.dir.path(), name, source).unwrap()
    }
}

/// Build a scheduler with a recording handler attached.
pub async fn recorded_scheduler(config: SchedulerConfig) -> (Scheduler, Arc<RecordingHandler>) {
    let scheduler = Scheduler::new(config).unwrap();
    let recorder = RecordingHandler::new();
    scheduler.add_handler(recorder.clone()).await;
    (scheduler, recorder)
}

/// Sleep until `offset` past the next whole second of wall-clock time.
pub async fn align_to_second(offset: Duration) {
    let into_second = Duration::from_nanos(u64::from(Utc::now().nanosecond() % 1_000_000_000));
    tokio::time::sleep(Duration::from_secs(1) - into_second + offset).await;
}

/// Fire times of the finished runs of `job`, in report order.
pub fn finished_fire_times(events: &[Event], job: &str) -> Vec<chrono::DateTime<Utc>> {
    events
        .iter()
        .filter_map(|event| match event {
            Event::RunFinished {
                job_id, fire_time, ..
            } if job_id.as_str() == job => Some(*fire_time),
            _ => None,
        })
        .collect()
}
