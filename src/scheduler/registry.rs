//! Job trigger registry.
//!
//! Holds the registered jobs and their parsed schedules. Once started, every
//! enabled job gets its own timer task that sleeps until the next fire time and
//! sends an [`ExecutionRequest`] down the dispatcher channel.

use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::core::job::{JobDescriptor, OverlapPolicy};
use crate::core::schedule::{Schedule, ScheduleError};
use crate::core::types::JobId;
use crate::execution::ExecutionRequest;

/// Why a single job could not be registered.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistrationError {
    /// The schedule or its timezone did not parse.
    #[error("invalid schedule for job '{job}': {source}")]
    InvalidSchedule {
        job: String,
        #[source]
        source: ScheduleError,
    },

    /// A job with this name is already registered.
    #[error("job '{0}' is already registered")]
    DuplicateJob(String),

    /// The descriptor asks for something no run can satisfy.
    #[error("invalid job '{job}': {reason}")]
    InvalidJob { job: String, reason: String },
}

impl RegistrationError {
    /// Name of the job that was rejected.
    pub fn job(&self) -> &str {
        match self {
            RegistrationError::InvalidSchedule { job, .. } => job,
            RegistrationError::DuplicateJob(job) => job,
            RegistrationError::InvalidJob { job, .. } => job,
        }
    }
}

/// Returned by a successful registration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TriggerHandle {
    job_id: JobId,
    first_fire: Option<DateTime<Utc>>,
}

impl TriggerHandle {
    pub fn job_id(&self) -> &JobId {
        &self.job_id
    }

    /// First fire time computed at registration. `None` when the schedule
    /// has no future occurrence.
    pub fn first_fire(&self) -> Option<DateTime<Utc>> {
        self.first_fire
    }
}

struct Entry {
    descriptor: Arc<JobDescriptor>,
    schedule: Arc<Schedule>,
}

struct Timer {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

/// Registered jobs plus their timers.
pub struct TriggerRegistry {
    entries: BTreeMap<JobId, Entry>,
    timers: BTreeMap<JobId, Timer>,
    cancel: CancellationToken,
    sender: Option<mpsc::Sender<ExecutionRequest>>,
}

impl TriggerRegistry {
    pub fn new() -> Self {
        Self {
            entries: BTreeMap::new(),
            timers: BTreeMap::new(),
            cancel: CancellationToken::new(),
            sender: None,
        }
    }

    /// Register a job.
    ///
    /// A duplicate name leaves the existing registration untouched. Jobs
    /// registered after [`start`](Self::start) get a timer immediately.
    pub fn register(
        &mut self,
        descriptor: JobDescriptor,
    ) -> Result<TriggerHandle, RegistrationError> {
        if self.entries.contains_key(descriptor.id()) {
            return Err(RegistrationError::DuplicateJob(descriptor.name().to_string()));
        }
        check_descriptor(&descriptor)?;

        let schedule = Schedule::with_timezone(descriptor.schedule(), descriptor.timezone())
            .map_err(|source| RegistrationError::InvalidSchedule {
                job: descriptor.name().to_string(),
                source,
            })?;

        let handle = TriggerHandle {
            job_id: descriptor.id().clone(),
            first_fire: schedule.next().ok(),
        };

        let entry = Entry {
            descriptor: Arc::new(descriptor),
            schedule: Arc::new(schedule),
        };
        if let Some(sender) = &self.sender
            && let Some(timer) = self.spawn_timer(&entry, sender.clone())
        {
            self.timers.insert(handle.job_id.clone(), timer);
        }
        self.entries.insert(handle.job_id.clone(), entry);

        tracing::debug!(
            job_id = %handle.job_id,
            first_fire = ?handle.first_fire,
            "Registered job"
        );
        Ok(handle)
    }

    /// Remove a job and stop its timer if one is running.
    pub async fn deregister(&mut self, id: &JobId) -> Option<Arc<JobDescriptor>> {
        let entry = self.entries.remove(id)?;
        if let Some(timer) = self.timers.remove(id) {
            timer.cancel.cancel();
            let _ = timer.task.await;
        }
        tracing::debug!(job_id = %id, "Deregistered job");
        Some(entry.descriptor)
    }

    /// Start a timer for every enabled job. Calling this twice is a no-op.
    pub fn start(&mut self, sender: mpsc::Sender<ExecutionRequest>) {
        if self.sender.is_some() || self.cancel.is_cancelled() {
            tracing::warn!("Trigger registry already started");
            return;
        }

        let timers: Vec<_> = self
            .entries
            .iter()
            .filter_map(|(id, entry)| {
                self.spawn_timer(entry, sender.clone())
                    .map(|timer| (id.clone(), timer))
            })
            .collect();
        self.timers.extend(timers);
        self.sender = Some(sender);
    }

    fn spawn_timer(
        &self,
        entry: &Entry,
        sender: mpsc::Sender<ExecutionRequest>,
    ) -> Option<Timer> {
        let job_id = entry.descriptor.id().clone();
        if !entry.descriptor.is_enabled() {
            tracing::info!(job_id = %job_id, "Job disabled, not scheduling");
            return None;
        }

        let cancel = self.cancel.child_token();
        let task = tokio::spawn(run_timer(
            job_id,
            Arc::clone(&entry.schedule),
            sender,
            cancel.clone(),
        ));
        Some(Timer { cancel, task })
    }

    /// Cancel every timer and wait for them to exit. No request is sent
    /// after this returns.
    pub async fn stop(&mut self) {
        self.cancel.cancel();
        self.sender = None;
        for (job_id, timer) in std::mem::take(&mut self.timers) {
            if let Err(e) = timer.task.await {
                tracing::warn!(job_id = %job_id, error = %e, "Timer task failed");
            }
        }
    }

    pub fn is_started(&self) -> bool {
        self.sender.is_some()
    }

    /// Next `n` fire times of a registered job.
    pub fn upcoming(&self, id: &JobId, n: usize) -> Option<Vec<DateTime<Utc>>> {
        let entry = self.entries.get(id)?;
        Some(entry.schedule.upcoming(Utc::now()).take(n).collect())
    }

    pub fn get(&self, id: &JobId) -> Option<&Arc<JobDescriptor>> {
        self.entries.get(id).map(|entry| &entry.descriptor)
    }

    pub fn contains(&self, id: &JobId) -> bool {
        self.entries.contains_key(id)
    }

    /// Registered jobs, ordered by name.
    pub fn jobs(&self) -> impl Iterator<Item = &Arc<JobDescriptor>> {
        self.entries.values().map(|entry| &entry.descriptor)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for TriggerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for TriggerRegistry {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl std::fmt::Debug for TriggerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TriggerRegistry")
            .field("jobs", &self.entries.keys().collect::<Vec<_>>())
            .field("timers", &self.timers.len())
            .finish()
    }
}

/// Fire `job_id` on every occurrence of `schedule` until cancelled.
fn check_descriptor(descriptor: &JobDescriptor) -> Result<(), RegistrationError> {
    let reason = if descriptor.name().trim().is_empty() {
        Some("name cannot be empty")
    } else if descriptor.module_path().as_os_str().is_empty() {
        Some("module path cannot be empty")
    } else if descriptor.timeout() == Some(Duration::ZERO) {
        Some("timeout cannot be zero")
    } else if descriptor.concurrency().max_in_flight() == 0 {
        Some("max concurrency cannot be zero")
    } else if descriptor.concurrency().overlap() == OverlapPolicy::Queue(0) {
        Some("queue depth must be at least 1")
    } else {
        None
    };

    match reason {
        Some(reason) => Err(RegistrationError::InvalidJob {
            job: descriptor.name().to_string(),
            reason: reason.to_string(),
        }),
        None => Ok(()),
    }
}

async fn run_timer(
    job_id: JobId,
    schedule: Arc<Schedule>,
    sender: mpsc::Sender<ExecutionRequest>,
    cancel: CancellationToken,
) {
    let mut after = Utc::now();
    loop {
        let fire_time = match schedule.next_after(after) {
            Ok(fire_time) => fire_time,
            Err(e) => {
                tracing::warn!(
                    job_id = %job_id,
                    error = %e,
                    "Schedule exhausted, stopping timer"
                );
                return;
            }
        };

        let wait = (fire_time - Utc::now()).to_std().unwrap_or_default();
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep_until(tokio::time::Instant::now() + wait) => {}
        }

        let request = ExecutionRequest::scheduled(job_id.clone(), fire_time);
        tracing::debug!(
            job_id = %job_id,
            run_id = %request.run_id,
            fire_time = %fire_time,
            "Trigger fired"
        );
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            sent = sender.send(request) => {
                if sent.is_err() {
                    tracing::debug!(job_id = %job_id, "Dispatcher gone, stopping timer");
                    return;
                }
            }
        }

        // A stalled send or clock jump skips missed occurrences instead of
        // replaying them.
        after = fire_time.max(Utc::now());
    }
}
