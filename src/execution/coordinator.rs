//! Execution coordinator.
//!
//! Turns an [`ExecutionRequest`] into an [`ExecutionResult`]: applies the job's
//! concurrency policy, fetches the compiled module, runs it in the sandbox and
//! reports the outcome on the event bus. Nothing a job does can escape this
//! module as an error.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use super::{ExecutionError, ExecutionRequest, ExecutionResult, RunStatus};
use crate::core::job::{JobDescriptor, OverlapPolicy};
use crate::core::types::JobId;
use crate::events::{Event, EventBus};
use crate::sandbox::{ModuleCache, OutputMode, RunConfig, SandboxRuntime, SandboxUnit};

/// Settings applied to every run unless the job overrides them.
#[derive(Debug, Clone, Default)]
pub struct CoordinatorConfig {
    /// Deadline for jobs without their own timeout. `None` means unbounded.
    pub default_timeout: Option<Duration>,
    pub output: OutputMode,
}

/// Per-job admission state, alive as long as the job is registered.
struct JobRunState {
    descriptor: Arc<JobDescriptor>,
    permits: Arc<Semaphore>,
    queued: AtomicUsize,
}

impl JobRunState {
    fn new(descriptor: Arc<JobDescriptor>) -> Self {
        let permits = Arc::new(Semaphore::new(descriptor.concurrency().max_in_flight()));
        Self {
            descriptor,
            permits,
            queued: AtomicUsize::new(0),
        }
    }

    fn in_flight(&self) -> usize {
        self.descriptor
            .concurrency()
            .max_in_flight()
            .saturating_sub(self.permits.available_permits())
    }
}

enum Admission {
    Run(OwnedSemaphorePermit),
    Skip { in_flight: usize },
}

/// Releases a reserved queue position, even if the waiting run is dropped.
struct QueuedGuard<'a>(&'a AtomicUsize);

impl Drop for QueuedGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Runs requests against registered jobs.
pub struct ExecutionCoordinator {
    cache: Arc<ModuleCache>,
    unit: SandboxUnit,
    events: Arc<EventBus>,
    jobs: RwLock<HashMap<JobId, Arc<JobRunState>>>,
    config: CoordinatorConfig,
}

impl ExecutionCoordinator {
    /// `cache` must be bound to the same `runtime` the runs execute on.
    pub fn new(
        runtime: Arc<SandboxRuntime>,
        cache: Arc<ModuleCache>,
        events: Arc<EventBus>,
        config: CoordinatorConfig,
    ) -> Self {
        Self {
            cache,
            unit: SandboxUnit::new(runtime),
            events,
            jobs: RwLock::new(HashMap::new()),
            config,
        }
    }

    /// Make a job runnable. Replaces any previous descriptor with the same name.
    pub fn add_job(&self, descriptor: Arc<JobDescriptor>) {
        let id = descriptor.id().clone();
        let state = Arc::new(JobRunState::new(descriptor));
        self.jobs
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, state);
    }

    pub fn remove_job(&self, id: &JobId) -> bool {
        self.jobs
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(id)
            .is_some()
    }

    pub fn contains(&self, id: &JobId) -> bool {
        self.jobs
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(id)
    }

    /// Runs of `id` currently holding a slot.
    pub fn in_flight(&self, id: &JobId) -> Option<usize> {
        self.job(id).map(|state| state.in_flight())
    }

    /// Requests for `id` waiting for a slot.
    pub fn queued(&self, id: &JobId) -> Option<usize> {
        self.job(id).map(|state| state.queued.load(Ordering::SeqCst))
    }

    pub fn cache(&self) -> &Arc<ModuleCache> {
        &self.cache
    }

    fn job(&self, id: &JobId) -> Option<Arc<JobRunState>> {
        self.jobs
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned()
    }

    /// Execute one request and report it. Always emits exactly one
    /// [`Event::RunFinished`].
    pub async fn handle(&self, request: ExecutionRequest) -> ExecutionResult {
        let ExecutionRequest {
            job_id,
            run_id,
            fire_time,
            kind,
        } = request;

        let Some(state) = self.job(&job_id) else {
            tracing::warn!(job_id = %job_id, run_id = %run_id, "Request for unknown job");
            let result = ExecutionResult::from_error(
                ExecutionError::UnknownJob(job_id.to_string()),
                chrono::Utc::now(),
                Duration::ZERO,
            );
            self.events
                .emit(Event::run_finished(job_id, run_id, fire_time, result.clone()))
                .await;
            return result;
        };

        let permit = match self.admit(&state).await {
            Admission::Run(permit) => permit,
            Admission::Skip { in_flight } => {
                tracing::warn!(
                    job_id = %job_id,
                    run_id = %run_id,
                    in_flight,
                    "Job busy, skipping trigger"
                );
                let result = ExecutionResult::skipped(in_flight);
                self.events
                    .emit(Event::run_finished(job_id, run_id, fire_time, result.clone()))
                    .await;
                return result;
            }
        };

        tracing::debug!(job_id = %job_id, run_id = %run_id, kind = ?kind, "Run started");
        self.events
            .emit(Event::run_started(job_id.clone(), run_id, fire_time))
            .await;

        let descriptor = &state.descriptor;
        let result = match self.cache.get_or_compile(descriptor.module_path()).await {
            Ok(module) => {
                let config = RunConfig {
                    job_id: job_id.clone(),
                    env: descriptor.env().clone(),
                    args: descriptor.args().to_vec(),
                    output: self.config.output,
                    deadline: descriptor.timeout().or(self.config.default_timeout),
                };
                self.unit.run(module, &config).await
            }
            Err(e) => {
                tracing::error!(
                    job_id = %job_id,
                    run_id = %run_id,
                    error = %e,
                    "Module unavailable"
                );
                ExecutionResult::from_error(e, chrono::Utc::now(), Duration::ZERO)
            }
        };
        drop(permit);

        if result.status != RunStatus::Succeeded {
            tracing::debug!(
                job_id = %job_id,
                run_id = %run_id,
                status = %result.status,
                "Run did not succeed"
            );
        }
        self.events
            .emit(Event::run_finished(job_id, run_id, fire_time, result.clone()))
            .await;
        result
    }

    async fn admit(&self, state: &JobRunState) -> Admission {
        if let Ok(permit) = Arc::clone(&state.permits).try_acquire_owned() {
            return Admission::Run(permit);
        }

        let depth = match state.descriptor.concurrency().overlap() {
            OverlapPolicy::Skip => {
                return Admission::Skip {
                    in_flight: state.in_flight(),
                };
            }
            OverlapPolicy::Queue(depth) => depth,
        };

        let reserved = state
            .queued
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |queued| {
                (queued < depth).then_some(queued + 1)
            });
        if reserved.is_err() {
            return Admission::Skip {
                in_flight: state.in_flight(),
            };
        }

        let _queued = QueuedGuard(&state.queued);
        match Arc::clone(&state.permits).acquire_owned().await {
            Ok(permit) => Admission::Run(permit),
            Err(_) => Admission::Skip {
                in_flight: state.in_flight(),
            },
        }
    }
}

impl std::fmt::Debug for ExecutionCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let jobs = self.jobs.read().unwrap_or_else(PoisonError::into_inner).len();
        f.debug_struct("ExecutionCoordinator")
            .field("jobs", &jobs)
            .field("cache", &self.cache)
            .field("config", &self.config)
            .finish()
    }
}
