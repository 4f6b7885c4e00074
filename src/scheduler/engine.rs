//! Scheduler engine implementation.
//!
//! The scheduler is responsible for:
//! - Building the shared sandbox runtime
//! - Registering jobs with the trigger registry and the coordinator
//! - Dispatching scheduled and manual requests onto worker tasks
//! - Graceful shutdown with a bounded grace period

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{RwLock, mpsc};
use tokio::task::JoinHandle;

use crate::core::job::JobDescriptor;
use crate::core::types::{JobId, RunId};
use crate::events::{Event, EventBus, EventHandler};
use crate::execution::{
    CoordinatorConfig, ExecutionCoordinator, ExecutionError, ExecutionRequest, ExecutionResult,
};
use crate::sandbox::{ModuleCache, OutputMode, SandboxConfig, SandboxRuntime};

use super::handle::{COMMAND_CHANNEL_BUFFER, SchedulerHandle};
use super::registry::{RegistrationError, TriggerHandle, TriggerRegistry};
use super::types::{SchedulerCommand, SchedulerError, SchedulerState};

/// Buffer size for the request channel between the timers and the dispatcher.
const REQUEST_CHANNEL_BUFFER: usize = 256;

/// How long aborted runs get to report before their tasks are cancelled.
const ABORT_SETTLE_TIMEOUT: Duration = Duration::from_secs(2);

/// Default graceful shutdown timeout.
pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

/// Settings for a [`Scheduler`].
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub sandbox: SandboxConfig,
    /// Deadline for jobs without their own timeout.
    pub default_timeout: Option<Duration>,
    /// How long shutdown waits for in-flight runs before aborting them.
    pub shutdown_grace: Duration,
    pub output: OutputMode,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            sandbox: SandboxConfig::default(),
            default_timeout: None,
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
            output: OutputMode::default(),
        }
    }
}

impl SchedulerConfig {
    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = Some(timeout);
        self
    }

    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    pub fn with_output(mut self, output: OutputMode) -> Self {
        self.output = output;
        self
    }

    pub fn with_max_memory_bytes(mut self, bytes: usize) -> Self {
        self.sandbox.max_memory_bytes = Some(bytes);
        self
    }
}

/// Outcome of [`Scheduler::register_all`].
#[derive(Debug, Default)]
pub struct RegistrationReport {
    pub registered: Vec<TriggerHandle>,
    pub rejected: Vec<RegistrationError>,
}

impl RegistrationReport {
    pub fn registered_count(&self) -> usize {
        self.registered.len()
    }

    pub fn rejected_count(&self) -> usize {
        self.rejected.len()
    }
}

/// Main scheduler for sandboxed jobs.
pub struct Scheduler {
    config: SchedulerConfig,
    runtime: Arc<SandboxRuntime>,
    event_bus: Arc<EventBus>,
    coordinator: Arc<ExecutionCoordinator>,
    registry: TriggerRegistry,
}

impl Scheduler {
    /// Build the sandbox runtime, the module cache bound to it, and the
    /// coordinator that runs through both.
    pub fn new(config: SchedulerConfig) -> Result<Self, SchedulerError> {
        let runtime = Arc::new(SandboxRuntime::new(config.sandbox.clone())?);
        let cache = Arc::new(ModuleCache::new(Arc::clone(&runtime)));
        let event_bus = Arc::new(EventBus::new());
        let coordinator = Arc::new(ExecutionCoordinator::new(
            Arc::clone(&runtime),
            cache,
            Arc::clone(&event_bus),
            CoordinatorConfig {
                default_timeout: config.default_timeout,
                output: config.output,
            },
        ));

        Ok(Self {
            config,
            runtime,
            event_bus,
            coordinator,
            registry: TriggerRegistry::new(),
        })
    }

    /// Register an event handler. Handlers see every run's lifecycle events.
    pub async fn add_handler(&self, handler: Arc<dyn EventHandler>) {
        self.event_bus.register(handler).await;
    }

    /// Register a single job.
    pub fn register(
        &mut self,
        descriptor: JobDescriptor,
    ) -> Result<TriggerHandle, RegistrationError> {
        let handle = self.registry.register(descriptor)?;
        if let Some(descriptor) = self.registry.get(handle.job_id()) {
            self.coordinator.add_job(Arc::clone(descriptor));
        }
        Ok(handle)
    }

    /// Register every job, skipping the ones that fail.
    ///
    /// Fails with [`SchedulerError::NoJobs`] when the scheduler ends up with
    /// no jobs at all.
    pub fn register_all(
        &mut self,
        descriptors: impl IntoIterator<Item = JobDescriptor>,
    ) -> Result<RegistrationReport, SchedulerError> {
        let mut report = RegistrationReport::default();
        for descriptor in descriptors {
            match self.register(descriptor) {
                Ok(handle) => {
                    tracing::info!(
                        job_id = %handle.job_id(),
                        next = ?handle.first_fire(),
                        "Job registered"
                    );
                    report.registered.push(handle);
                }
                Err(e) => {
                    tracing::warn!(job_id = %e.job(), error = %e, "Skipping job");
                    report.rejected.push(e);
                }
            }
        }

        if self.registry.is_empty() {
            return Err(SchedulerError::NoJobs);
        }
        Ok(report)
    }

    /// Get a registered job by ID.
    pub fn get_job(&self, id: &JobId) -> Option<&Arc<JobDescriptor>> {
        self.registry.get(id)
    }

    /// List all registered jobs.
    pub fn jobs(&self) -> impl Iterator<Item = &Arc<JobDescriptor>> {
        self.registry.jobs()
    }

    /// Preview the next `n` fire times of a job.
    pub fn upcoming(&self, id: &JobId, n: usize) -> Option<Vec<chrono::DateTime<chrono::Utc>>> {
        self.registry.upcoming(id, n)
    }

    /// Get the event bus.
    pub fn event_bus(&self) -> &Arc<EventBus> {
        &self.event_bus
    }

    pub fn coordinator(&self) -> &Arc<ExecutionCoordinator> {
        &self.coordinator
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Start the timers and the dispatcher and return a handle for controlling them.
    pub async fn start(mut self) -> (SchedulerHandle, JoinHandle<()>) {
        let (command_tx, command_rx) = mpsc::channel(COMMAND_CHANNEL_BUFFER);
        let (request_tx, request_rx) = mpsc::channel(REQUEST_CHANNEL_BUFFER);
        let state = Arc::new(RwLock::new(SchedulerState::Running));

        let handle = SchedulerHandle {
            command_tx,
            state: Arc::clone(&state),
        };

        self.registry.start(request_tx);
        tracing::info!(jobs = self.registry.len(), "Scheduler started");

        let task = tokio::spawn(self.run(request_rx, command_rx, state));
        (handle, task)
    }

    /// Run until `signal` resolves, then shut down gracefully.
    pub async fn run_until<F>(self, signal: F) -> Result<(), SchedulerError>
    where
        F: Future<Output = ()>,
    {
        let (handle, task) = self.start().await;
        signal.await;
        tracing::info!("Shutdown requested");
        handle.shutdown().await?;
        task.await
            .map_err(|e| SchedulerError::ChannelError(format!("scheduler task failed: {}", e)))
    }

    /// Dispatcher loop.
    async fn run(
        mut self,
        mut request_rx: mpsc::Receiver<ExecutionRequest>,
        mut command_rx: mpsc::Receiver<SchedulerCommand>,
        state: Arc<RwLock<SchedulerState>>,
    ) {
        let mut running: HashMap<RunId, (JobId, JoinHandle<()>)> = HashMap::new();

        loop {
            tokio::select! {
                Some(request) = request_rx.recv() => {
                    self.dispatch(request, &mut running);
                }

                command = command_rx.recv() => {
                    match command {
                        Some(SchedulerCommand::Trigger { job_id, response }) => {
                            let result = if self.coordinator.contains(&job_id) {
                                tracing::info!(job_id = %job_id, "Manual trigger");
                                let request = ExecutionRequest::manual(job_id);
                                let run_id = request.run_id;
                                self.dispatch(request, &mut running);
                                Ok(run_id)
                            } else {
                                Err(SchedulerError::JobNotFound(job_id.to_string()))
                            };
                            let _ = response.send(result);
                        }
                        Some(SchedulerCommand::Shutdown { response }) => {
                            self.shutdown(&mut request_rx, &mut command_rx, &state, running)
                                .await;
                            let _ = response.send(());
                            break;
                        }
                        None => {
                            tracing::info!("All scheduler handles dropped, shutting down");
                            self.shutdown(&mut request_rx, &mut command_rx, &state, running)
                                .await;
                            break;
                        }
                    }
                }
            }
        }
    }

    /// Hand a request to the coordinator on its own task.
    fn dispatch(
        &self,
        request: ExecutionRequest,
        running: &mut HashMap<RunId, (JobId, JoinHandle<()>)>,
    ) {
        running.retain(|_, (_, handle)| !handle.is_finished());

        let run_id = request.run_id;
        let job_id = request.job_id.clone();
        let coordinator = Arc::clone(&self.coordinator);
        let handle = tokio::spawn(async move {
            coordinator.handle(request).await;
        });
        running.insert(run_id, (job_id, handle));
    }

    async fn shutdown(
        &mut self,
        request_rx: &mut mpsc::Receiver<ExecutionRequest>,
        command_rx: &mut mpsc::Receiver<SchedulerCommand>,
        state: &RwLock<SchedulerState>,
        mut running: HashMap<RunId, (JobId, JoinHandle<()>)>,
    ) {
        *state.write().await = SchedulerState::ShuttingDown;
        tracing::info!("Scheduler shutting down");

        self.registry.stop().await;

        // Requests already queued never started; report them as aborted.
        request_rx.close();
        while let Ok(request) = request_rx.try_recv() {
            tracing::debug!(
                job_id = %request.job_id,
                run_id = %request.run_id,
                "Dropping pending request"
            );
            let result = ExecutionResult::from_error(
                ExecutionError::Aborted,
                chrono::Utc::now(),
                Duration::ZERO,
            );
            self.event_bus
                .emit(Event::run_finished(
                    request.job_id,
                    request.run_id,
                    request.fire_time,
                    result,
                ))
                .await;
        }

        command_rx.close();
        while let Ok(command) = command_rx.try_recv() {
            match command {
                SchedulerCommand::Trigger { response, .. } => {
                    let _ = response.send(Err(SchedulerError::ChannelError(
                        "scheduler is shutting down".into(),
                    )));
                }
                SchedulerCommand::Shutdown { response } => {
                    let _ = response.send(());
                }
            }
        }

        if !self.await_running_jobs(&mut running).await {
            tracing::warn!(
                remaining = running.len(),
                "Aborting runs still in flight after grace period"
            );
            self.runtime.abort_all();
            if tokio::time::timeout(ABORT_SETTLE_TIMEOUT, wait_all(&mut running))
                .await
                .is_err()
            {
                for (run_id, (job_id, handle)) in running.drain() {
                    tracing::warn!(job_id = %job_id, run_id = %run_id, "Cancelling run task");
                    handle.abort();
                }
            }
        }

        self.runtime.shutdown();
        *state.write().await = SchedulerState::Stopped;
        tracing::info!("Scheduler stopped");
    }

    /// Wait for all running jobs to complete with a timeout. Returns whether
    /// they all finished.
    async fn await_running_jobs(
        &self,
        running: &mut HashMap<RunId, (JobId, JoinHandle<()>)>,
    ) -> bool {
        running.retain(|_, (_, handle)| !handle.is_finished());
        let running_count = running.len();

        if running_count == 0 {
            tracing::info!("No running jobs to wait for during shutdown");
            return true;
        }

        tracing::info!(
            "Graceful shutdown: waiting for {} running job(s) to complete (timeout: {:?})",
            running_count,
            self.config.shutdown_grace
        );

        let start = tokio::time::Instant::now();
        match tokio::time::timeout(self.config.shutdown_grace, wait_all(running)).await {
            Ok(()) => {
                tracing::info!("All running jobs completed gracefully in {:?}", start.elapsed());
                true
            }
            Err(_) => {
                running.retain(|_, (_, handle)| !handle.is_finished());
                tracing::warn!(
                    "Graceful shutdown timeout ({:?}) exceeded with {} job(s) still running",
                    self.config.shutdown_grace,
                    running.len()
                );
                false
            }
        }
    }
}

/// Await every tracked task, removing each one as it completes.
async fn wait_all(running: &mut HashMap<RunId, (JobId, JoinHandle<()>)>) {
    let ids: Vec<RunId> = running.keys().copied().collect();
    for run_id in ids {
        if let Some((job_id, handle)) = running.get_mut(&run_id)
            && let Err(e) = handle.await
            && e.is_panic()
        {
            tracing::error!(job_id = %job_id, run_id = %run_id, "Run task panicked");
        }
        running.remove(&run_id);
    }
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("config", &self.config)
            .field("registry", &self.registry)
            .finish()
    }
}
