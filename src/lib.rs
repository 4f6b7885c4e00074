//! cronbox - a cron scheduler for sandboxed WebAssembly jobs.
//!
//! Jobs are WASI preview 1 command modules fired on cron schedules. Every run
//! gets a fresh, isolated instance; a trap, timeout or misbehaving guest only
//! fails its own run.
//!
//! The main pieces:
//! - [`Scheduler`]: owns the sandbox runtime, registers jobs and dispatches runs
//! - [`TriggerRegistry`]: per-job timers that turn schedules into requests
//! - [`ExecutionCoordinator`]: concurrency policy, module cache and reporting
//! - [`SandboxRuntime`]: the shared wasmtime engine, linker and epoch ticker
//! - [`EventBus`]: where run results are reported

pub mod config;
pub mod core;
pub mod events;
pub mod execution;
pub mod sandbox;
pub mod scheduler;
pub mod testing;

pub use config::{ConfigError, LoadedConfig, YamlLoader, load_jobs};
pub use core::environment::Environment;
pub use core::job::{ConcurrencyPolicy, JobDescriptor, OverlapPolicy};
pub use core::schedule::{Schedule, ScheduleError};
pub use core::types::{JobId, RunId};
pub use events::{Event, EventBus, EventHandler};
pub use execution::{
    CoordinatorConfig, ExecutionCoordinator, ExecutionError, ExecutionRequest, ExecutionResult,
    RunStatus, TriggerKind,
};
pub use sandbox::{
    CompiledModule, ModuleCache, OutputMode, RunConfig, SandboxConfig, SandboxError,
    SandboxRuntime, SandboxUnit,
};
pub use scheduler::{
    RegistrationError, RegistrationReport, Scheduler, SchedulerConfig, SchedulerError,
    SchedulerHandle, SchedulerState, TriggerHandle, TriggerRegistry,
};
