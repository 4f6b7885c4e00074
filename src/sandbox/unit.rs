//! Single sandboxed run of a compiled module.
//!
//! Each run builds its own WASI context and [`Store`], instantiates the module
//! through the shared linker and calls `_start`. The store is dropped on every
//! exit path, so nothing from a run outlives it.

use chrono::Utc;
use std::sync::Arc;
use std::time::{Duration, Instant};
use wasmtime::{Store, StoreLimitsBuilder, Trap};
use wasmtime_wasi::pipe::MemoryOutputPipe;
use wasmtime_wasi::{I32Exit, WasiCtxBuilder};

use super::{CompiledModule, RunState, SandboxRuntime};
use crate::core::environment::Environment;
use crate::core::types::JobId;
use crate::execution::{ExecutionError, ExecutionResult};

/// Default per-stream capture limit.
pub const DEFAULT_MAX_OUTPUT_BYTES: usize = 1024 * 1024;

/// Where a guest's stdout and stderr go.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputMode {
    /// Write straight to the host process's own streams.
    Inherit,
    /// Buffer up to `max_bytes` per stream and attach it to the result.
    Capture { max_bytes: usize },
}

impl Default for OutputMode {
    fn default() -> Self {
        OutputMode::Capture {
            max_bytes: DEFAULT_MAX_OUTPUT_BYTES,
        }
    }
}

/// Everything a single run needs besides the module.
#[derive(Debug, Clone)]
pub struct RunConfig {
    pub job_id: JobId,
    pub env: Environment,
    pub args: Vec<String>,
    pub output: OutputMode,
    /// Abort the run once this much time has passed.
    pub deadline: Option<Duration>,
}

impl RunConfig {
    pub fn new(job_id: JobId) -> Self {
        Self {
            job_id,
            env: Environment::new(),
            args: Vec::new(),
            output: OutputMode::default(),
            deadline: None,
        }
    }

    pub fn with_env(mut self, env: Environment) -> Self {
        self.env = env;
        self
    }

    pub fn with_output(mut self, output: OutputMode) -> Self {
        self.output = output;
        self
    }

    pub fn with_deadline(mut self, deadline: Option<Duration>) -> Self {
        self.deadline = deadline;
        self
    }
}

/// Runs compiled modules in fresh, isolated instances.
#[derive(Debug, Clone)]
pub struct SandboxUnit {
    runtime: Arc<SandboxRuntime>,
}

struct Captured {
    stdout: MemoryOutputPipe,
    stderr: MemoryOutputPipe,
    max_bytes: usize,
}

impl SandboxUnit {
    pub fn new(runtime: Arc<SandboxRuntime>) -> Self {
        Self { runtime }
    }

    /// Run `module` to completion, trap, deadline or shutdown.
    ///
    /// Never fails: every outcome is folded into the returned result. The run
    /// executes on its own task, so even a host-side panic only fails this run.
    pub async fn run(&self, module: Arc<CompiledModule>, config: &RunConfig) -> ExecutionResult {
        let started_at = Utc::now();
        let clock = Instant::now();
        let runtime = Arc::clone(&self.runtime);
        let job_id = config.job_id.clone();
        let config = config.clone();

        let task = tokio::spawn(async move { execute(&runtime, &module, &config).await });
        match task.await {
            Ok(result) => result,
            Err(e) => {
                let message = if e.is_panic() {
                    panic_message(e.into_panic())
                } else {
                    "run task was cancelled".to_string()
                };
                tracing::error!(job_id = %job_id, error = %message, "Sandbox run panicked");
                ExecutionResult::from_error(
                    ExecutionError::Panic(message),
                    started_at,
                    clock.elapsed(),
                )
            }
        }
    }
}

async fn execute(
    runtime: &SandboxRuntime,
    module: &CompiledModule,
    config: &RunConfig,
) -> ExecutionResult {
    let started_at = Utc::now();
    let clock = Instant::now();

    let mut wasi = WasiCtxBuilder::new();
    wasi.arg(config.job_id.as_str());
    for arg in &config.args {
        wasi.arg(arg);
    }
    for (key, value) in config.env.iter() {
        wasi.env(key, value);
    }
    let captured = match config.output {
        OutputMode::Inherit => {
            wasi.inherit_stdout().inherit_stderr();
            None
        }
        OutputMode::Capture { max_bytes } => {
            let stdout = MemoryOutputPipe::new(max_bytes);
            let stderr = MemoryOutputPipe::new(max_bytes);
            wasi.stdout(stdout.clone()).stderr(stderr.clone());
            Some(Captured {
                stdout,
                stderr,
                max_bytes,
            })
        }
    };

    let mut limits = StoreLimitsBuilder::new();
    if let Some(bytes) = runtime.config().max_memory_bytes {
        limits = limits.memory_size(bytes);
    }
    let state = RunState {
        wasi: wasi.build_p1(),
        limits: limits.build(),
    };

    let mut store = Store::new(runtime.engine(), state);
    store.limiter(|state| &mut state.limits);
    // Yield on every epoch tick, including guests that never call the host.
    store.set_epoch_deadline(1);
    store.epoch_deadline_async_yield_and_update(1);

    let outcome = {
        let call = call_start(runtime, module, &mut store);
        let deadline = async {
            match config.deadline {
                Some(limit) => tokio::time::sleep(limit).await,
                None => std::future::pending().await,
            }
        };
        tokio::select! {
            outcome = call => outcome,
            _ = deadline => Outcome::Failed(ExecutionError::TimedOut(
                config.deadline.unwrap_or_default(),
            )),
            _ = runtime.abort_token().cancelled() => Outcome::Failed(ExecutionError::Aborted),
        }
    };
    drop(store);

    let duration = clock.elapsed();
    let result = match outcome {
        Outcome::Returned => ExecutionResult::succeeded(started_at, duration),
        Outcome::Exited(0) => {
            ExecutionResult::succeeded(started_at, duration).with_exit_code(Some(0))
        }
        Outcome::Exited(code) => {
            ExecutionResult::from_error(ExecutionError::Exit(code), started_at, duration)
                .with_exit_code(Some(code))
        }
        Outcome::Failed(error) => ExecutionResult::from_error(error, started_at, duration),
    };

    match captured {
        Some(Captured {
            stdout,
            stderr,
            max_bytes,
        }) => {
            let (stdout, stderr) = (stdout.contents(), stderr.contents());
            // A full pipe drops whatever the guest wrote after it filled up.
            let truncated = stdout.len() >= max_bytes || stderr.len() >= max_bytes;
            if truncated {
                tracing::warn!(
                    job_id = %config.job_id,
                    max_bytes,
                    "Guest output reached the capture limit and was truncated"
                );
            }
            result
                .with_output(Some(lossy(&stdout)), Some(lossy(&stderr)))
                .with_truncation(truncated)
        }
        None => result,
    }
}

enum Outcome {
    Returned,
    Exited(i32),
    Failed(ExecutionError),
}

async fn call_start(
    runtime: &SandboxRuntime,
    module: &CompiledModule,
    store: &mut Store<RunState>,
) -> Outcome {
    let instance = match runtime
        .linker()
        .instantiate_async(&mut *store, module.module())
        .await
    {
        Ok(instance) => instance,
        Err(e) => return classify(e, ExecutionError::Instantiate),
    };

    let start = match instance.get_typed_func::<(), ()>(&mut *store, "_start") {
        Ok(func) => func,
        Err(e) => return Outcome::Failed(ExecutionError::Instantiate(format!("{:#}", e))),
    };

    match start.call_async(&mut *store, ()).await {
        Ok(()) => Outcome::Returned,
        Err(e) => classify(e, ExecutionError::Trap),
    }
}

/// Sort a wasmtime error into exit, trap or `fallback`.
fn classify(err: anyhow::Error, fallback: fn(String) -> ExecutionError) -> Outcome {
    if let Some(exit) = err.downcast_ref::<I32Exit>() {
        return Outcome::Exited(exit.0);
    }
    if let Some(trap) = err.downcast_ref::<Trap>() {
        return Outcome::Failed(ExecutionError::Trap(trap.to_string()));
    }
    Outcome::Failed(fallback(format!("{:#}", err)))
}

fn lossy(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).into_owned()
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
