//! WebAssembly sandbox: the shared runtime, the module cache and the
//! per-run execution unit.
//!
//! One [`SandboxRuntime`] is built per process. It owns the wasmtime
//! [`Engine`], a [`Linker`] with WASI preview 1 registered, and the epoch
//! ticker that lets long-running guests yield back to the async runtime.
//! Every run gets its own [`wasmtime::Store`], so jobs never share mutable
//! execution state.

mod cache;
mod unit;

pub use cache::{CompiledModule, Fingerprint, ModuleCache};
pub use unit::{DEFAULT_MAX_OUTPUT_BYTES, OutputMode, RunConfig, SandboxUnit};

use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use wasmtime::{Config, Engine, Linker, StoreLimits};
use wasmtime_wasi::preview1::{self, WasiP1Ctx};

/// Default interval between epoch ticks.
pub const DEFAULT_EPOCH_TICK: Duration = Duration::from_millis(10);

/// Errors raised while building the shared runtime.
#[derive(Debug, Error)]
pub enum SandboxError {
    /// The wasmtime engine could not be created.
    #[error("failed to create wasm engine: {0}")]
    Engine(String),

    /// WASI could not be registered with the linker.
    #[error("failed to link WASI: {0}")]
    Linker(String),

    /// The epoch ticker thread could not be spawned.
    #[error("failed to start epoch ticker: {0}")]
    Ticker(#[source] std::io::Error),
}

/// Tunables for the shared runtime.
#[derive(Debug, Clone)]
pub struct SandboxConfig {
    /// How often guests are interrupted to yield to the scheduler.
    pub epoch_tick: Duration,
    /// Upper bound on each instance's linear memory, in bytes.
    pub max_memory_bytes: Option<usize>,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            epoch_tick: DEFAULT_EPOCH_TICK,
            max_memory_bytes: None,
        }
    }
}

/// Host state stored in each run's `Store`.
pub(crate) struct RunState {
    pub(crate) wasi: WasiP1Ctx,
    pub(crate) limits: StoreLimits,
}

/// Process-wide sandbox runtime, shared by the cache and every run.
pub struct SandboxRuntime {
    engine: Engine,
    linker: Linker<RunState>,
    config: SandboxConfig,
    abort: CancellationToken,
    ticker_stop: Arc<AtomicBool>,
    ticker: Mutex<Option<JoinHandle<()>>>,
}

impl SandboxRuntime {
    /// Build the engine and linker and start the epoch ticker.
    pub fn new(config: SandboxConfig) -> Result<Self, SandboxError> {
        let mut wasm_config = Config::new();
        wasm_config.async_support(true).epoch_interruption(true);
        let engine =
            Engine::new(&wasm_config).map_err(|e| SandboxError::Engine(e.to_string()))?;

        let mut linker: Linker<RunState> = Linker::new(&engine);
        preview1::add_to_linker_async(&mut linker, |state: &mut RunState| &mut state.wasi)
            .map_err(|e| SandboxError::Linker(e.to_string()))?;

        let ticker_stop = Arc::new(AtomicBool::new(false));
        let ticker = {
            let engine = engine.clone();
            let stop = Arc::clone(&ticker_stop);
            let tick = config.epoch_tick;
            std::thread::Builder::new()
                .name("cronbox-epoch".to_string())
                .spawn(move || {
                    while !stop.load(Ordering::Relaxed) {
                        std::thread::sleep(tick);
                        engine.increment_epoch();
                    }
                })
                .map_err(SandboxError::Ticker)?
        };

        tracing::debug!(epoch_tick = ?config.epoch_tick, "Sandbox runtime initialized");

        Ok(Self {
            engine,
            linker,
            config,
            abort: CancellationToken::new(),
            ticker_stop,
            ticker: Mutex::new(Some(ticker)),
        })
    }

    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    pub(crate) fn linker(&self) -> &Linker<RunState> {
        &self.linker
    }

    pub fn config(&self) -> &SandboxConfig {
        &self.config
    }

    /// Abort every run that is still executing. Aborted runs report
    /// [`ExecutionError::Aborted`](crate::execution::ExecutionError::Aborted).
    pub fn abort_all(&self) {
        self.abort.cancel();
    }

    pub(crate) fn abort_token(&self) -> &CancellationToken {
        &self.abort
    }

    /// Stop the epoch ticker. Runs still executing are aborted first.
    /// Calling this more than once is a no-op.
    pub fn shutdown(&self) {
        self.abort_all();
        self.ticker_stop.store(true, Ordering::Relaxed);
        let handle = match self.ticker.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(handle) = handle {
            if handle.join().is_err() {
                tracing::warn!("Epoch ticker thread panicked");
            }
            tracing::debug!("Sandbox runtime released");
        }
    }

    /// Whether [`shutdown`](Self::shutdown) has been called.
    pub fn is_shut_down(&self) -> bool {
        self.ticker_stop.load(Ordering::Relaxed)
    }
}

impl Drop for SandboxRuntime {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for SandboxRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SandboxRuntime")
            .field("config", &self.config)
            .field("shut_down", &self.is_shut_down())
            .finish()
    }
}
