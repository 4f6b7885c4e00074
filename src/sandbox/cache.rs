//! Compiled module cache.
//!
//! Modules are keyed by path and fingerprinted by the SHA-256 of their bytes.
//! A lookup always re-reads the file so that an updated module is picked up on
//! the next trigger. Compilation is single-flight: concurrent callers asking for
//! the same path and fingerprint share one compile.

use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;
use tokio::sync::OnceCell;
use wasmtime::Module;

use super::SandboxRuntime;
use crate::execution::ExecutionError;

/// Content fingerprint of a module file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Fingerprint([u8; 32]);

impl Fingerprint {
    /// Fingerprint the given bytes.
    pub fn of(bytes: &[u8]) -> Self {
        Self(Sha256::digest(bytes).into())
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Short form is enough to tell versions apart in logs.
        f.write_str(&hex::encode(&self.0[..8]))
    }
}

/// A compiled module ready to instantiate.
pub struct CompiledModule {
    module: Module,
    path: PathBuf,
    fingerprint: Fingerprint,
}

impl CompiledModule {
    pub fn module(&self) -> &Module {
        &self.module
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn fingerprint(&self) -> Fingerprint {
        self.fingerprint
    }
}

impl fmt::Debug for CompiledModule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompiledModule")
            .field("path", &self.path)
            .field("fingerprint", &self.fingerprint)
            .finish()
    }
}

type ModuleCell = Arc<OnceCell<Arc<CompiledModule>>>;

struct Slot {
    fingerprint: Fingerprint,
    cell: ModuleCell,
}

/// Cache of compiled modules, shared by all runs.
pub struct ModuleCache {
    runtime: Arc<SandboxRuntime>,
    slots: Mutex<HashMap<PathBuf, Slot>>,
    compilations: AtomicU64,
}

impl ModuleCache {
    pub fn new(runtime: Arc<SandboxRuntime>) -> Self {
        Self {
            runtime,
            slots: Mutex::new(HashMap::new()),
            compilations: AtomicU64::new(0),
        }
    }

    /// Return the compiled module for `path`, compiling it if the file is new
    /// or its contents changed since the last call.
    pub async fn get_or_compile(
        &self,
        path: &Path,
    ) -> Result<Arc<CompiledModule>, ExecutionError> {
        let bytes = tokio::fs::read(path).await.map_err(|e| ExecutionError::Read {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
        let fingerprint = Fingerprint::of(&bytes);
        let cell = self.slot_for(path, fingerprint);

        let compiled = cell
            .get_or_try_init(|| self.compile(path, fingerprint, bytes))
            .await?;
        Ok(Arc::clone(compiled))
    }

    /// Find the slot for this path and fingerprint, replacing a stale one.
    fn slot_for(&self, path: &Path, fingerprint: Fingerprint) -> ModuleCell {
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        match slots.get(path) {
            Some(slot) if slot.fingerprint == fingerprint => Arc::clone(&slot.cell),
            existing => {
                if let Some(stale) = existing {
                    tracing::info!(
                        path = %path.display(),
                        old = %stale.fingerprint,
                        new = %fingerprint,
                        "Module changed on disk, recompiling"
                    );
                }
                let cell: ModuleCell = Arc::new(OnceCell::new());
                slots.insert(
                    path.to_path_buf(),
                    Slot {
                        fingerprint,
                        cell: Arc::clone(&cell),
                    },
                );
                cell
            }
        }
    }

    async fn compile(
        &self,
        path: &Path,
        fingerprint: Fingerprint,
        bytes: Vec<u8>,
    ) -> Result<Arc<CompiledModule>, ExecutionError> {
        let engine = self.runtime.engine().clone();
        let started = Instant::now();

        let compiled = tokio::task::spawn_blocking(move || Module::new(&engine, &bytes))
            .await
            .map_err(|e| ExecutionError::Compile {
                path: path.to_path_buf(),
                message: format!("compiler task failed: {}", e),
            })?;
        let module = compiled.map_err(|e| {
            tracing::warn!(path = %path.display(), error = %e, "Module failed to compile");
            ExecutionError::Compile {
                path: path.to_path_buf(),
                message: format!("{:#}", e),
            }
        })?;

        self.compilations.fetch_add(1, Ordering::SeqCst);
        tracing::info!(
            path = %path.display(),
            fingerprint = %fingerprint,
            elapsed = ?started.elapsed(),
            "Compiled module"
        );

        Ok(Arc::new(CompiledModule {
            module,
            path: path.to_path_buf(),
            fingerprint,
        }))
    }

    /// Drop the cached entry for `path`. Returns whether one existed.
    pub fn invalidate(&self, path: &Path) -> bool {
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        slots.remove(path).is_some()
    }

    /// Number of modules currently compiled and cached.
    pub fn len(&self) -> usize {
        let slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        slots.values().filter(|slot| slot.cell.initialized()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Total successful compilations since the cache was created.
    pub fn compilations(&self) -> u64 {
        self.compilations.load(Ordering::SeqCst)
    }
}

impl fmt::Debug for ModuleCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModuleCache")
            .field("len", &self.len())
            .field("compilations", &self.compilations())
            .finish()
    }
}
