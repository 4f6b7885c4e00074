//! Testing utilities for users of the cronbox library.
//!
//! - [`fixtures`]: small WASI modules in WebAssembly text format
//! - [`RecordingHandler`]: an event handler that keeps every event it sees

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

use crate::events::{Event, EventHandler};
use crate::execution::ExecutionResult;

/// WASI command modules used by tests and benchmarks.
///
/// wasmtime compiles the text format directly, so a fixture can be written to
/// disk as `*.wat` and used anywhere a `.wasm` path is expected.
pub mod fixtures {
    use std::path::{Path, PathBuf};

    /// Writes `hello from wasm\n` to stdout and returns.
    pub const HELLO: &str = r#"(module
  (import "wasi_snapshot_preview1" "fd_write"
    (func $fd_write (param i32 i32 i32 i32) (result i32)))
  (memory (export "memory") 1)
  (data (i32.const 64) "hello from wasm\n")
  (func (export "_start")
    (i32.store (i32.const 0) (i32.const 64))
    (i32.store (i32.const 4) (i32.const 16))
    (drop (call $fd_write (i32.const 1) (i32.const 0) (i32.const 1) (i32.const 8)))))
"#;

    /// Writes `oops\n` to stderr and returns.
    pub const STDERR: &str = r#"(module
  (import "wasi_snapshot_preview1" "fd_write"
    (func $fd_write (param i32 i32 i32 i32) (result i32)))
  (memory (export "memory") 1)
  (data (i32.const 64) "oops\n")
  (func (export "_start")
    (i32.store (i32.const 0) (i32.const 64))
    (i32.store (i32.const 4) (i32.const 5))
    (drop (call $fd_write (i32.const 2) (i32.const 0) (i32.const 1) (i32.const 8)))))
"#;

    /// Writes its whole environment block (`KEY=VALUE\0...`) to stdout.
    pub const ENV_ECHO: &str = r#"(module
  (import "wasi_snapshot_preview1" "environ_sizes_get"
    (func $environ_sizes_get (param i32 i32) (result i32)))
  (import "wasi_snapshot_preview1" "environ_get"
    (func $environ_get (param i32 i32) (result i32)))
  (import "wasi_snapshot_preview1" "fd_write"
    (func $fd_write (param i32 i32 i32 i32) (result i32)))
  (memory (export "memory") 1)
  (func (export "_start")
    (drop (call $environ_sizes_get (i32.const 0) (i32.const 4)))
    (drop (call $environ_get (i32.const 256) (i32.const 1024)))
    (i32.store (i32.const 16) (i32.const 1024))
    (i32.store (i32.const 20) (i32.load (i32.const 4)))
    (drop (call $fd_write (i32.const 1) (i32.const 16) (i32.const 1) (i32.const 24)))))
"#;

    /// Hits `unreachable`.
    pub const TRAP: &str = r#"(module
  (memory (export "memory") 1)
  (func (export "_start")
    unreachable))
"#;

    /// Loads past the end of its single memory page.
    pub const OUT_OF_BOUNDS: &str = r#"(module
  (memory (export "memory") 1)
  (func (export "_start")
    (drop (i32.load (i32.const 70000)))))
"#;

    /// Never returns.
    pub const SPIN: &str = r#"(module
  (memory (export "memory") 1)
  (func (export "_start")
    (loop $forever
      (br $forever))))
"#;

    /// A valid module with no `_start` export.
    pub const NO_START: &str = r#"(module
  (memory (export "memory") 1)
  (func (export "main")))
"#;

    /// Calls `proc_exit(code)`.
    pub fn exit_with(code: i32) -> String {
        format!(
            r#"(module
  (import "wasi_snapshot_preview1" "proc_exit" (func $proc_exit (param i32)))
  (memory (export "memory") 1)
  (func (export "_start")
    (call $proc_exit (i32.const {code}))))
"#
        )
    }

    /// Write a fixture into `dir` and return its path.
    pub fn write_module(dir: &Path, name: &str, source: &str) -> std::io::Result<PathBuf> {
        let path = dir.join(name);
        std::fs::write(&path, source)?;
        Ok(path)
    }
}

/// Event handler that records everything it receives.
pub struct RecordingHandler {
    events: Mutex<Vec<Event>>,
}

impl RecordingHandler {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            events: Mutex::new(Vec::new()),
        })
    }

    pub async fn events(&self) -> Vec<Event> {
        self.events.lock().await.clone()
    }

    /// Results of finished runs for `job`, in the order they were reported.
    pub async fn results_for(&self, job: &str) -> Vec<ExecutionResult> {
        self.events
            .lock()
            .await
            .iter()
            .filter_map(|event| match event {
                Event::RunFinished { job_id, result, .. } if job_id.as_str() == job => {
                    Some(result.clone())
                }
                _ => None,
            })
            .collect()
    }

    /// Poll until `job` has at least `count` results or `timeout` elapses.
    pub async fn wait_for_results(
        &self,
        job: &str,
        count: usize,
        timeout: Duration,
    ) -> Vec<ExecutionResult> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let results = self.results_for(job).await;
            if results.len() >= count || tokio::time::Instant::now() >= deadline {
                return results;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

#[async_trait]
impl EventHandler for RecordingHandler {
    async fn handle(&self, event: &Event) {
        self.events.lock().await.push(event.clone());
    }
}
