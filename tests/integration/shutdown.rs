//! Graceful shutdown integration tests.
//!
//! Tests that verify the scheduler stops firing, lets in-flight runs finish
//! within the grace period, and aborts whatever is left after it.

use crate::common::{EVERY_SECOND, ModuleDir, recorded_scheduler};
use cronbox::testing::fixtures;
use cronbox::{ExecutionError, JobDescriptor, RunStatus, SchedulerConfig, SchedulerState};
use std::time::{Duration, Instant};

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_shutdown_waits_for_run_within_grace() {
    let modules = ModuleDir::new();
    let spin = modules.write("spin.wat", fixtures::SPIN);

    let config = SchedulerConfig::default().with_shutdown_grace(Duration::from_secs(5));
    let (mut scheduler, recorder) = recorded_scheduler(config).await;
    scheduler
        .register(
            JobDescriptor::new("slow", spin, "@daily").with_timeout(Duration::from_millis(500)),
        )
        .unwrap();

    let (handle, task) = scheduler.start().await;
    handle.trigger("slow").await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    let start = Instant::now();
    handle.shutdown().await.unwrap();
    task.await.unwrap();

    // The run ended by its own deadline, well inside the grace period.
    assert!(start.elapsed() < Duration::from_secs(3));
    let results = recorder.results_for("slow").await;
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].status, RunStatus::TimedOut);
    assert_eq!(handle.state().await, SchedulerState::Stopped);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_shutdown_aborts_runs_after_grace() {
    let modules = ModuleDir::new();
    let spin = modules.write("spin.wat", fixtures::SPIN);

    let config = SchedulerConfig::default().with_shutdown_grace(Duration::from_millis(300));
    let (mut scheduler, recorder) = recorded_scheduler(config).await;
    scheduler
        .register(JobDescriptor::new("forever", spin, "@daily"))
        .unwrap();

    let (handle, task) = scheduler.start().await;
    handle.trigger("forever").await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    let start = Instant::now();
    handle.shutdown().await.unwrap();
    task.await.unwrap();
    let elapsed = start.elapsed();

    assert!(elapsed >= Duration::from_millis(300));
    assert!(elapsed < Duration::from_secs(3), "shutdown took {:?}", elapsed);

    let results = recorder.results_for("forever").await;
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].status, RunStatus::Failed);
    assert_eq!(results[0].error, Some(ExecutionError::Aborted));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_no_runs_start_after_shutdown() {
    let modules = ModuleDir::new();
    let hello = modules.write("hello.wat", fixtures::HELLO);

    let (mut scheduler, recorder) = recorded_scheduler(SchedulerConfig::default()).await;
    scheduler
        .register(JobDescriptor::new("ticker", hello, EVERY_SECOND))
        .unwrap();

    let (handle, task) = scheduler.start().await;
    recorder
        .wait_for_results("ticker", 1, Duration::from_secs(5))
        .await;
    handle.shutdown().await.unwrap();
    task.await.unwrap();

    let count = recorder.events().await.len();
    tokio::time::sleep(Duration::from_millis(1500)).await;
    assert_eq!(recorder.events().await.len(), count);
}

#[tokio::test]
async fn test_idle_shutdown_is_immediate() {
    let modules = ModuleDir::new();
    let hello = modules.write("hello.wat", fixtures::HELLO);

    let (mut scheduler, _recorder) = recorded_scheduler(SchedulerConfig::default()).await;
    scheduler
        .register(JobDescriptor::new("a", hello, "@yearly"))
        .unwrap();

    let (handle, task) = scheduler.start().await;
    assert_eq!(handle.state().await, SchedulerState::Running);

    let start = Instant::now();
    handle.shutdown().await.unwrap();
    task.await.unwrap();

    assert!(start.elapsed() < Duration::from_secs(1));
    assert!(!handle.is_running().await);
    assert!(handle.trigger("a").await.is_err());
}

#[tokio::test]
async fn test_run_until_stops_on_signal() {
    let modules = ModuleDir::new();
    let hello = modules.write("hello.wat", fixtures::HELLO);

    let (mut scheduler, _recorder) = recorded_scheduler(SchedulerConfig::default()).await;
    scheduler
        .register(JobDescriptor::new("a", hello, "@yearly"))
        .unwrap();

    let (tx, rx) = tokio::sync::oneshot::channel::<()>();
    let run = tokio::spawn(scheduler.run_until(async {
        let _ = rx.await;
    }));

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!run.is_finished());

    tx.send(()).unwrap();
    let result = tokio::time::timeout(Duration::from_secs(5), run)
        .await
        .unwrap()
        .unwrap();
    assert!(result.is_ok());
}
