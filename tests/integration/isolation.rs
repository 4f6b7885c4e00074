//! Fault isolation integration tests.
//!
//! Tests that verify a failing, hanging or busy job only affects its own
//! runs: other jobs keep firing and the scheduler keeps running.

use crate::common::{EVERY_SECOND, ModuleDir, align_to_second, recorded_scheduler};
use cronbox::testing::fixtures;
use cronbox::{ConcurrencyPolicy, ExecutionError, JobDescriptor, RunStatus, SchedulerConfig};
use std::time::Duration;

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_trapping_job_does_not_affect_others() {
    let modules = ModuleDir::new();
    let trap = modules.write("trap.wat", fixtures::TRAP);
    let hello = modules.write("hello.wat", fixtures::HELLO);

    let (mut scheduler, recorder) = recorded_scheduler(SchedulerConfig::default()).await;
    scheduler
        .register(JobDescriptor::new("broken", trap, EVERY_SECOND))
        .unwrap();
    scheduler
        .register(JobDescriptor::new("healthy", hello, EVERY_SECOND))
        .unwrap();

    let (handle, task) = scheduler.start().await;
    let broken = recorder
        .wait_for_results("broken", 2, Duration::from_secs(5))
        .await;
    let healthy = recorder
        .wait_for_results("healthy", 2, Duration::from_secs(5))
        .await;
    assert!(handle.is_running().await);
    handle.shutdown().await.unwrap();
    task.await.unwrap();

    assert!(broken.len() >= 2, "trapping job stopped firing");
    for result in &broken {
        assert_eq!(result.status, RunStatus::Failed);
        assert!(matches!(result.error, Some(ExecutionError::Trap(_))));
    }
    assert!(healthy.len() >= 2);
    assert!(healthy.iter().all(|r| r.status == RunStatus::Succeeded));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_hung_job_times_out_and_scheduler_keeps_running() {
    let modules = ModuleDir::new();
    let spin = modules.write("spin.wat", fixtures::SPIN);
    let hello = modules.write("hello.wat", fixtures::HELLO);

    let (mut scheduler, recorder) = recorded_scheduler(SchedulerConfig::default()).await;
    scheduler
        .register(
            JobDescriptor::new("hung", spin, EVERY_SECOND)
                .with_timeout(Duration::from_millis(200)),
        )
        .unwrap();
    scheduler
        .register(JobDescriptor::new("healthy", hello, EVERY_SECOND))
        .unwrap();

    let (handle, task) = scheduler.start().await;
    let hung = recorder
        .wait_for_results("hung", 2, Duration::from_secs(5))
        .await;
    let healthy = recorder
        .wait_for_results("healthy", 2, Duration::from_secs(5))
        .await;
    assert!(handle.is_running().await);
    handle.shutdown().await.unwrap();
    task.await.unwrap();

    assert!(hung.len() >= 2);
    for result in &hung {
        assert_eq!(result.status, RunStatus::TimedOut);
        assert_eq!(
            result.error,
            Some(ExecutionError::TimedOut(Duration::from_millis(200)))
        );
        assert!(result.duration < Duration::from_secs(1));
    }
    assert!(healthy.iter().all(|r| r.status == RunStatus::Succeeded));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_busy_job_skips_overlapping_fire() {
    let modules = ModuleDir::new();
    let spin = modules.write("spin.wat", fixtures::SPIN);

    let config = SchedulerConfig::default().with_shutdown_grace(Duration::from_millis(100));
    let (mut scheduler, recorder) = recorded_scheduler(config).await;
    scheduler
        .register(
            JobDescriptor::new("slow", spin, EVERY_SECOND)
                .with_timeout(Duration::from_millis(1500)),
        )
        .unwrap();

    align_to_second(Duration::from_millis(200)).await;
    let (handle, task) = scheduler.start().await;
    let results = recorder
        .wait_for_results("slow", 2, Duration::from_secs(5))
        .await;
    handle.shutdown().await.unwrap();
    task.await.unwrap();

    assert_eq!(results[0].status, RunStatus::Skipped);
    assert_eq!(results[0].error, Some(ExecutionError::Busy { in_flight: 1 }));
    assert_eq!(results[1].status, RunStatus::TimedOut);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_queue_policy_runs_backlog_and_skips_overflow() {
    let modules = ModuleDir::new();
    let spin = modules.write("spin.wat", fixtures::SPIN);

    let config = SchedulerConfig::default().with_shutdown_grace(Duration::from_millis(100));
    let (mut scheduler, recorder) = recorded_scheduler(config).await;
    scheduler
        .register(
            JobDescriptor::new("slow", spin, EVERY_SECOND)
                .with_timeout(Duration::from_millis(1500))
                .with_concurrency(ConcurrencyPolicy::queue(1, 1)),
        )
        .unwrap();

    // Fires at +1s run, +2s waits in the queue, +3s finds the queue full.
    align_to_second(Duration::from_millis(200)).await;
    let (handle, task) = scheduler.start().await;
    let results = recorder
        .wait_for_results("slow", 3, Duration::from_secs(8))
        .await;
    handle.shutdown().await.unwrap();
    task.await.unwrap();

    let statuses: Vec<RunStatus> = results.iter().take(3).map(|r| r.status).collect();
    assert_eq!(
        statuses,
        vec![RunStatus::TimedOut, RunStatus::Skipped, RunStatus::TimedOut]
    );
}

#[tokio::test]
async fn test_module_changes_are_picked_up_between_runs() {
    let modules = ModuleDir::new();
    let path = modules.write("job.wat", fixtures::HELLO);

    let (mut scheduler, recorder) = recorded_scheduler(SchedulerConfig::default()).await;
    scheduler
        .register(JobDescriptor::new("job", &path, "@daily"))
        .unwrap();

    let (handle, task) = scheduler.start().await;
    handle.trigger("job").await.unwrap();
    recorder
        .wait_for_results("job", 1, Duration::from_secs(5))
        .await;

    modules.write("job.wat", fixtures::STDERR);
    handle.trigger("job").await.unwrap();
    let results = recorder
        .wait_for_results("job", 2, Duration::from_secs(5))
        .await;
    handle.shutdown().await.unwrap();
    task.await.unwrap();

    assert_eq!(results[0].stdout.as_deref(), Some("hello from wasm\n"));
    assert_eq!(results[1].stdout.as_deref(), Some(""));
    assert_eq!(results[1].stderr.as_deref(), Some("oops\n"));
}
