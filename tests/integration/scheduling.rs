//! Scheduled execution integration tests.
//!
//! Tests that verify jobs fire on their cron schedules, one run per fire
//! time, and that a job with a broken module still gets scheduled.

use crate::common::{
    EVERY_SECOND, ModuleDir, align_to_second, finished_fire_times, recorded_scheduler,
};
use cronbox::testing::fixtures;
use cronbox::{
    Event, ExecutionError, JobDescriptor, RegistrationError, RunStatus, SchedulerConfig,
    SchedulerError,
};
use std::time::Duration;

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_every_second_job_fires_once_per_second() {
    let modules = ModuleDir::new();
    let hello = modules.write("hello.wat", fixtures::HELLO);

    let (mut scheduler, recorder) = recorded_scheduler(SchedulerConfig::default()).await;
    scheduler
        .register(JobDescriptor::new("a", hello, EVERY_SECOND))
        .unwrap();

    align_to_second(Duration::from_millis(200)).await;
    let (handle, task) = scheduler.start().await;
    tokio::time::sleep(Duration::from_secs(3)).await;
    handle.shutdown().await.unwrap();
    task.await.unwrap();

    let results = recorder.results_for("a").await;
    assert_eq!(results.len(), 3, "expected three runs, got {:?}", results);
    for result in &results {
        assert_eq!(result.status, RunStatus::Succeeded);
        assert_eq!(result.stdout.as_deref(), Some("hello from wasm\n"));
    }

    for pair in results.windows(2) {
        let gap = (pair[1].started_at - pair[0].started_at)
            .to_std()
            .unwrap();
        assert!(gap >= Duration::from_millis(900), "runs started {:?} apart", gap);
    }

    let fire_times = finished_fire_times(&recorder.events().await, "a");
    for pair in fire_times.windows(2) {
        assert_eq!(pair[1] - pair[0], chrono::Duration::seconds(1));
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_missing_module_registers_and_every_run_fails() {
    let modules = ModuleDir::new();
    let missing = modules.path().join("missing.wasm");

    let (mut scheduler, recorder) = recorded_scheduler(SchedulerConfig::default()).await;
    let registered = scheduler.register(JobDescriptor::new("b", missing, EVERY_SECOND));
    assert!(registered.is_ok());

    let (handle, task) = scheduler.start().await;
    let results = recorder
        .wait_for_results("b", 2, Duration::from_secs(5))
        .await;
    handle.shutdown().await.unwrap();
    task.await.unwrap();

    assert!(results.len() >= 2);
    for result in &results {
        assert_eq!(result.status, RunStatus::Failed);
        assert!(matches!(result.error, Some(ExecutionError::Read { .. })));
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_duplicate_name_leaves_first_job_in_place() {
    let modules = ModuleDir::new();
    let hello = modules.write("hello.wat", fixtures::HELLO);
    let stderr = modules.write("stderr.wat", fixtures::STDERR);

    let (mut scheduler, recorder) = recorded_scheduler(SchedulerConfig::default()).await;
    let report = scheduler
        .register_all([
            JobDescriptor::new("a", &hello, "@daily"),
            JobDescriptor::new("a", &stderr, "@hourly"),
        ])
        .unwrap();

    assert_eq!(report.registered_count(), 1);
    assert_eq!(
        report.rejected,
        vec![RegistrationError::DuplicateJob("a".into())]
    );
    let job = scheduler.get_job(&"a".into()).unwrap();
    assert_eq!(job.module_path(), hello.as_path());
    assert_eq!(job.schedule(), "@daily");

    let (handle, task) = scheduler.start().await;
    handle.trigger("a").await.unwrap();
    let results = recorder
        .wait_for_results("a", 1, Duration::from_secs(5))
        .await;
    handle.shutdown().await.unwrap();
    task.await.unwrap();

    assert_eq!(results[0].stdout.as_deref(), Some("hello from wasm\n"));
}

#[tokio::test]
async fn test_disabled_job_runs_only_when_triggered() {
    let modules = ModuleDir::new();
    let hello = modules.write("hello.wat", fixtures::HELLO);

    let (mut scheduler, recorder) = recorded_scheduler(SchedulerConfig::default()).await;
    scheduler
        .register(JobDescriptor::new("quiet", hello, EVERY_SECOND).with_enabled(false))
        .unwrap();

    let (handle, task) = scheduler.start().await;
    tokio::time::sleep(Duration::from_millis(1500)).await;
    assert!(recorder.results_for("quiet").await.is_empty());

    let run_id = handle.trigger("quiet").await.unwrap();
    let results = recorder
        .wait_for_results("quiet", 1, Duration::from_secs(5))
        .await;
    handle.shutdown().await.unwrap();
    task.await.unwrap();

    assert_eq!(results.len(), 1);
    assert_eq!(results[0].status, RunStatus::Succeeded);

    let started = recorder
        .events()
        .await
        .into_iter()
        .any(|event| matches!(event, Event::RunStarted { run_id: id, .. } if id == run_id));
    assert!(started);
}

#[tokio::test]
async fn test_trigger_unknown_job() {
    let modules = ModuleDir::new();
    let hello = modules.write("hello.wat", fixtures::HELLO);

    let (mut scheduler, _recorder) = recorded_scheduler(SchedulerConfig::default()).await;
    scheduler
        .register(JobDescriptor::new("a", hello, "@daily"))
        .unwrap();

    let (handle, task) = scheduler.start().await;
    let result = handle.trigger("nope").await;
    handle.shutdown().await.unwrap();
    task.await.unwrap();

    assert!(matches!(result, Err(SchedulerError::JobNotFound(name)) if name == "nope"));
}
