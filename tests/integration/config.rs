//! Config-to-execution integration tests.
//!
//! Tests that load a YAML job file from disk, register what it describes
//! and run the jobs through a live scheduler.

use crate::common::{ModuleDir, recorded_scheduler};
use cronbox::testing::fixtures;
use cronbox::{ConfigError, RegistrationError, RunStatus, SchedulerError, load_jobs};
use std::time::Duration;

fn write_config(modules: &ModuleDir, yaml: &str) -> std::path::PathBuf {
    let path = modules.path().join("jobs.yaml");
    std::fs::write(&path, yaml).unwrap();
    path
}

#[tokio::test]
async fn test_bad_schedule_is_skipped_and_other_jobs_run() {
    let modules = ModuleDir::new();
    modules.write("hello.wat", fixtures::HELLO);
    modules.write("env.wat", fixtures::ENV_ECHO);
    let path = write_config(
        &modules,
        &format!(
            r#"
settings:
  shutdown_grace_secs: 1
  base_dir: {base_dir}
  env:
    REGION: eu
jobs:
  - name: hello
    wasm_path: hello.wat
    schedule: "@daily"
  - name: typo
    wasm_path: hello.wat
    schedule: "every tuesday"
  - name: env
    wasm_path: env.wat
    schedule:
      cron: "0 0 9 * * *"
      timezone: Europe/Berlin
    env:
      GREETING: hi
"#,
            base_dir = modules.path().display()
        ),
    );

    let loaded = load_jobs(&path).unwrap();
    assert_eq!(loaded.jobs.len(), 3);
    assert_eq!(loaded.scheduler.shutdown_grace, Duration::from_secs(1));

    let (mut scheduler, recorder) = recorded_scheduler(loaded.scheduler).await;
    let report = scheduler.register_all(loaded.jobs).unwrap();

    assert_eq!(report.registered_count(), 2);
    assert_eq!(report.rejected_count(), 1);
    assert!(matches!(
        &report.rejected[0],
        RegistrationError::InvalidSchedule { job, .. } if job == "typo"
    ));

    let (handle, task) = scheduler.start().await;
    handle.trigger("hello").await.unwrap();
    handle.trigger("env").await.unwrap();
    let hello = recorder
        .wait_for_results("hello", 1, Duration::from_secs(5))
        .await;
    let env = recorder
        .wait_for_results("env", 1, Duration::from_secs(5))
        .await;
    assert!(handle.trigger("typo").await.is_err());
    handle.shutdown().await.unwrap();
    task.await.unwrap();

    assert_eq!(hello[0].status, RunStatus::Succeeded);
    assert_eq!(env[0].status, RunStatus::Succeeded);
    let stdout = env[0].stdout.as_deref().unwrap_or_default();
    assert!(stdout.contains("REGION=eu\0"), "env was {:?}", stdout);
    assert!(stdout.contains("GREETING=hi\0"), "env was {:?}", stdout);
}

#[tokio::test]
async fn test_malformed_job_entries_do_not_block_good_jobs() {
    let modules = ModuleDir::new();
    let hello = modules.write("hello.wat", fixtures::HELLO);
    let path = write_config(
        &modules,
        &format!(
            r#"
jobs:
  - name: good
    wasm_path: {hello}
    schedule: "@daily"
  - name: no-schedule
    wasm_path: {hello}
    schedule: ""
  - name: zero-timeout
    wasm_path: {hello}
    schedule: "@daily"
    timeout_secs: 0
  - name: zero-queue
    wasm_path: {hello}
    schedule: "@daily"
    concurrency:
      queue: 0
"#,
            hello = hello.display()
        ),
    );

    let loaded = load_jobs(&path).unwrap();
    assert_eq!(loaded.jobs.len(), 4);

    let (mut scheduler, recorder) = recorded_scheduler(loaded.scheduler).await;
    let report = scheduler.register_all(loaded.jobs).unwrap();

    assert_eq!(report.registered_count(), 1);
    let mut rejected: Vec<&str> = report.rejected.iter().map(|e| e.job()).collect();
    rejected.sort_unstable();
    assert_eq!(rejected, vec!["no-schedule", "zero-queue", "zero-timeout"]);
    assert!(matches!(
        report.rejected[0],
        RegistrationError::InvalidSchedule { .. }
    ));
    assert!(matches!(
        report.rejected[1],
        RegistrationError::InvalidJob { .. }
    ));

    let (handle, task) = scheduler.start().await;
    handle.trigger("good").await.unwrap();
    let results = recorder
        .wait_for_results("good", 1, Duration::from_secs(5))
        .await;
    handle.shutdown().await.unwrap();
    task.await.unwrap();

    assert_eq!(results.len(), 1);
    assert_eq!(results[0].status, RunStatus::Succeeded);
}

#[tokio::test]
async fn test_only_bad_schedules_means_no_jobs() {
    let modules = ModuleDir::new();
    let path = write_config(
        &modules,
        r#"
jobs:
  - name: typo
    wasm_path: hello.wat
    schedule: "61 * * * *"
"#,
    );

    let loaded = load_jobs(&path).unwrap();
    let (mut scheduler, _recorder) = recorded_scheduler(loaded.scheduler).await;

    assert!(matches!(
        scheduler.register_all(loaded.jobs),
        Err(SchedulerError::NoJobs)
    ));
}

#[test]
fn test_missing_config_file() {
    let modules = ModuleDir::new();
    let result = load_jobs(modules.path().join("absent.yaml"));

    assert!(matches!(result, Err(ConfigError::Read { .. })));
}

#[test]
fn test_invalid_timezone_is_a_registration_error() {
    let modules = ModuleDir::new();
    let path = write_config(
        &modules,
        r#"
jobs:
  - name: hello
    wasm_path: hello.wat
    schedule:
      cron: "@hourly"
      timezone: Mars/Olympus_Mons
"#,
    );

    let loaded = load_jobs(&path).unwrap();
    let mut registry = cronbox::TriggerRegistry::new();
    let result = registry.register(loaded.jobs.into_iter().next().unwrap());

    assert!(matches!(
        result,
        Err(RegistrationError::InvalidSchedule { job, .. }) if job == "hello"
    ));
}
