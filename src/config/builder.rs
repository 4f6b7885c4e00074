//! Job builder from YAML configuration.
//!
//! This module converts parsed config into the descriptors and scheduler
//! settings the rest of the crate works with.

use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::core::environment::Environment;
use crate::core::job::{ConcurrencyPolicy, JobDescriptor};
use crate::sandbox::OutputMode;
use crate::scheduler::SchedulerConfig;

use super::error::ConfigError;
use super::types::{ConcurrencyConfig, JobConfig, OutputConfig, Settings};
use super::yaml::YamlLoader;

/// A config file turned into runnable pieces.
#[derive(Debug, Clone)]
pub struct LoadedConfig {
    /// The file the config came from.
    pub path: PathBuf,
    pub scheduler: SchedulerConfig,
    pub jobs: Vec<JobDescriptor>,
}

/// Builder for creating job descriptors from YAML configuration.
pub struct JobConfigBuilder;

impl JobConfigBuilder {
    /// Build a descriptor from a job entry.
    ///
    /// Global env is layered under the job's own. A relative `wasm_path` is
    /// joined to `settings.base_dir` when one is set and otherwise left
    /// relative to the working directory.
    pub fn build(config: &JobConfig, settings: &Settings) -> JobDescriptor {
        let module_path = match &settings.base_dir {
            Some(base_dir) if config.wasm_path.is_relative() => base_dir.join(&config.wasm_path),
            _ => config.wasm_path.clone(),
        };

        let env = Environment::from_map(settings.env.clone())
            .merged_with(&Environment::from_map(config.env.clone()));

        let max_in_flight = config.max_concurrency.unwrap_or(1);
        let concurrency = match config.concurrency {
            ConcurrencyConfig::Skip => ConcurrencyPolicy::skip_if_busy(max_in_flight),
            ConcurrencyConfig::Queue(depth) => ConcurrencyPolicy::queue(max_in_flight, depth),
        };

        let name = config.name.as_str();
        let mut job = JobDescriptor::new(name, module_path, config.schedule.cron())
            .with_env(env)
            .with_args(config.args.iter().cloned())
            .with_concurrency(concurrency)
            .with_enabled(config.enabled);

        if let Some(timezone) = config.schedule.timezone() {
            job = job.with_timezone(timezone);
        }

        if let Some(secs) = config.timeout_secs {
            job = job.with_timeout(Duration::from_secs(secs));
        }

        job
    }

    /// Build the scheduler settings from the global section.
    pub fn scheduler_config(settings: &Settings) -> Result<SchedulerConfig, ConfigError> {
        let mut config = SchedulerConfig::default()
            .with_shutdown_grace(Duration::from_secs(settings.shutdown_grace_secs))
            .with_output(match settings.output {
                OutputConfig::Capture => OutputMode::Capture {
                    max_bytes: settings.max_output_bytes,
                },
                OutputConfig::Inherit => OutputMode::Inherit,
            });

        if let Some(secs) = settings.default_timeout_secs {
            config = config.with_default_timeout(Duration::from_secs(secs));
        }

        if let Some(mib) = settings.max_memory_mib {
            let bytes = mib
                .checked_mul(1024 * 1024)
                .and_then(|bytes| usize::try_from(bytes).ok())
                .ok_or_else(|| {
                    ConfigError::InvalidValue(format!("max_memory_mib {} is too large", mib))
                })?;
            config = config.with_max_memory_bytes(bytes);
        }

        Ok(config)
    }
}

/// Load a config file and build everything the scheduler needs from it.
pub fn load_jobs(path: impl AsRef<Path>) -> Result<LoadedConfig, ConfigError> {
    let path = path.as_ref();
    let config = YamlLoader::load_config(path)?;

    let scheduler = JobConfigBuilder::scheduler_config(&config.settings)?;
    let jobs = config
        .jobs
        .iter()
        .map(|job| JobConfigBuilder::build(job, &config.settings))
        .collect();

    Ok(LoadedConfig {
        path: path.to_path_buf(),
        scheduler,
        jobs,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::job::OverlapPolicy;
    use tempfile::TempDir;

    fn build_one(yaml: &str) -> JobDescriptor {
        let config = YamlLoader::parse_config(yaml).unwrap();
        JobConfigBuilder::build(&config.jobs[0], &config.settings)
    }

    #[test]
    fn test_build_simple_job() {
        let job = build_one(
            r#"
jobs:
  - name: hello
    wasm_path: jobs/hello.wasm
    schedule: "@hourly"
"#,
        );

        assert_eq!(job.name(), "hello");
        assert_eq!(job.module_path(), Path::new("jobs/hello.wasm"));
        assert_eq!(job.schedule(), "@hourly");
        assert_eq!(job.timezone(), "UTC");
        assert_eq!(job.timeout(), None);
        assert_eq!(job.concurrency(), ConcurrencyPolicy::default());
        assert!(job.is_enabled());
    }

    #[test]
    fn test_base_dir_applies_to_relative_paths_only() {
        let config = YamlLoader::parse_config(
            r#"
settings:
  base_dir: /etc/cronbox
jobs:
  - name: relative
    wasm_path: jobs/hello.wasm
    schedule: "@hourly"
  - name: absolute
    wasm_path: /opt/hello.wasm
    schedule: "@hourly"
"#,
        )
        .unwrap();

        let relative = JobConfigBuilder::build(&config.jobs[0], &config.settings);
        let absolute = JobConfigBuilder::build(&config.jobs[1], &config.settings);

        assert_eq!(
            relative.module_path(),
            Path::new("/etc/cronbox/jobs/hello.wasm")
        );
        assert_eq!(absolute.module_path(), Path::new("/opt/hello.wasm"));
    }

    #[test]
    fn test_job_env_overrides_global_env() {
        let job = build_one(
            r#"
settings:
  env:
    REGION: eu
    LEVEL: info
jobs:
  - name: hello
    wasm_path: hello.wasm
    schedule: "@hourly"
    env:
      LEVEL: debug
"#,
        );

        assert_eq!(job.env().get("REGION"), Some("eu"));
        assert_eq!(job.env().get("LEVEL"), Some("debug"));
        assert_eq!(job.env().len(), 2);
    }

    #[test]
    fn test_build_job_with_schedule_timezone_and_limits() {
        let job = build_one(
            r#"
jobs:
  - name: report
    wasm_path: report.wasm
    schedule:
      cron: "0 9 * * *"
      timezone: America/New_York
    args: ["--full"]
    timeout_secs: 5
    concurrency:
      queue: 3
    max_concurrency: 2
    enabled: false
"#,
        );

        assert_eq!(job.schedule(), "0 9 * * *");
        assert_eq!(job.timezone(), "America/New_York");
        assert_eq!(job.args(), ["--full".to_string()]);
        assert_eq!(job.timeout(), Some(Duration::from_secs(5)));
        assert_eq!(job.concurrency().max_in_flight(), 2);
        assert_eq!(job.concurrency().overlap(), OverlapPolicy::Queue(3));
        assert!(!job.is_enabled());
    }

    #[test]
    fn test_scheduler_config_from_settings() {
        let config = YamlLoader::parse_config(
            r#"
settings:
  default_timeout_secs: 20
  shutdown_grace_secs: 5
  max_memory_mib: 16
  max_output_bytes: 512
jobs:
  - name: a
    wasm_path: a.wasm
    schedule: "@daily"
"#,
        )
        .unwrap();

        let scheduler = JobConfigBuilder::scheduler_config(&config.settings).unwrap();

        assert_eq!(scheduler.default_timeout, Some(Duration::from_secs(20)));
        assert_eq!(scheduler.shutdown_grace, Duration::from_secs(5));
        assert_eq!(scheduler.sandbox.max_memory_bytes, Some(16 * 1024 * 1024));
        assert_eq!(scheduler.output, OutputMode::Capture { max_bytes: 512 });
    }

    #[test]
    fn test_load_jobs_keeps_paths_relative_to_working_dir() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("jobs.yaml");
        std::fs::write(
            &path,
            r#"
settings:
  output: inherit
jobs:
  - name: a
    wasm_path: modules/a.wasm
    schedule: "@daily"
  - name: b
    wasm_path: b.wasm
    schedule: "*/5 * * * * *"
"#,
        )
        .unwrap();

        let loaded = load_jobs(&path).unwrap();

        assert_eq!(loaded.path, path);
        assert_eq!(loaded.jobs.len(), 2);
        assert_eq!(loaded.jobs[0].module_path(), Path::new("modules/a.wasm"));
        assert_eq!(loaded.jobs[1].module_path(), Path::new("b.wasm"));
        assert_eq!(loaded.scheduler.output, OutputMode::Inherit);
    }

    #[test]
    fn test_load_jobs_reports_yaml_errors_with_path() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("broken.yaml");
        std::fs::write(&path, "jobs: [").unwrap();

        let err = load_jobs(&path).unwrap_err();

        assert!(matches!(err, ConfigError::ParseFile { .. }));
        assert!(err.to_string().contains("broken.yaml"));
    }
}
