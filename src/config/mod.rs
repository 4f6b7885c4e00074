//! Configuration loading and parsing.
//!
//! This module provides YAML-based configuration for jobs and global settings.

mod builder;
mod error;
mod types;
mod yaml;

pub use builder::{JobConfigBuilder, LoadedConfig, load_jobs};
pub use error::ConfigError;
pub use types::{ConcurrencyConfig, CronConfig, JobConfig, OutputConfig, ScheduleConfig, Settings};
pub use yaml::{CONFIG_ENV_VAR, DEFAULT_CONFIG_PATH, YamlLoader};
