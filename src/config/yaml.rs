//! YAML configuration parsing.
//!
//! Parses the job file and validates the values the scheduler cannot start
//! without. Individual job entries are not checked here; a bad schedule or
//! an unusable limit is a registration error for that job alone.

use std::ffi::OsString;
use std::path::{Path, PathBuf};

use super::error::ConfigError;
use super::types::CronConfig;

/// Environment variable consulted when no config path is given.
pub const CONFIG_ENV_VAR: &str = "CRON_CONFIG";

/// Config path used when neither the CLI nor the environment names one.
pub const DEFAULT_CONFIG_PATH: &str = "config/jobs.yaml";

/// YAML configuration loader.
pub struct YamlLoader;

impl YamlLoader {
    /// Load configuration from a file.
    pub fn load_config(path: impl AsRef<Path>) -> Result<CronConfig, ConfigError> {
        let path = path.as_ref();
        let content =
            std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
                path: path.to_path_buf(),
                source,
            })?;
        let config: CronConfig =
            serde_yaml::from_str(&content).map_err(|source| ConfigError::ParseFile {
                path: path.to_path_buf(),
                source,
            })?;
        Self::validate(&config)?;
        Ok(config)
    }

    /// Parse configuration from a YAML string.
    pub fn parse_config(yaml: &str) -> Result<CronConfig, ConfigError> {
        let config: CronConfig = serde_yaml::from_str(yaml)?;
        Self::validate(&config)?;
        Ok(config)
    }

    /// Validate a configuration.
    fn validate(config: &CronConfig) -> Result<(), ConfigError> {
        let settings = &config.settings;
        if settings.default_timeout_secs == Some(0) {
            return Err(ConfigError::InvalidValue(
                "default_timeout_secs cannot be zero".into(),
            ));
        }
        if settings.max_memory_mib == Some(0) {
            return Err(ConfigError::InvalidValue(
                "max_memory_mib cannot be zero".into(),
            ));
        }
        if settings.max_output_bytes == 0 {
            return Err(ConfigError::InvalidValue(
                "max_output_bytes cannot be zero".into(),
            ));
        }

        if config.jobs.is_empty() {
            return Err(ConfigError::NoJobs);
        }

        Ok(())
    }

    /// Pick the config file: explicit path, else `CRON_CONFIG`, else the default.
    pub fn resolve_config_path(explicit: Option<PathBuf>) -> PathBuf {
        Self::resolve_config_path_with(explicit, std::env::var_os(CONFIG_ENV_VAR))
    }

    fn resolve_config_path_with(explicit: Option<PathBuf>, env: Option<OsString>) -> PathBuf {
        explicit
            .or_else(|| env.filter(|value| !value.is_empty()).map(PathBuf::from))
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH))
    }
}
