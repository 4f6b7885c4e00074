//! Configuration error types.
//!
//! Every variant is fatal at startup. Problems confined to one job (a bad
//! schedule, a duplicate name) are registration errors instead.

use std::path::PathBuf;
use thiserror::Error;

/// Errors that can occur when loading the job file.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The config file could not be read.
    #[error("failed to read config file '{path}': {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// YAML that did not come from a file failed to parse.
    #[error("YAML parse error: {0}")]
    Parse(#[from] serde_yaml::Error),

    /// The config file is not valid YAML or does not match the schema.
    #[error("YAML parse error in '{path}': {source}")]
    ParseFile {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("configuration defines no jobs")]
    NoJobs,

    /// A global setting is present but unusable, such as a zero timeout.
    #[error("invalid configuration: {0}")]
    InvalidValue(String),
}
