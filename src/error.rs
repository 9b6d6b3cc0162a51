//! Error types for the configuration pipeline.
//!
//! Everything that can go wrong before a process is spawned is surfaced
//! through [`Error`]; runtime failures (spawn errors, non-zero exits) are
//! reported per-process through the event stream instead.

use std::path::PathBuf;

use thiserror::Error;

/// Errors produced while loading, interpolating, validating or filtering a
/// configuration.
#[derive(Debug, Error)]
pub enum Error {
    /// Structural problem in the raw configuration.
    #[error("{0}")]
    Config(String),

    /// The dependency graph contains a cycle.
    #[error("dependency cycle detected: {0}")]
    Cycle(String),

    /// `--only` or `--exclude` named a process that does not exist.
    #[error("unknown process: {0}")]
    UnknownProcess(String),

    /// A `${VAR:?message}` expansion failed.
    #[error("{0}")]
    Interpolation(String),

    /// An env file could not be read.
    #[error("failed to read env file {path}: {source}")]
    EnvFile {
        /// The offending path.
        path: PathBuf,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// A configuration file could not be read.
    #[error("failed to read config file {path}: {source}")]
    ConfigRead {
        /// The offending path.
        path: PathBuf,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// A configuration file could not be parsed.
    #[error("failed to parse config file {path}: {message}")]
    ConfigParse {
        /// The offending path.
        path: PathBuf,
        /// Parser error text.
        message: String,
    },
}
