//! Error types for wsexec.
//!
//! - `ConfigError`: CLI/TOML configuration could not be resolved
//! - `LaunchError`: the child process could not be started (fatal to a session)
//! - `RelayError`: one relay direction failed (ends that relay, triggers teardown)

use std::io;
use std::path::PathBuf;

use tokio_tungstenite::tungstenite;

/// Configuration loading errors
#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file '{}': {source}", .path.display())]
    FileRead { path: PathBuf, source: io::Error },

    #[error("Failed to parse config file '{}': {source}", .path.display())]
    TomlParse {
        path: PathBuf,
        source: toml::de::Error,
    },

    /// Neither the command line nor the config file named a program to run.
    #[error("no command given: pass a program after the options or set [process] command")]
    MissingCommand,

    #[error("invalid value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

/// The child process could not be started.
///
/// Each pipe that can fail to materialise is a distinct cause so launch
/// failures can be told apart in the logs.
#[derive(thiserror::Error, Debug)]
pub enum LaunchError {
    #[error("program not found: {program}")]
    NotFound { program: String },

    #[error("failed to start {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },

    #[error("stdin pipe unavailable for {program}")]
    StdinUnavailable { program: String },

    #[error("stdout pipe unavailable for {program}")]
    StdoutUnavailable { program: String },
}

/// A single relay direction failed.
#[derive(thiserror::Error, Debug)]
pub enum RelayError {
    #[error("read from process failed: {0}")]
    Read(#[source] io::Error),

    #[error("write to process failed: {0}")]
    Write(#[source] io::Error),

    #[error("transport error: {0}")]
    Transport(#[from] tungstenite::Error),

    #[error("process output line exceeds {limit} bytes")]
    LineTooLong { limit: usize },
}
