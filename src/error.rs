use std::path::PathBuf;
use thiserror::Error;

/// Load-time failures. Any of these aborts the run before a point executes.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read configuration at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: config::ConfigError,
    },

    #[error("invalid parameters for {kind} engine '{engine}': {message}")]
    Parameters {
        kind: &'static str,
        engine: String,
        message: String,
    },

    #[error("unknown {kind} engine '{engine}'")]
    UnknownEngine { kind: &'static str, engine: String },

    #[error("invalid tag pattern '{pattern}': {source}")]
    InvalidPattern {
        pattern: String,
        #[source]
        source: globset::Error,
    },

    #[error("duplicate {kind} point name '{name}'")]
    DuplicateName { kind: &'static str, name: String },

    #[error("invalid setting {key}: {message}")]
    Setting { key: &'static str, message: String },
}

#[derive(Debug, Error)]
pub enum LockError {
    #[error("lock {0} released while not held")]
    NotHeld(PathBuf),

    #[error("cannot remove lock marker {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}
