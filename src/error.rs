//! Error taxonomy for the scheduler core.
//!
//! Config and dispatch failures are never fatal to the daemon: a bad file
//! keeps its last good snapshot, a refused launch finalises its targets.
//! Only failure to bind the channel port or to read the config directory at
//! startup aborts the process (surfaced as plain `anyhow` errors in `cli`).

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("could not parse {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("invalid schedule expression '{expr}': {source}")]
    BadSchedule {
        expr: String,
        #[source]
        source: cron::error::Error,
    },

    #[error("job '{job}' is invalid: {reason}")]
    BadJob { job: String, reason: String },
}

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("target resolution failed: {0}")]
    TargetResolution(String),

    #[error("bus refused the launch: {0}")]
    Submit(String),

    #[error("bus poll failed: {0}")]
    Poll(String),

    #[error("bus command failed: {0}")]
    BusIo(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("message before connect")]
    NotConnected,

    #[error("frame identity ({got}) does not match connection ({expected})")]
    IdentityMismatch { expected: String, got: String },

    #[error("unparseable frame: {0}")]
    BadFrame(#[from] serde_json::Error),
}
