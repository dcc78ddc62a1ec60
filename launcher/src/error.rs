use crate::connect::SlotId;
use thiserror::Error;

/// Errors raised while loading process configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("missing environment variable: {0}")]
    MissingEnv(String),

    #[error("invalid value for environment variable {name}: {reason}")]
    InvalidEnv { name: String, reason: String },

    #[error("could not read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// Errors raised while establishing a single slot's connection.
#[derive(Error, Debug, Clone)]
pub enum ConnectError {
    #[error("could not resolve {host}: {reason}")]
    Resolve { host: String, reason: String },

    #[error("tcp connect failed: {0}")]
    Tcp(String),

    #[error("tls handshake failed: {0}")]
    Tls(String),

    #[error("invalid tls server name: {0}")]
    InvalidServerName(String),

    #[error("connect timed out")]
    Timeout,
}

impl ConnectError {
    pub(crate) fn tcp(e: std::io::Error) -> Self {
        ConnectError::Tcp(e.to_string())
    }

    pub(crate) fn tls(e: std::io::Error) -> Self {
        ConnectError::Tls(e.to_string())
    }
}

/// Errors that abort a whole fan-out launch.
#[derive(Error, Debug)]
pub enum LaunchError {
    #[error("no regions to launch in")]
    NoRegions,

    #[error("launch count must be positive")]
    NoLaunches,

    #[error("{requested} launches exceed the limit of {max}")]
    TooManyLaunches { requested: usize, max: usize },

    #[error("failed to build request: {0}")]
    Build(#[from] http::Error),

    #[error("could not start launch runtime: {0}")]
    Runtime(#[source] std::io::Error),

    #[error("connect failed: {0}")]
    Connect(#[from] ConnectError),

    #[error("request failed: {0}")]
    Request(String),

    #[error("slot {slot} rejected: {reason}")]
    Rejected { slot: SlotId, reason: String },
}

impl LaunchError {
    /// Fatal errors terminate the process under the strict response policy.
    pub fn is_fatal(&self) -> bool {
        matches!(self, LaunchError::Rejected { .. })
    }
}
