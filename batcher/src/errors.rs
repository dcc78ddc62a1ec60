use crate::config::ValidationError;
use launcher::LaunchError;
use thiserror::Error;

/// Result type alias for batcher operations
pub type Result<T, E = BatcherError> = std::result::Result<T, E>;

#[derive(Error, Debug)]
pub enum BatcherError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid config: {0}")]
    InvalidConfig(#[from] ValidationError),

    #[error("Invalid batch: {0}")]
    InvalidBatch(&'static str),

    #[error("Batch queue is closed")]
    QueueClosed,

    #[error("Launch failed: {0}")]
    Launch(#[from] LaunchError),

    #[error("Consumer task failed: {0}")]
    ConsumerFailed(String),
}
