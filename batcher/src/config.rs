use launcher::LaunchSettings;
use serde::Deserialize;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug, PartialEq)]
pub enum ValidationError {
    #[error("Port cannot be 0")]
    InvalidPort,

    #[error("Poll interval cannot be 0")]
    InvalidPollInterval,

    #[error("Launch settings need a service and a domain")]
    InvalidEndpoint,

    #[error("max_launches cannot be 0")]
    InvalidMaxLaunches,
}

fn default_poll_interval_ms() -> u64 {
    10
}

/// Batching service configuration
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct Config {
    /// Listener accepting launch batches
    pub listener: Listener,
    /// Admin listener for health endpoints
    pub admin_listener: Listener,
    /// How long the consumer sleeps when the queue is empty
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default)]
    pub launch: LaunchSettings,
}

impl Config {
    pub fn validate(&self) -> Result<(), ValidationError> {
        self.listener.validate()?;
        self.admin_listener.validate()?;

        if self.poll_interval_ms == 0 {
            return Err(ValidationError::InvalidPollInterval);
        }
        if self.launch.service.is_empty() || self.launch.domain.is_empty() {
            return Err(ValidationError::InvalidEndpoint);
        }
        if self.launch.port == 0 {
            return Err(ValidationError::InvalidPort);
        }
        if self.launch.max_launches == 0 {
            return Err(ValidationError::InvalidMaxLaunches);
        }
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct Listener {
    /// Host address to bind to (e.g., "0.0.0.0" or "127.0.0.1")
    pub host: String,
    pub port: u16,
}

impl Listener {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.port == 0 {
            return Err(ValidationError::InvalidPort);
        }
        Ok(())
    }
}
