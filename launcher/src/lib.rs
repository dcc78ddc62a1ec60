//! Fan-out invocation of serverless functions.
//!
//! A launch signs one invoke request per `(region, launch)` slot, connects
//! every slot concurrently, writes all requests back to back and then drains
//! one response per connection.

pub mod config;
pub mod connect;
pub mod error;
pub mod launch;
pub mod metrics_defs;
pub mod payload;
pub mod request;
pub mod signer;
pub mod transport;

pub use config::{Credentials, LaunchSettings, ResponsePolicy, TransportKind};
pub use error::{ConfigError, ConnectError, LaunchError};
pub use launch::{
    Launch, LaunchReport, LaunchRequest, Launcher, SlotOutcome, SlotReport, launcher_from_settings,
    launchpar, request_once,
};
pub use request::{Endpoint, Invocation, InvocationMode, Operation};
