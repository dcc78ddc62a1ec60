//! Serving plumbing shared by the launcher service crates: the hyper accept
//! loop, the admin (health/readiness) service and metric definition types.

pub mod admin_service;
pub mod http;
pub mod metrics_defs;
