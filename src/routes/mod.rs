//! HTTP handlers for the cleanup daemon

pub mod health;
pub mod metrics;
pub mod status;
