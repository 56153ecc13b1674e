//! Macrosrv - HTTP front for the macro automation engine
//!
//! Wires the engine library to the outside world: YAML/env configuration,
//! HTTP effect backends for work items and notifications, and the axum
//! API surface (event ingress, history, resume).

pub mod config;
pub mod effects;
pub mod error;
pub mod routes;

pub use config::Config;
pub use error::{MacrosrvError, Result};
