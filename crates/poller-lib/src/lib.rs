//! Forecast poller library
//!
//! This crate provides the core functionality for:
//! - Translating training configs into inference dataset parameters
//! - Refreshing resampled dataset snapshots from a SQL source
//! - Running forecasting models and reshaping their output
//! - Writing prediction tables to a SQL sink
//! - The fixed-period poll loop tying those together
//! - Health checks and observability

pub mod config;
pub mod dataset;
pub mod engine;
pub mod health;
pub mod models;
pub mod observability;
pub mod predictor;
pub mod scheduler;
pub mod sink;

pub use health::{
    ComponentHealth, ComponentStatus, HealthRegistry, HealthResponse, ReadinessResponse,
};
pub use models::*;
pub use observability::{PollerMetrics, StructuredLogger};
