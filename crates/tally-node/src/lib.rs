//! # Tally Node
//!
//! Runs the reward engine: layered configuration, the recalculation worker
//! pool, the scheduler and reconciliation loop, and Prometheus metrics.

pub mod config;
pub mod metrics;
pub mod service;
pub mod worker;

pub use config::EngineConfig;
pub use metrics::EngineMetrics;
pub use service::{Collaborators, EngineService};
pub use worker::{DeadLetter, JobHandle, RecalcJob, RecalcOutcome, RecalcPool};
