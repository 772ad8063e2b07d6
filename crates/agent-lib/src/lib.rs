//! Core library for the Milvus coredump diagnostic pipeline
//!
//! This crate provides:
//! - Instance discovery and restart detection
//! - Coredump collection and pod correlation
//! - GDB- and LLM-backed analysis with value scoring
//! - Compressed storage with retention
//! - Crash-loop decommissioning with central arbitration
//! - Embedded persistence, health checks, and observability

pub mod analyzer;
pub mod cleaner;
pub mod collector;
pub mod config;
pub mod controller;
pub mod discovery;
pub mod health;
pub mod models;
pub mod observability;
pub mod persistence;
pub mod pipeline;
pub mod storage;

pub use config::Config;
pub use health::{
    HealthReport, PipelineHealth, ReadinessReport, Stage, StageHealth, StagePhase,
};
pub use models::*;
pub use observability::{AgentMetrics, StructuredLogger};
pub use pipeline::Pipeline;
