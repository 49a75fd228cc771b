//! Control-loop engine for the site A/B-testing optimizer
//!
//! This crate wires the pure statistical engine to the outside world: the
//! `ABOptimizer` drives one restaurant's experiment per cycle, the
//! `Scheduler` drives periodic cycles, queue replenishment, weekly resets,
//! and retention cleanup. External collaborators (durable store, metrics
//! aggregation, variant publishing, hypothesis generation) are trait
//! boundaries; a DashMap-backed store is provided for tests and
//! single-process deployments.

pub mod memory;
pub mod optimizer;
pub mod scheduler;
pub mod traits;

pub use memory::MemoryExperimentStore;
pub use optimizer::{
    ABOptimizer, ActiveExperimentStatus, ArmSnapshot, OptimizeOutcome, OptimizerStatus,
};
pub use scheduler::Scheduler;
pub use traits::{
    ExperimentStore, HistoricalMetrics, HypothesisSource, MetricsProvider, VariantMetrics,
    VariantPublisher,
};
