//! Core types and data models for the site A/B-testing optimizer
//!
//! This crate provides the fundamental data structures shared across the
//! optimizer: experiments, variants, per-restaurant optimizer state, and the
//! hypothesis queue.

pub mod errors;
pub mod experiments;
pub mod queue;
pub mod state;

pub use errors::{OptimizerError, Result};
pub use experiments::{ChangeType, Experiment, ExperimentStatus, Variant};
pub use queue::{ExperimentQueueItem, HypothesisCandidate, QueueSource};
pub use state::{
    week_start_sunday, BaselineMetrics, CompoundChange, Learning, LearningOutcome, OptimizerState,
};
