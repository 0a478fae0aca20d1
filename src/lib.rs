//! Leakage-free feature pipeline for sports schedules and box scores.
//!
//! Raw games and per-entity box-score rows are normalized into ordered,
//! deduplicated sequences, rolled into trailing averages that never see the
//! game they describe, enriched with rest and team strength context, and
//! assembled into one model-ready table.

pub mod config;
pub mod db;
pub mod error;
pub mod features;
pub mod output;
pub mod pipeline;

pub use config::{Config, ModelingUnit, PipelineSettings};
pub use error::{PipelineError, Result, Stage, StageFailure};
