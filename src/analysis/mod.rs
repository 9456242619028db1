//! Statistical analysis of incident and measurement data.
//!
//! `stats` holds the pure numeric building blocks, `summary` turns a task's
//! measurement history into a [`TaskSummary`](crate::model::TaskSummary) and
//! `patterns` buckets incidents by time dimension and compares each entity
//! against the team baseline for the same bucket. `pareto` and `repeats`
//! attribute downtime to its causes.

pub mod pareto;
pub mod patterns;
pub mod repeats;
pub mod stats;
pub mod summary;

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum AnalysisError {
    #[error("insufficient data: need {needed} samples, have {have}")]
    InsufficientData { needed: usize, have: usize },

    #[error("computation failed: {0}")]
    Computation(String),
}

pub type AnalysisResult<T> = Result<T, AnalysisError>;
