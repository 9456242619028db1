//! Batch workflow: collection, evaluation, lifecycle update and notification.

pub mod orchestrator;

pub use orchestrator::Orchestrator;

use thiserror::Error;

use crate::analysis::AnalysisError;
use crate::storage::StoreError;

/// Failure while processing a single task.
#[derive(Debug, Error)]
pub enum TaskError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Analysis(#[from] AnalysisError),
}

impl TaskError {
    /// The store is gone; continuing with other tasks is pointless.
    pub fn is_fatal(&self) -> bool {
        matches!(self, TaskError::Store(e) if e.is_unavailable())
    }
}
