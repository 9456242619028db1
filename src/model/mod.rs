//! Typed records shared by the store, analyzer and workflow.

/// Declares `as_str`, `Display` and `FromStr` for a unit enum using its
/// stored label.
macro_rules! labelled_enum {
    ($ty:ident, $kind:literal, { $($variant:ident => $label:literal),+ $(,)? }) => {
        impl $ty {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($ty::$variant => $label,)+
                }
            }
        }

        impl std::fmt::Display for $ty {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl std::str::FromStr for $ty {
            type Err = $crate::model::ParseEnumError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($label => Ok($ty::$variant),)+
                    other => Err($crate::model::ParseEnumError::new($kind, other)),
                }
            }
        }
    };
}
pub(crate) use labelled_enum;

pub mod incident;
pub mod run;
pub mod task;

pub use incident::{IncidentFilter, IncidentRecord};
pub use run::{AnalysisRun, RunMode, RunStatus, RunSummary, TaskFailure};
pub use task::{
    ConfidenceLevel, Decision, DeliveryStatus, Frequency, IssueType, Measurement,
    NotificationKind, NotificationLog, SummaryStatus, Task, TaskEvaluation, TaskExtension,
    TaskStatus, TaskSummary,
};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Failure to parse a stored enum label.
#[derive(Debug, Clone, Error)]
#[error("unknown {kind} '{value}'")]
pub struct ParseEnumError {
    pub kind: &'static str,
    pub value: String,
}

impl ParseEnumError {
    pub fn new(kind: &'static str, value: &str) -> Self {
        Self {
            kind,
            value: value.to_string(),
        }
    }
}

/// What a task or finding is about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Mechanic,
    Machine,
    Line,
    Overall,
}

labelled_enum!(EntityKind, "entity kind", {
    Mechanic => "mechanic",
    Machine => "machine",
    Line => "line",
    Overall => "overall",
});
