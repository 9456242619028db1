//! Task tracking: measurement collection, end-of-window evaluation and the
//! lifecycle transitions that follow from it.

pub mod collector;
pub mod evaluator;
pub mod lifecycle;

pub use collector::{CollectOutcome, MeasurementCollector};
pub use evaluator::{Evaluator, Rule, Verdict};
pub use lifecycle::{LifecycleManager, LifecycleOutcome, SkipReason};
