//! Cron-driven daemon for the monitoring workflow.

pub mod cron;
pub mod daemon;

pub use self::cron::{ModeSchedule, Schedules};
pub use self::daemon::run_scheduler_loop;
