use std::str::FromStr;

use anyhow::{anyhow, Result};
use chrono::{DateTime, Duration, Utc};
use cron::Schedule as CronSchedule;

use crate::config::ScheduleConfig;
use crate::model::RunMode;

/// A workflow mode bound to its cron expression.
#[derive(Debug, Clone)]
pub struct ModeSchedule {
    pub mode: RunMode,
    pub expr: String,
    schedule: CronSchedule,
}

/// The daemon's cron table, in execution order.
#[derive(Debug, Clone)]
pub struct Schedules {
    entries: Vec<ModeSchedule>,
}

impl Schedules {
    /// Parse the daily, weekly and evaluation expressions.
    pub fn from_config(cfg: &ScheduleConfig) -> Result<Self> {
        let mut entries = Vec::with_capacity(3);
        for (mode, expr) in [
            (RunMode::Daily, &cfg.daily),
            (RunMode::Weekly, &cfg.weekly),
            (RunMode::Evaluation, &cfg.evaluation),
        ] {
            let schedule = CronSchedule::from_str(expr)
                .map_err(|e| anyhow!("invalid cron expression '{}' for {}: {}", expr, mode, e))?;
            entries.push(ModeSchedule {
                mode,
                expr: expr.clone(),
                schedule,
            });
        }
        Ok(Self { entries })
    }

    pub fn entries(&self) -> &[ModeSchedule] {
        &self.entries
    }

    /// Modes with a fire time in `(since, now]`. Each mode appears once even
    /// if several fire times were missed.
    pub fn due_between(&self, since: DateTime<Utc>, now: DateTime<Utc>) -> Vec<RunMode> {
        self.entries
            .iter()
            .filter(|e| {
                e.schedule
                    .after(&since)
                    .next()
                    .map(|next| next <= now)
                    .unwrap_or(false)
            })
            .map(|e| e.mode)
            .collect()
    }

    /// Upcoming fire times within `hours` of `from`, sorted by time.
    /// This is a dry-run preview, not the execution loop.
    pub fn preview(&self, from: DateTime<Utc>, hours: u64) -> Vec<(DateTime<Utc>, RunMode)> {
        let end = from + Duration::hours(hours as i64);
        let mut preview = Vec::new();
        for entry in &self.entries {
            for next in entry.schedule.after(&from) {
                if next > end {
                    break;
                }
                preview.push((next, entry.mode));
            }
        }
        preview.sort_by_key(|(at, _)| *at);
        preview
    }
}
