//! TOML configuration for maintrack.
//!
//! Every section has compiled-in defaults so a partial (or empty) file is
//! valid. The file path can be given explicitly, through `MAINTRACK_CONFIG`,
//! or found at the standard system location.

use std::path::{Path, PathBuf};
use std::str::FromStr;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::detect::Severity;

/// Environment variable naming an explicit config file.
pub const CONFIG_ENV: &str = "MAINTRACK_CONFIG";

/// Standard system location for the config file.
pub const SYSTEM_CONFIG_PATH: &str = "/etc/maintrack/maintrack.toml";

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

/// Root configuration for the tracker process.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TrackerConfig {
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub analysis: AnalysisConfig,
    #[serde(default)]
    pub classifier: ClassifierConfig,
    #[serde(default)]
    pub patterns: PatternConfig,
    #[serde(default)]
    pub breakdown: BreakdownConfig,
    #[serde(default)]
    pub evaluation: EvaluationConfig,
    #[serde(default)]
    pub notifications: NotificationConfig,
    #[serde(default)]
    pub schedule: ScheduleConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl TrackerConfig {
    /// Load configuration from a TOML file at `path`.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        let config: Self = toml::from_str(&content)
            .with_context(|| format!("failed to parse config file: {}", path.display()))?;
        config
            .validate()
            .with_context(|| format!("invalid config file: {}", path.display()))?;
        info!(path = %path.display(), "loaded tracker configuration");
        Ok(config)
    }

    /// Resolve configuration from, in order:
    /// 1. An explicit path (CLI `--config`), which must load.
    /// 2. The path in `MAINTRACK_CONFIG`.
    /// 3. `/etc/maintrack/maintrack.toml`.
    /// 4. Compiled-in defaults.
    pub fn resolve(explicit: Option<&Path>) -> Result<Self> {
        match explicit {
            Some(path) => Self::load(path),
            None => Ok(Self::load_or_default()),
        }
    }

    /// Like [`TrackerConfig::resolve`] without an explicit path. Broken files
    /// are logged and skipped.
    pub fn load_or_default() -> Self {
        if let Ok(env_path) = std::env::var(CONFIG_ENV) {
            let path = Path::new(&env_path);
            match Self::load(path) {
                Ok(cfg) => return cfg,
                Err(e) => {
                    warn!(
                        path = %path.display(),
                        error = %e,
                        "MAINTRACK_CONFIG set but file could not be loaded, trying fallback"
                    );
                }
            }
        }

        let system_path = Path::new(SYSTEM_CONFIG_PATH);
        if system_path.exists() {
            match Self::load(system_path) {
                Ok(cfg) => return cfg,
                Err(e) => {
                    warn!(
                        path = %system_path.display(),
                        error = %e,
                        "system config file exists but could not be loaded, using defaults"
                    );
                }
            }
        }

        debug!("no config file found, using compiled-in defaults");
        Self::default()
    }

    /// Reject values that would make the pipeline misbehave.
    pub fn validate(&self) -> Result<()> {
        if self.storage.max_attempts == 0 {
            bail!("storage.max_attempts must be at least 1");
        }
        if self.analysis.min_samples < 2 {
            bail!("analysis.min_samples must be at least 2");
        }
        if self.analysis.moving_average_window == 0 {
            bail!("analysis.moving_average_window must be at least 1");
        }
        for (name, alpha) in [
            ("analysis.trend_alpha", self.analysis.trend_alpha),
            ("analysis.halves_alpha", self.analysis.halves_alpha),
        ] {
            if !(alpha > 0.0 && alpha < 1.0) {
                bail!("{name} must be in (0, 1), got {alpha}");
            }
        }

        let rules = &self.classifier.rules;
        for pair in rules.windows(2) {
            if pair[1].min_percent_diff > pair[0].min_percent_diff {
                bail!(
                    "classifier.rules must be ordered from strictest to loosest ({} before {})",
                    pair[0].severity,
                    pair[1].severity
                );
            }
        }
        if let Some(loosest) = rules.last() {
            if self.classifier.floor_percent_diff > loosest.min_percent_diff {
                bail!("classifier.floor_percent_diff must not exceed the loosest rule");
            }
        }

        if self.patterns.work_hours_start >= self.patterns.work_hours_end
            || self.patterns.work_hours_end > 24
        {
            bail!(
                "patterns.work_hours {}-{} is not a valid range",
                self.patterns.work_hours_start,
                self.patterns.work_hours_end
            );
        }
        for shift in &self.patterns.shifts {
            if shift.start_hour > 23 || shift.end_hour > 24 || shift.start_hour == shift.end_hour {
                bail!("shift '{}' has an invalid hour range", shift.name);
            }
        }

        let threshold = self.breakdown.pareto_threshold_pct;
        if !(threshold > 0.0 && threshold <= 100.0) {
            bail!("breakdown.pareto_threshold_pct must be in (0, 100], got {threshold}");
        }
        if self.breakdown.repeat_window_minutes <= 0 {
            bail!("breakdown.repeat_window_minutes must be positive");
        }

        if self.evaluation.cycle_days <= 0 {
            bail!("evaluation.cycle_days must be positive");
        }
        if self.evaluation.partial_improvement_pct > self.evaluation.target_improvement_pct {
            bail!("evaluation.partial_improvement_pct must not exceed target_improvement_pct");
        }

        for (name, expr) in [
            ("schedule.daily", &self.schedule.daily),
            ("schedule.weekly", &self.schedule.weekly),
            ("schedule.evaluation", &self.schedule.evaluation),
        ] {
            cron::Schedule::from_str(expr)
                .map_err(|e| anyhow::anyhow!("{name}: invalid cron expression '{expr}': {e}"))?;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Storage
// ---------------------------------------------------------------------------

/// Database location and connectivity retry policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Path to the SQLite database file.
    pub db_path: PathBuf,
    /// Attempts per store call before `Unavailable` is surfaced.
    pub max_attempts: u32,
    /// First retry delay; doubles on every attempt.
    pub initial_backoff_ms: u64,
    /// Ceiling for the retry delay.
    pub max_backoff_ms: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("data/maintrack.db"),
            max_attempts: 4,
            initial_backoff_ms: 100,
            max_backoff_ms: 2_000,
        }
    }
}

// ---------------------------------------------------------------------------
// Analysis
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalysisConfig {
    /// Fewest measurements a task summary needs.
    pub min_samples: usize,
    /// Significance level for the trend slope test.
    pub trend_alpha: f64,
    /// Significance level for the first-half vs second-half test.
    pub halves_alpha: f64,
    pub moving_average_window: usize,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            min_samples: 2,
            trend_alpha: 0.05,
            halves_alpha: 0.10,
            moving_average_window: 3,
        }
    }
}

// ---------------------------------------------------------------------------
// Classifier
// ---------------------------------------------------------------------------

/// One severity tier. A deviation qualifies when both thresholds are met.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SeverityRule {
    pub severity: Severity,
    pub min_percent_diff: f64,
    pub min_z_score: f64,
}

/// Ordered threshold rules, strictest first.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClassifierConfig {
    /// Deviations below this percentage are never flagged.
    pub floor_percent_diff: f64,
    /// Severity assigned to deviations at or above the floor that miss every rule.
    pub floor_severity: Severity,
    /// Flag only deviations in the "worse" direction.
    pub worse_only: bool,
    /// Buckets with fewer incidents are not compared.
    pub min_bucket_incidents: usize,
    pub rules: Vec<SeverityRule>,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            rules: vec![
                SeverityRule {
                    severity: Severity::High,
                    min_percent_diff: 40.0,
                    min_z_score: 2.0,
                },
                SeverityRule {
                    severity: Severity::Medium,
                    min_percent_diff: 20.0,
                    min_z_score: 1.0,
                },
            ],
            floor_percent_diff: 10.0,
            floor_severity: Severity::Low,
            worse_only: true,
            min_bucket_incidents: 2,
        }
    }
}

// ---------------------------------------------------------------------------
// Patterns
// ---------------------------------------------------------------------------

/// A named shift. `end_hour` may be lower than `start_hour` for overnight shifts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShiftWindow {
    pub name: String,
    pub start_hour: u32,
    pub end_hour: u32,
}

impl ShiftWindow {
    pub fn contains(&self, hour: u32) -> bool {
        if self.start_hour < self.end_hour {
            hour >= self.start_hour && hour < self.end_hour
        } else {
            hour >= self.start_hour || hour < self.end_hour
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PatternConfig {
    /// First hour (inclusive) included in the hour dimension.
    pub work_hours_start: u32,
    /// Last hour (exclusive) included in the hour dimension.
    pub work_hours_end: u32,
    /// Minimum spacing between pattern analysis runs unless forced.
    pub min_days_between_runs: i64,
    pub shifts: Vec<ShiftWindow>,
}

impl Default for PatternConfig {
    fn default() -> Self {
        Self {
            work_hours_start: 7,
            work_hours_end: 17,
            shifts: vec![
                ShiftWindow {
                    name: "day".into(),
                    start_hour: 6,
                    end_hour: 14,
                },
                ShiftWindow {
                    name: "swing".into(),
                    start_hour: 14,
                    end_hour: 22,
                },
                ShiftWindow {
                    name: "night".into(),
                    start_hour: 22,
                    end_hour: 6,
                },
            ],
            min_days_between_runs: 30,
        }
    }
}

// ---------------------------------------------------------------------------
// Breakdowns
// ---------------------------------------------------------------------------

/// Downtime attribution and repeat-failure settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakdownConfig {
    /// Cumulative share (percent) that marks the Pareto contributors.
    pub pareto_threshold_pct: f64,
    /// Related factors listed per contributor and other dimension.
    pub related_factors: usize,
    /// A failure on the same machine within this many minutes is a repeat.
    pub repeat_window_minutes: i64,
    pub top_problems: usize,
}

impl Default for BreakdownConfig {
    fn default() -> Self {
        Self {
            pareto_threshold_pct: 80.0,
            related_factors: 3,
            repeat_window_minutes: 120,
            top_problems: 5,
        }
    }
}

// ---------------------------------------------------------------------------
// Evaluation
// ---------------------------------------------------------------------------

/// Decision table thresholds for end-of-period task evaluation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EvaluationConfig {
    /// Improvement (percent) that closes a task when the trend agrees.
    pub target_improvement_pct: f64,
    /// Improvement (percent) that earns another monitoring cycle.
    pub partial_improvement_pct: f64,
    /// Extensions allowed before the task is escalated to review.
    pub max_extensions: u32,
    /// Length of one monitoring extension.
    pub cycle_days: i64,
}

impl Default for EvaluationConfig {
    fn default() -> Self {
        Self {
            target_improvement_pct: 15.0,
            partial_improvement_pct: 5.0,
            max_extensions: 3,
            cycle_days: 14,
        }
    }
}

// ---------------------------------------------------------------------------
// Notifications
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NotificationConfig {
    /// Manager addresses, included on every notification.
    pub manager_recipients: Vec<String>,
    /// When set, notifications are POSTed here as JSON. Otherwise they are logged.
    pub webhook_url: Option<String>,
    pub timeout_secs: u64,
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            manager_recipients: vec!["maintenance-manager@localhost".into()],
            webhook_url: None,
            timeout_secs: 10,
        }
    }
}

// ---------------------------------------------------------------------------
// Schedule
// ---------------------------------------------------------------------------

/// Cron expressions (seconds-first, as accepted by the `cron` crate) for the daemon.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScheduleConfig {
    pub daily: String,
    pub weekly: String,
    pub evaluation: String,
    /// How often the daemon checks for due runs.
    pub poll_secs: u64,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            daily: "0 0 6 * * *".into(),
            weekly: "0 0 6 * * Mon".into(),
            evaluation: "0 30 6 * * *".into(),
            poll_secs: 30,
        }
    }
}

// ---------------------------------------------------------------------------
// Logging
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter directive. `RUST_LOG` wins when set.
    pub level: String,
    /// Emit JSON lines instead of human-readable output.
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            json: false,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
