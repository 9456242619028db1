//! Pattern detection: severity classification of bucketed comparisons and
//! the time-series findings it produces.

pub mod classifier;
pub mod engine;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::analysis::stats::ZScore;
use crate::model::{labelled_enum, EntityKind};

/// Severity tiers for flagged deviations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
}

labelled_enum!(Severity, "severity", {
    Low => "low",
    Medium => "medium",
    High => "high",
});

/// How incidents are bucketed in time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeDimension {
    DayOfWeek,
    Hour,
    Shift,
}

labelled_enum!(TimeDimension, "time dimension", {
    DayOfWeek => "day_of_week",
    Hour => "hour",
    Shift => "shift",
});

impl TimeDimension {
    pub const ALL: [TimeDimension; 3] = [
        TimeDimension::DayOfWeek,
        TimeDimension::Hour,
        TimeDimension::Shift,
    ];
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PatternType {
    ResponseTime,
    RepairTime,
    /// Downtime volume per line.
    Volume,
    IncidentCount,
}

labelled_enum!(PatternType, "pattern type", {
    ResponseTime => "response_time",
    RepairTime => "repair_time",
    Volume => "volume",
    IncidentCount => "incident_count",
});

impl PatternType {
    pub fn unit(self) -> &'static str {
        match self {
            PatternType::ResponseTime | PatternType::RepairTime | PatternType::Volume => "min",
            PatternType::IncidentCount => "incidents",
        }
    }

    fn noun(self) -> &'static str {
        match self {
            PatternType::ResponseTime => "response time",
            PatternType::RepairTime => "repair time",
            PatternType::Volume => "downtime",
            PatternType::IncidentCount => "incident volume",
        }
    }
}

/// Named figures behind a finding. Everything a reader needs to explain
/// the flag lives here.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct FindingContext {
    /// Entity mean inside the flagged bucket.
    pub flagged_avg: f64,
    /// Entity mean across all buckets.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub normal_avg: Option<f64>,
    /// Team mean inside the flagged bucket.
    pub team_avg: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub variance_vs_normal: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub variance_vs_team: Option<f64>,
    pub z_score: Option<ZScore>,
    pub incident_count: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub flagged_incidents: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub average_incidents: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub percentage_of_total: Option<f64>,
}

/// A flagged time-based pattern for one entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeSeriesFinding {
    #[serde(default)]
    pub id: i64,
    pub run_id: String,
    pub entity_kind: EntityKind,
    /// `"overall"` for plant-wide findings.
    pub entity_id: String,
    pub entity_name: String,
    pub pattern: PatternType,
    pub dimension: TimeDimension,
    pub time_value: String,
    pub severity: Severity,
    pub description: String,
    pub context: FindingContext,
    pub period_start: NaiveDate,
    pub period_end: NaiveDate,
    pub created_at: DateTime<Utc>,
}

impl TimeSeriesFinding {
    /// One self-contained sentence built only from the stored context.
    pub fn explain(&self) -> String {
        let ctx = &self.context;
        let unit = self.pattern.unit();
        let who = match self.entity_kind {
            EntityKind::Overall => "Plant-wide".to_string(),
            kind => format!("{} {}", capitalize(kind.as_str()), self.entity_name),
        };
        let when = match self.dimension {
            TimeDimension::DayOfWeek => format!("on {}", self.time_value),
            TimeDimension::Hour => format!("during {}", self.time_value),
            TimeDimension::Shift => format!("on the {} shift", self.time_value),
        };

        let mut figures = Vec::with_capacity(2);
        if let Some(v) = ctx.variance_vs_team {
            figures.push(format!("{v:+.0}%"));
        }
        figures.push(match ctx.z_score {
            Some(ZScore::Defined(z)) => format!("z={z:.2}"),
            Some(ZScore::Undefined) | None => "z=undefined".to_string(),
        });

        let mut sentence = format!(
            "{who} {noun} {when} averaged {flagged:.1} {unit} vs a team average of {team:.1} {unit} ({figures})",
            noun = self.pattern.noun(),
            flagged = ctx.flagged_avg,
            team = ctx.team_avg,
            figures = figures.join(", "),
        );
        if let (Some(normal), Some(v)) = (ctx.normal_avg, ctx.variance_vs_normal) {
            sentence.push_str(&format!(
                "; their usual average is {normal:.1} {unit} ({v:+.0}%)"
            ));
        }
        sentence.push_str(&format!(
            " across {} incident{}. Severity: {}.",
            ctx.incident_count,
            if ctx.incident_count == 1 { "" } else { "s" },
            self.severity
        ));
        sentence
    }
}

fn capitalize(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

/// Filter for finding reads. Unset fields match everything.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FindingFilter {
    pub run_id: Option<String>,
    pub entity_kind: Option<EntityKind>,
    pub entity_id: Option<String>,
    pub pattern: Option<PatternType>,
    pub dimension: Option<TimeDimension>,
    pub min_severity: Option<Severity>,
}
