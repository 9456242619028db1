use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

const MS_PER_MINUTE: f64 = 60_000.0;

/// One repair/maintenance incident as recorded by the plant system.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IncidentRecord {
    /// Store-assigned id; ignored on insert.
    #[serde(default)]
    pub id: i64,
    pub created_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
    pub downtime_ms: i64,
    pub repair_ms: i64,
    pub response_ms: i64,
    pub machine_number: String,
    pub machine_type: String,
    pub mechanic_id: String,
    pub mechanic_name: String,
    pub supervisor_id: Option<String>,
    pub reason: String,
    pub status: String,
    pub line: String,
    pub product: Option<String>,
}

impl IncidentRecord {
    pub fn response_minutes(&self) -> f64 {
        self.response_ms as f64 / MS_PER_MINUTE
    }

    pub fn repair_minutes(&self) -> f64 {
        self.repair_ms as f64 / MS_PER_MINUTE
    }

    pub fn downtime_minutes(&self) -> f64 {
        self.downtime_ms as f64 / MS_PER_MINUTE
    }

    pub fn is_closed(&self) -> bool {
        self.status.eq_ignore_ascii_case("closed")
    }
}

/// Filter for incident reads. Unset fields match everything; the time
/// range is half-open on `created_at`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IncidentFilter {
    pub mechanic_id: Option<String>,
    pub machine_number: Option<String>,
    pub machine_type: Option<String>,
    pub reason: Option<String>,
    pub line: Option<String>,
    pub status: Option<String>,
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
}

impl IncidentFilter {
    pub fn between(from: DateTime<Utc>, to: DateTime<Utc>) -> Self {
        Self {
            from: Some(from),
            to: Some(to),
            ..Self::default()
        }
    }

    pub fn with_mechanic(mut self, mechanic_id: impl Into<String>) -> Self {
        self.mechanic_id = Some(mechanic_id.into());
        self
    }

    pub fn with_machine_type(mut self, machine_type: impl Into<String>) -> Self {
        self.machine_type = Some(machine_type.into());
        self
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    pub fn with_status(mut self, status: impl Into<String>) -> Self {
        self.status = Some(status.into());
        self
    }
}
