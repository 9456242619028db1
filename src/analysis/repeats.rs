//! Repeat failures: a machine failing again shortly after an incident.

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

use crate::model::IncidentRecord;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RepeatIncident {
    pub incident_id: i64,
    pub created_at: DateTime<Utc>,
    pub reason: String,
    pub mechanic_id: String,
    pub minutes_since_initial: f64,
}

/// An incident followed by one or more failures of the same machine.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RepeatFailure {
    pub machine_number: String,
    pub initial_incident_id: i64,
    pub initial_at: DateTime<Utc>,
    pub initial_reason: String,
    pub repeats: Vec<RepeatIncident>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RepeatCount {
    pub key: String,
    pub count: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RepeatReport {
    pub window_minutes: i64,
    pub repeat_failures: Vec<RepeatFailure>,
    /// Initial incidents with repeats, per machine.
    pub by_machine: Vec<RepeatCount>,
    /// Repeat incidents attended, per mechanic.
    pub by_mechanic: Vec<RepeatCount>,
    pub common_problems: Vec<RepeatCount>,
    pub explanation: String,
}

/// Find every failure of a machine within `window_minutes` after an earlier
/// failure of the same machine. A repeat that falls inside the windows of
/// several earlier incidents is listed under each of them.
pub fn find_repeats(
    incidents: &[IncidentRecord],
    window_minutes: i64,
    top_problems: usize,
) -> RepeatReport {
    let window = Duration::minutes(window_minutes);
    let mut per_machine: BTreeMap<&str, Vec<&IncidentRecord>> = BTreeMap::new();
    for incident in incidents {
        per_machine
            .entry(incident.machine_number.as_str())
            .or_default()
            .push(incident);
    }

    let mut repeat_failures = Vec::new();
    let mut machines: HashMap<&str, usize> = HashMap::new();
    let mut mechanics: HashMap<&str, usize> = HashMap::new();
    let mut problems: HashMap<&str, usize> = HashMap::new();

    for (machine, mut history) in per_machine {
        history.sort_by_key(|i| (i.created_at, i.id));
        for (pos, initial) in history.iter().enumerate() {
            let cutoff = initial.created_at + window;
            let repeats: Vec<RepeatIncident> = history[pos + 1..]
                .iter()
                .take_while(|later| later.created_at <= cutoff)
                .filter(|later| later.created_at > initial.created_at)
                .map(|later| {
                    *mechanics.entry(later.mechanic_id.as_str()).or_default() += 1;
                    *problems.entry(later.reason.as_str()).or_default() += 1;
                    RepeatIncident {
                        incident_id: later.id,
                        created_at: later.created_at,
                        reason: later.reason.clone(),
                        mechanic_id: later.mechanic_id.clone(),
                        minutes_since_initial: (later.created_at - initial.created_at)
                            .num_seconds() as f64
                            / 60.0,
                    }
                })
                .collect();
            if repeats.is_empty() {
                continue;
            }
            *machines.entry(machine).or_default() += 1;
            repeat_failures.push(RepeatFailure {
                machine_number: machine.to_string(),
                initial_incident_id: initial.id,
                initial_at: initial.created_at,
                initial_reason: initial.reason.clone(),
                repeats,
            });
        }
    }

    let mut common_problems = ranked(problems);
    common_problems.truncate(top_problems);
    let explanation = match common_problems.first() {
        None => format!("No repeat failures found within {window_minutes} minutes."),
        Some(top) => format!(
            "Found {} repeat failures within {window_minutes} minutes. Most common problem: {} ({} occurrences).",
            repeat_failures.len(),
            top.key,
            top.count
        ),
    };

    RepeatReport {
        window_minutes,
        repeat_failures,
        by_machine: ranked(machines),
        by_mechanic: ranked(mechanics),
        common_problems,
        explanation,
    }
}

/// Highest count first, ties by key.
fn ranked(counts: HashMap<&str, usize>) -> Vec<RepeatCount> {
    let mut out: Vec<RepeatCount> = counts
        .into_iter()
        .map(|(key, count)| RepeatCount {
            key: key.to_string(),
            count,
        })
        .collect();
    out.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.key.cmp(&b.key)));
    out
}
