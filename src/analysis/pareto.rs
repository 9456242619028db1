//! Pareto attribution of incident minutes to categories.
//!
//! Categories are ranked by their total, and the leading categories whose
//! cumulative share stays within the threshold are the contributors. At
//! least one category is a contributor whenever the total is positive.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};

use crate::model::{labelled_enum, IncidentRecord};

/// Incident attribute a breakdown groups by.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParetoDimension {
    Machine,
    MachineType,
    Reason,
    Line,
    Mechanic,
    Product,
}

labelled_enum!(ParetoDimension, "pareto dimension", {
    Machine => "machine",
    MachineType => "machine_type",
    Reason => "reason",
    Line => "line",
    Mechanic => "mechanic",
    Product => "product",
});

impl ParetoDimension {
    pub const DEFAULT: [ParetoDimension; 4] = [
        ParetoDimension::Machine,
        ParetoDimension::Reason,
        ParetoDimension::Line,
        ParetoDimension::Product,
    ];

    /// Category of `incident`; `None` for a missing or blank attribute.
    pub fn category(self, incident: &IncidentRecord) -> Option<&str> {
        let value = match self {
            ParetoDimension::Machine => incident.machine_number.as_str(),
            ParetoDimension::MachineType => incident.machine_type.as_str(),
            ParetoDimension::Reason => incident.reason.as_str(),
            ParetoDimension::Line => incident.line.as_str(),
            ParetoDimension::Mechanic => incident.mechanic_name.as_str(),
            ParetoDimension::Product => incident.product.as_deref()?,
        };
        let value = value.trim();
        (!value.is_empty()).then_some(value)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ParetoEntry {
    pub category: String,
    pub total: f64,
    pub incidents: usize,
    pub share_pct: f64,
    pub cumulative_pct: f64,
    pub is_contributor: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ParetoBreakdown {
    pub dimension: ParetoDimension,
    pub threshold_pct: f64,
    pub total: f64,
    /// Incidents without a category for this dimension.
    pub uncategorized: usize,
    /// Ordered by total, largest first.
    pub entries: Vec<ParetoEntry>,
}

impl ParetoBreakdown {
    pub fn contributors(&self) -> impl Iterator<Item = &ParetoEntry> {
        self.entries.iter().filter(|e| e.is_contributor)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RelatedFactor {
    pub name: String,
    /// Share of the contributor's incidents, by count.
    pub share_pct: f64,
}

/// What else characterises the incidents of one contributor.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CrossPattern {
    pub dimension: ParetoDimension,
    pub category: String,
    pub related: BTreeMap<ParetoDimension, Vec<RelatedFactor>>,
}

/// Rank the categories of `dimension` by the summed `value` of their
/// incidents.
pub fn breakdown(
    incidents: &[IncidentRecord],
    dimension: ParetoDimension,
    value: impl Fn(&IncidentRecord) -> f64,
    threshold_pct: f64,
) -> ParetoBreakdown {
    let mut totals: HashMap<&str, (f64, usize)> = HashMap::new();
    let mut uncategorized = 0;
    for incident in incidents {
        let v = value(incident);
        match dimension.category(incident) {
            Some(category) if v.is_finite() => {
                let slot = totals.entry(category).or_insert((0.0, 0));
                slot.0 += v;
                slot.1 += 1;
            }
            _ => uncategorized += 1,
        }
    }

    let mut ranked: Vec<(&str, f64, usize)> =
        totals.into_iter().map(|(c, (t, n))| (c, t, n)).collect();
    ranked.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(b.0)));

    let total: f64 = ranked.iter().map(|r| r.1).sum();
    let mut cumulative = 0.0;
    let mut entries: Vec<ParetoEntry> = ranked
        .into_iter()
        .map(|(category, sum, count)| {
            cumulative += sum;
            let (share_pct, cumulative_pct) = if total > 0.0 {
                (sum / total * 100.0, cumulative / total * 100.0)
            } else {
                (0.0, 0.0)
            };
            ParetoEntry {
                category: category.to_string(),
                total: sum,
                incidents: count,
                share_pct,
                cumulative_pct,
                is_contributor: total > 0.0 && cumulative_pct <= threshold_pct + 1e-9,
            }
        })
        .collect();
    if total > 0.0 && !entries.iter().any(|e| e.is_contributor) {
        if let Some(first) = entries.first_mut() {
            first.is_contributor = true;
        }
    }

    ParetoBreakdown {
        dimension,
        threshold_pct,
        total,
        uncategorized,
        entries,
    }
}

/// The `top` most frequent categories of each of `others` among incidents
/// where `dimension` is `category`.
pub fn related_factors(
    incidents: &[IncidentRecord],
    dimension: ParetoDimension,
    category: &str,
    others: &[ParetoDimension],
    top: usize,
) -> BTreeMap<ParetoDimension, Vec<RelatedFactor>> {
    let matching: Vec<&IncidentRecord> = incidents
        .iter()
        .filter(|i| dimension.category(i) == Some(category))
        .collect();
    let mut related = BTreeMap::new();
    if matching.is_empty() {
        return related;
    }

    for other in others.iter().copied().filter(|d| *d != dimension) {
        let mut counts: HashMap<&str, usize> = HashMap::new();
        for incident in &matching {
            if let Some(c) = other.category(incident) {
                *counts.entry(c).or_default() += 1;
            }
        }
        let mut counts: Vec<(&str, usize)> = counts.into_iter().collect();
        counts.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(b.0)));
        let factors: Vec<RelatedFactor> = counts
            .into_iter()
            .take(top)
            .map(|(name, n)| RelatedFactor {
                name: name.to_string(),
                share_pct: n as f64 / matching.len() as f64 * 100.0,
            })
            .collect();
        if !factors.is_empty() {
            related.insert(other, factors);
        }
    }
    related
}

/// Related factors for every contributor of every breakdown.
pub fn cross_patterns(
    incidents: &[IncidentRecord],
    breakdowns: &[ParetoBreakdown],
    top: usize,
) -> Vec<CrossPattern> {
    let dimensions: Vec<ParetoDimension> = breakdowns.iter().map(|b| b.dimension).collect();
    breakdowns
        .iter()
        .flat_map(|b| b.contributors().map(move |e| (b.dimension, e)))
        .filter_map(|(dimension, entry)| {
            let related = related_factors(incidents, dimension, &entry.category, &dimensions, top);
            (!related.is_empty()).then(|| CrossPattern {
                dimension,
                category: entry.category.clone(),
                related,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn incident(machine: &str, reason: &str, downtime_min: i64) -> IncidentRecord {
        let ts = Utc.with_ymd_and_hms(2024, 5, 6, 9, 0, 0).unwrap();
        IncidentRecord {
            id: 0,
            created_at: ts,
            resolved_at: Some(ts),
            updated_at: ts,
            downtime_ms: downtime_min * 60_000,
            repair_ms: downtime_min * 60_000,
            response_ms: 0,
            machine_number: machine.into(),
            machine_type: "Sewing".into(),
            mechanic_id: "M-17".into(),
            mechanic_name: "Dana Ortiz".into(),
            supervisor_id: None,
            reason: reason.into(),
            status: "closed".into(),
            line: "L1".into(),
            product: None,
        }
    }

    fn plant() -> Vec<IncidentRecord> {
        vec![
            incident("SW-01", "Thread break", 300),
            incident("SW-01", "Timing", 200),
            incident("SW-02", "Thread break", 250),
            incident("SW-03", "Needle break", 150),
            incident("SW-04", "Needle break", 60),
            incident("SW-05", "Oil leak", 40),
        ]
    }

    #[test]
    fn test_breakdown_ranks_and_cuts_at_threshold() {
        let result = breakdown(
            &plant(),
            ParetoDimension::Machine,
            IncidentRecord::downtime_minutes,
            80.0,
        );
        assert_eq!(result.total, 1000.0);
        let order: Vec<&str> = result.entries.iter().map(|e| e.category.as_str()).collect();
        assert_eq!(order, ["SW-01", "SW-02", "SW-03", "SW-04", "SW-05"]);

        let first = &result.entries[0];
        assert_eq!(first.incidents, 2);
        assert!((first.share_pct - 50.0).abs() < 1e-9);
        // 50, 75, 90, 96, 100
        let contributors: Vec<&str> = result.contributors().map(|e| e.category.as_str()).collect();
        assert_eq!(contributors, ["SW-01", "SW-02"]);
        assert!((result.entries[4].cumulative_pct - 100.0).abs() < 1e-9);
    }

    #[test]
    fn test_dominant_category_is_always_a_contributor() {
        let incidents = vec![incident("SW-01", "Timing", 900), incident("SW-02", "Timing", 100)];
        let result = breakdown(
            &incidents,
            ParetoDimension::Machine,
            IncidentRecord::downtime_minutes,
            80.0,
        );
        let contributors: Vec<&str> = result.contributors().map(|e| e.category.as_str()).collect();
        assert_eq!(contributors, ["SW-01"]);
    }

    #[test]
    fn test_zero_total_has_no_contributors() {
        let incidents = vec![incident("SW-01", "Timing", 0), incident("SW-02", "Timing", 0)];
        let result = breakdown(
            &incidents,
            ParetoDimension::Machine,
            IncidentRecord::downtime_minutes,
            80.0,
        );
        assert_eq!(result.entries.len(), 2);
        assert_eq!(result.contributors().count(), 0);
    }

    #[test]
    fn test_missing_product_is_uncategorized() {
        let mut incidents = plant();
        incidents[0].product = Some("Basic T".into());
        let result = breakdown(
            &incidents,
            ParetoDimension::Product,
            IncidentRecord::downtime_minutes,
            80.0,
        );
        assert_eq!(result.uncategorized, 5);
        assert_eq!(result.entries.len(), 1);
        assert!(result.entries[0].is_contributor);
    }

    #[test]
    fn test_related_factors_for_contributor() {
        let incidents = plant();
        let related = related_factors(
            &incidents,
            ParetoDimension::Reason,
            "Thread break",
            &[ParetoDimension::Reason, ParetoDimension::Machine],
            3,
        );
        assert_eq!(related.len(), 1);
        let machines = &related[&ParetoDimension::Machine];
        assert_eq!(machines.len(), 2);
        assert_eq!(machines[0].name, "SW-01");
        assert!((machines[0].share_pct - 50.0).abs() < 1e-9);

        let breakdowns = vec![
            breakdown(&incidents, ParetoDimension::Machine, IncidentRecord::downtime_minutes, 80.0),
            breakdown(&incidents, ParetoDimension::Reason, IncidentRecord::downtime_minutes, 80.0),
        ];
        let cross = cross_patterns(&incidents, &breakdowns, 3);
        assert!(cross
            .iter()
            .any(|p| p.dimension == ParetoDimension::Machine && p.category == "SW-01"));
        let sw01 = cross.iter().find(|p| p.category == "SW-01").unwrap();
        let reasons: Vec<&str> = sw01.related[&ParetoDimension::Reason]
            .iter()
            .map(|f| f.name.as_str())
            .collect();
        assert_eq!(reasons, ["Thread break", "Timing"]);
    }
}
