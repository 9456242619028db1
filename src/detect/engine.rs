use std::sync::Arc;

use chrono::{NaiveDate, NaiveTime, TimeZone, Utc};
use serde::Serialize;
use thiserror::Error;
use tracing::{error, info, warn};

use super::classifier::{Classifier, RunContext};
use super::{FindingFilter, TimeDimension, TimeSeriesFinding};
use crate::analysis::patterns::{compare_buckets, PATTERN_SPECS};
use crate::config::{PatternConfig, TrackerConfig};
use crate::model::{AnalysisRun, IncidentFilter, IncidentRecord, RunStatus};
use crate::notify::Dispatcher;
use crate::storage::{Store, StoreError};

#[derive(Debug, Error)]
pub enum DetectError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("invalid analysis window: {start} is after {end}")]
    InvalidWindow { start: NaiveDate, end: NaiveDate },

    #[error("{dimension} analysis ran {days_since} day(s) ago; at least {min_days} days must pass (use --force to override)")]
    TooSoon {
        dimension: TimeDimension,
        days_since: i64,
        min_days: i64,
    },
}

/// One pattern analysis invocation. `end` is inclusive.
#[derive(Debug, Clone, PartialEq)]
pub struct AnalysisRequest {
    pub start: NaiveDate,
    pub end: NaiveDate,
    /// `None` analyzes every dimension.
    pub dimension: Option<TimeDimension>,
    pub force: bool,
    /// Reuse a run id; a fresh one is generated otherwise.
    pub run_id: Option<String>,
}

impl AnalysisRequest {
    pub fn new(start: NaiveDate, end: NaiveDate) -> Self {
        Self {
            start,
            end,
            dimension: None,
            force: false,
            run_id: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DimensionReport {
    pub dimension: TimeDimension,
    pub comparisons: usize,
    pub flagged: usize,
    pub inserted: usize,
    pub duplicates: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SkippedDimension {
    pub dimension: TimeDimension,
    pub days_since: i64,
    pub last_run_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AnalysisReport {
    pub run_id: String,
    pub period_start: NaiveDate,
    pub period_end: NaiveDate,
    pub incidents: usize,
    pub dimensions: Vec<DimensionReport>,
    pub skipped: Vec<SkippedDimension>,
    /// Every finding stored for this run.
    pub findings: Vec<TimeSeriesFinding>,
}

/// Buckets closed incidents, classifies deviations and stores findings.
pub struct PatternEngine {
    store: Arc<dyn Store>,
    dispatcher: Dispatcher,
    classifier: Classifier,
    patterns: PatternConfig,
    min_bucket_incidents: usize,
}

impl PatternEngine {
    pub fn new(store: Arc<dyn Store>, config: &TrackerConfig, dispatcher: Dispatcher) -> Self {
        Self {
            store,
            dispatcher,
            classifier: Classifier::new(&config.classifier),
            patterns: config.patterns.clone(),
            min_bucket_incidents: config.classifier.min_bucket_incidents,
        }
    }

    pub async fn run(&self, req: &AnalysisRequest) -> Result<AnalysisReport, DetectError> {
        if req.start > req.end {
            return Err(DetectError::InvalidWindow {
                start: req.start,
                end: req.end,
            });
        }
        let run = RunContext {
            run_id: req
                .run_id
                .clone()
                .unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
            period_start: req.start,
            period_end: req.end,
        };
        let requested: Vec<TimeDimension> = match req.dimension {
            Some(d) => vec![d],
            None => TimeDimension::ALL.to_vec(),
        };

        let (due, skipped) = self.due_dimensions(&requested, req.force)?;
        if due.is_empty() {
            if let Some(first) = skipped.first() {
                return Err(DetectError::TooSoon {
                    dimension: first.dimension,
                    days_since: first.days_since,
                    min_days: self.patterns.min_days_between_runs,
                });
            }
        }

        let incidents = self.closed_incidents(req.start, req.end)?;
        info!(
            run_id = %run.run_id,
            start = %req.start,
            end = %req.end,
            incidents = incidents.len(),
            dimensions = due.len(),
            forced = req.force,
            "pattern analysis started"
        );

        let mut dimensions = Vec::with_capacity(due.len());
        for dimension in due {
            let started_at = Utc::now();
            let mut record = AnalysisRun {
                run_id: run.run_id.clone(),
                dimension,
                period_start: req.start,
                period_end: req.end,
                status: RunStatus::Running,
                forced: req.force,
                findings_count: 0,
                started_at,
                finished_at: None,
            };
            self.store.record_analysis_run(&record)?;

            match self.analyze_dimension(dimension, &incidents, &run) {
                Ok(report) => {
                    record.status = RunStatus::Completed;
                    record.findings_count = report.flagged;
                    record.finished_at = Some(Utc::now());
                    self.store.record_analysis_run(&record)?;
                    info!(
                        run_id = %run.run_id,
                        dimension = %dimension,
                        flagged = report.flagged,
                        inserted = report.inserted,
                        duplicates = report.duplicates,
                        "dimension analyzed"
                    );
                    dimensions.push(report);
                }
                Err(e) => {
                    error!(run_id = %run.run_id, dimension = %dimension, error = %e, "dimension analysis failed");
                    record.status = RunStatus::Failed;
                    record.finished_at = Some(Utc::now());
                    if let Err(mark) = self.store.record_analysis_run(&record) {
                        warn!(run_id = %run.run_id, error = %mark, "could not mark analysis run failed");
                    }
                    return Err(e.into());
                }
            }
        }

        let findings = self.store.findings(&FindingFilter {
            run_id: Some(run.run_id.clone()),
            ..FindingFilter::default()
        })?;
        let report = AnalysisReport {
            run_id: run.run_id,
            period_start: req.start,
            period_end: req.end,
            incidents: incidents.len(),
            dimensions,
            skipped,
            findings,
        };

        let status = self.dispatcher.notify_analysis(&report).await?;
        info!(
            run_id = %report.run_id,
            findings = report.findings.len(),
            notification = %status,
            "pattern analysis complete"
        );
        Ok(report)
    }

    /// Split `requested` into dimensions to run now and those analyzed too
    /// recently.
    fn due_dimensions(
        &self,
        requested: &[TimeDimension],
        force: bool,
    ) -> Result<(Vec<TimeDimension>, Vec<SkippedDimension>), StoreError> {
        let today = Utc::now().date_naive();
        let mut due = Vec::new();
        let mut skipped = Vec::new();
        for &dimension in requested {
            if force {
                due.push(dimension);
                continue;
            }
            match self.store.last_analysis_run(dimension)? {
                Some(last) => {
                    let days_since = (today - last.started_at.date_naive()).num_days();
                    if days_since < self.patterns.min_days_between_runs {
                        info!(
                            dimension = %dimension,
                            days_since,
                            last_run_id = %last.run_id,
                            "dimension analyzed recently, skipping"
                        );
                        skipped.push(SkippedDimension {
                            dimension,
                            days_since,
                            last_run_id: last.run_id,
                        });
                    } else {
                        due.push(dimension);
                    }
                }
                None => due.push(dimension),
            }
        }
        Ok((due, skipped))
    }

    fn closed_incidents(&self, start: NaiveDate, end: NaiveDate) -> Result<Vec<IncidentRecord>, StoreError> {
        let from = Utc.from_utc_datetime(&start.and_time(NaiveTime::MIN));
        let until = end.succ_opt().unwrap_or(end);
        let to = Utc.from_utc_datetime(&until.and_time(NaiveTime::MIN));
        self.store
            .incidents(&IncidentFilter::between(from, to).with_status("closed"))
    }

    fn analyze_dimension(
        &self,
        dimension: TimeDimension,
        incidents: &[IncidentRecord],
        run: &RunContext,
    ) -> Result<DimensionReport, StoreError> {
        let mut report = DimensionReport {
            dimension,
            comparisons: 0,
            flagged: 0,
            inserted: 0,
            duplicates: 0,
        };
        for (kind, pattern) in PATTERN_SPECS {
            let comparisons = compare_buckets(
                incidents,
                kind,
                pattern,
                dimension,
                &self.patterns,
                self.min_bucket_incidents,
            );
            report.comparisons += comparisons.len();
            for finding in self.classifier.classify_all(&comparisons, run) {
                report.flagged += 1;
                if self.store.upsert_finding(&finding)? {
                    report.inserted += 1;
                } else {
                    report.duplicates += 1;
                }
            }
        }
        Ok(report)
    }
}
