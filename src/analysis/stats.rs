//! Pure statistics: aggregates, baseline comparisons, OLS trend, moving
//! averages and a pooled two-sample t-test.

use serde::{Deserialize, Serialize};
use statrs::distribution::{ContinuousCDF, StudentsT};

use super::{AnalysisError, AnalysisResult};

/// Standard deviations at or below this are treated as zero.
const MIN_STD_DEV: f64 = 1e-9;

/// Slopes smaller than this in magnitude count as flat.
const FLAT_SLOPE: f64 = 1e-12;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Aggregate {
    pub mean: f64,
    pub median: f64,
    pub count: usize,
    pub std_dev: f64,
}

/// Mean, median, count and sample standard deviation of `values`.
///
/// Fails with [`AnalysisError::InsufficientData`] when fewer than
/// `min_samples` values are present (an empty slice always fails).
pub fn aggregate(values: &[f64], min_samples: usize) -> AnalysisResult<Aggregate> {
    let needed = min_samples.max(1);
    if values.len() < needed {
        return Err(AnalysisError::InsufficientData {
            needed,
            have: values.len(),
        });
    }
    if let Some(bad) = values.iter().find(|v| !v.is_finite()) {
        return Err(AnalysisError::Computation(format!(
            "non-finite value in sample: {bad}"
        )));
    }

    let count = values.len();
    let mean = values.iter().sum::<f64>() / count as f64;

    let variance = if count > 1 {
        values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (count - 1) as f64
    } else {
        0.0
    };

    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    let median = if count % 2 == 0 {
        (sorted[count / 2 - 1] + sorted[count / 2]) / 2.0
    } else {
        sorted[count / 2]
    };

    Ok(Aggregate {
        mean,
        median,
        count,
        std_dev: variance.sqrt(),
    })
}

// ---------------------------------------------------------------------------
// Comparison
// ---------------------------------------------------------------------------

/// A z-score, or the sentinel for a baseline with no spread.
///
/// Serializes as a number, or as the string `"undefined"`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "ZScoreRepr", into = "ZScoreRepr")]
pub enum ZScore {
    Defined(f64),
    Undefined,
}

#[derive(Serialize, Deserialize)]
#[serde(untagged)]
enum ZScoreRepr {
    Value(f64),
    Label(String),
}

impl From<ZScore> for ZScoreRepr {
    fn from(z: ZScore) -> Self {
        match z {
            ZScore::Defined(v) => ZScoreRepr::Value(v),
            ZScore::Undefined => ZScoreRepr::Label("undefined".into()),
        }
    }
}

impl TryFrom<ZScoreRepr> for ZScore {
    type Error = String;

    fn try_from(repr: ZScoreRepr) -> Result<Self, Self::Error> {
        match repr {
            ZScoreRepr::Value(v) => Ok(ZScore::Defined(v)),
            ZScoreRepr::Label(s) if s == "undefined" => Ok(ZScore::Undefined),
            ZScoreRepr::Label(s) => Err(format!("invalid z-score '{s}'")),
        }
    }
}

impl ZScore {
    pub fn value(self) -> Option<f64> {
        match self {
            ZScore::Defined(v) => Some(v),
            ZScore::Undefined => None,
        }
    }

    /// Whether `|z| >= threshold`. An undefined z-score only satisfies
    /// thresholds that do not require any deviation.
    pub fn meets(self, threshold: f64) -> bool {
        match self {
            ZScore::Defined(v) => v.abs() >= threshold,
            ZScore::Undefined => threshold <= 0.0,
        }
    }
}

impl std::fmt::Display for ZScore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ZScore::Defined(v) => write!(f, "{v:.2}"),
            ZScore::Undefined => write!(f, "undefined"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Comparison {
    pub entity_mean: f64,
    pub baseline_mean: f64,
    pub z_score: ZScore,
    /// `None` when the baseline mean is zero.
    pub percent_diff: Option<f64>,
}

/// Compare an entity aggregate against a baseline aggregate.
pub fn compare(entity: &Aggregate, baseline: &Aggregate) -> Comparison {
    compare_mean(entity.mean, baseline)
}

/// Compare a single mean (or value) against a baseline aggregate.
pub fn compare_mean(entity_mean: f64, baseline: &Aggregate) -> Comparison {
    let z_score = if baseline.std_dev > MIN_STD_DEV {
        ZScore::Defined((entity_mean - baseline.mean) / baseline.std_dev)
    } else {
        ZScore::Undefined
    };
    Comparison {
        entity_mean,
        baseline_mean: baseline.mean,
        z_score,
        percent_diff: percentage_change(baseline.mean, entity_mean),
    }
}

/// `(latest - baseline) / baseline * 100`, or `None` for a zero baseline.
pub fn percentage_change(baseline: f64, latest: f64) -> Option<f64> {
    if baseline.abs() < f64::EPSILON {
        None
    } else {
        Some((latest - baseline) / baseline * 100.0)
    }
}

// ---------------------------------------------------------------------------
// Trend
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrendDirection {
    Increasing,
    Decreasing,
    Flat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrendStrength {
    Strong,
    Moderate,
    Weak,
}

impl TrendStrength {
    fn from_r_squared(r_squared: f64) -> Self {
        if r_squared >= 0.7 {
            TrendStrength::Strong
        } else if r_squared >= 0.3 {
            TrendStrength::Moderate
        } else {
            TrendStrength::Weak
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Trend {
    pub slope: f64,
    pub intercept: f64,
    pub r_squared: f64,
    pub p_value: f64,
    pub is_significant: bool,
    pub direction: TrendDirection,
    pub strength: TrendStrength,
}

impl Trend {
    /// Human-readable label, e.g. "strong decreasing trend (significant)".
    pub fn describe(&self) -> String {
        let strength = match self.strength {
            TrendStrength::Strong => "strong",
            TrendStrength::Moderate => "moderate",
            TrendStrength::Weak => "weak",
        };
        let direction = match self.direction {
            TrendDirection::Increasing => "increasing",
            TrendDirection::Decreasing => "decreasing",
            TrendDirection::Flat => "flat",
        };
        let significance = if self.is_significant {
            "significant"
        } else {
            "not significant"
        };
        format!("{strength} {direction} trend ({significance}, p={:.3})", self.p_value)
    }
}

/// Ordinary least squares of `series` against its index `0..n`, with a
/// two-tailed t-test on the slope (`n - 2` degrees of freedom).
pub fn trend(series: &[f64], alpha: f64) -> AnalysisResult<Trend> {
    let n = series.len();
    if n < 3 {
        return Err(AnalysisError::InsufficientData { needed: 3, have: n });
    }
    if series.iter().any(|v| !v.is_finite()) {
        return Err(AnalysisError::Computation(
            "non-finite value in trend series".into(),
        ));
    }

    let nf = n as f64;
    let x_mean = (nf - 1.0) / 2.0;
    let y_mean = series.iter().sum::<f64>() / nf;

    let mut sxx = 0.0;
    let mut sxy = 0.0;
    let mut syy = 0.0;
    for (i, y) in series.iter().enumerate() {
        let dx = i as f64 - x_mean;
        let dy = y - y_mean;
        sxx += dx * dx;
        sxy += dx * dy;
        syy += dy * dy;
    }

    if syy <= MIN_STD_DEV {
        return Ok(Trend {
            slope: 0.0,
            intercept: y_mean,
            r_squared: 0.0,
            p_value: 1.0,
            is_significant: false,
            direction: TrendDirection::Flat,
            strength: TrendStrength::Weak,
        });
    }

    let slope = sxy / sxx;
    let intercept = y_mean - slope * x_mean;
    let r_squared = ((sxy * sxy) / (sxx * syy)).clamp(0.0, 1.0);

    let df = nf - 2.0;
    let sse = (syy - slope * sxy).max(0.0);
    let std_err = (sse / df / sxx).sqrt();

    let p_value = if std_err <= MIN_STD_DEV {
        if slope.abs() > FLAT_SLOPE {
            0.0
        } else {
            1.0
        }
    } else {
        two_tailed_p(slope / std_err, df)?
    };

    let direction = if slope.abs() <= FLAT_SLOPE {
        TrendDirection::Flat
    } else if slope > 0.0 {
        TrendDirection::Increasing
    } else {
        TrendDirection::Decreasing
    };

    Ok(Trend {
        slope,
        intercept,
        r_squared,
        p_value,
        is_significant: p_value <= alpha,
        direction,
        strength: TrendStrength::from_r_squared(r_squared),
    })
}

fn two_tailed_p(t: f64, df: f64) -> AnalysisResult<f64> {
    let dist = StudentsT::new(0.0, 1.0, df)
        .map_err(|e| AnalysisError::Computation(format!("t-distribution (df={df}): {e}")))?;
    Ok((2.0 * (1.0 - dist.cdf(t.abs()))).clamp(0.0, 1.0))
}

// ---------------------------------------------------------------------------
// Moving average and period changes
// ---------------------------------------------------------------------------

/// Trailing moving average. The output has the same length as the input;
/// positions without a full window are `None`.
pub fn moving_average(series: &[f64], window: usize) -> AnalysisResult<Vec<Option<f64>>> {
    if window == 0 {
        return Err(AnalysisError::Computation(
            "moving average window must be at least 1".into(),
        ));
    }
    let mut out = Vec::with_capacity(series.len());
    let mut running = 0.0;
    for (i, v) in series.iter().enumerate() {
        running += v;
        if i >= window {
            running -= series[i - window];
        }
        if i + 1 >= window {
            out.push(Some(running / window as f64));
        } else {
            out.push(None);
        }
    }
    Ok(out)
}

/// Percentage change between each consecutive pair.
pub fn period_changes(series: &[f64]) -> Vec<Option<f64>> {
    series
        .windows(2)
        .map(|pair| percentage_change(pair[0], pair[1]))
        .collect()
}

// ---------------------------------------------------------------------------
// Two-sample test
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TwoSampleTest {
    pub first_mean: f64,
    pub second_mean: f64,
    /// `None` when both samples have zero spread.
    pub t_statistic: Option<f64>,
    pub p_value: f64,
    pub is_significant: bool,
    /// `(1 - p) * 100`.
    pub confidence_pct: f64,
}

/// Pooled-variance Student t-test between two samples.
pub fn two_sample_test(first: &[f64], second: &[f64], alpha: f64) -> AnalysisResult<TwoSampleTest> {
    let have = first.len().min(second.len());
    if have < 2 {
        return Err(AnalysisError::InsufficientData { needed: 2, have });
    }
    let a = aggregate(first, 2)?;
    let b = aggregate(second, 2)?;

    let n1 = a.count as f64;
    let n2 = b.count as f64;
    let df = n1 + n2 - 2.0;
    let pooled = ((n1 - 1.0) * a.std_dev.powi(2) + (n2 - 1.0) * b.std_dev.powi(2)) / df;
    let std_err = (pooled * (1.0 / n1 + 1.0 / n2)).sqrt();

    let (t_statistic, p_value) = if std_err <= MIN_STD_DEV {
        let p = if (a.mean - b.mean).abs() <= MIN_STD_DEV {
            1.0
        } else {
            0.0
        };
        (None, p)
    } else {
        let t = (a.mean - b.mean) / std_err;
        (Some(t), two_tailed_p(t, df)?)
    };

    Ok(TwoSampleTest {
        first_mean: a.mean,
        second_mean: b.mean,
        t_statistic,
        p_value,
        is_significant: p_value <= alpha,
        confidence_pct: (1.0 - p_value) * 100.0,
    })
}

/// Compare the first half of a series against the second half.
/// Needs at least four values.
pub fn halves_test(series: &[f64], alpha: f64) -> AnalysisResult<TwoSampleTest> {
    if series.len() < 4 {
        return Err(AnalysisError::InsufficientData {
            needed: 4,
            have: series.len(),
        });
    }
    let (first, second) = series.split_at(series.len() / 2);
    two_sample_test(first, second, alpha)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
