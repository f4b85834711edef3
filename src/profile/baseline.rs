//! Streaming per-metric baselines.
//!
//! Welford's algorithm keeps the running mean/variance numerically stable
//! without retaining the full history; a second Welford pass over squared
//! deviations tracks dispersion instability (variance-of-variance), which
//! feeds the confidence discount for erratic baselines.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ring::SampleRing;

/// Dispersion above this ratio of what a well-behaved (Gaussian) metric
/// would show starts costing confidence.
const NOMINAL_INSTABILITY: f64 = 1.5;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricBaseline {
    count: u64,
    mean: f64,
    m2: f64,
    // Welford over (x - mean)^2, for variance-of-variance.
    disp_count: u64,
    disp_mean: f64,
    disp_m2: f64,
    history: SampleRing,
    pub last_updated: DateTime<Utc>,
}

impl MetricBaseline {
    pub fn new(history_capacity: usize, now: DateTime<Utc>) -> Self {
        Self {
            count: 0,
            mean: 0.0,
            m2: 0.0,
            disp_count: 0,
            disp_mean: 0.0,
            disp_m2: 0.0,
            history: SampleRing::new(history_capacity),
            last_updated: now,
        }
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn mean(&self) -> f64 {
        self.mean
    }

    /// Sample variance (n-1 denominator).
    pub fn variance(&self) -> f64 {
        if self.count < 2 {
            return 0.0;
        }
        self.m2 / (self.count - 1) as f64
    }

    pub fn std_dev(&self) -> f64 {
        self.variance().sqrt()
    }

    /// Stability in (0, 1]: 1.0 for dispersion at or below what a
    /// well-behaved metric shows, shrinking as the variance of the squared
    /// deviations grows past that.
    pub fn stability(&self) -> f64 {
        if self.disp_count < 2 {
            return 1.0;
        }
        let disp_var = self.disp_m2 / (self.disp_count - 1) as f64;
        let variance = self.variance();
        if variance <= f64::EPSILON {
            return 1.0;
        }
        let instability = disp_var.sqrt() / variance;
        let excess = (instability - NOMINAL_INSTABILITY).max(0.0);
        1.0 / (1.0 + excess)
    }

    pub fn history(&self) -> &SampleRing {
        &self.history
    }

    /// Fold one observation into the baseline.
    pub fn update(&mut self, value: f64, ts: DateTime<Utc>) {
        // Squared deviation against the pre-update mean feeds the
        // dispersion tracker; only meaningful once a mean exists.
        if self.count > 0 {
            let sq_dev = (value - self.mean).powi(2);
            self.disp_count += 1;
            let delta = sq_dev - self.disp_mean;
            self.disp_mean += delta / self.disp_count as f64;
            self.disp_m2 += delta * (sq_dev - self.disp_mean);
        }

        self.count += 1;
        let delta = value - self.mean;
        self.mean += delta / self.count as f64;
        self.m2 += delta * (value - self.mean);

        self.history.push(value, ts);
        self.last_updated = ts;
    }
}

/// Immutable pre-update view of one metric's baseline, handed to the
/// detectors so they always compare against a consistent state.
#[derive(Debug, Clone)]
pub struct BaselineSnapshot {
    pub metric: String,
    pub sample_count: u64,
    pub mean: f64,
    pub std_dev: f64,
    pub stability: f64,
    pub immature: bool,
    /// Chronological copy of the bounded history, oldest first.
    pub history: Vec<(f64, DateTime<Utc>)>,
}

impl BaselineSnapshot {
    /// Snapshot for a metric with no observations yet.
    pub fn empty(metric: &str) -> Self {
        Self {
            metric: metric.to_string(),
            sample_count: 0,
            mean: 0.0,
            std_dev: 0.0,
            stability: 1.0,
            immature: true,
            history: Vec::new(),
        }
    }

    /// Local confidence for a candidate built against this baseline:
    /// grows with sample count, discounted for unstable dispersion.
    pub fn confidence(&self, min_samples: usize) -> f64 {
        let maturity = (self.sample_count as f64 / (3.0 * min_samples.max(1) as f64)).min(1.0);
        maturity * (0.5 + 0.5 * self.stability)
    }

    /// Z-score of `value` against this baseline. Degenerate (zero-variance)
    /// baselines report infinite deviation for any difference.
    pub fn z_score(&self, value: f64) -> f64 {
        if self.std_dev <= f64::EPSILON {
            if (value - self.mean).abs() > f64::EPSILON && self.sample_count > 0 {
                return f64::INFINITY;
            }
            return 0.0;
        }
        (value - self.mean) / self.std_dev
    }

    /// Value at `pct` (0..1) of the historical distribution, by sorted rank.
    pub fn percentile(&self, pct: f64) -> Option<f64> {
        if self.history.is_empty() {
            return None;
        }
        let mut values: Vec<f64> = self.history.iter().map(|(v, _)| *v).collect();
        values.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        let rank = ((values.len() as f64 - 1.0) * pct.clamp(0.0, 1.0)).round() as usize;
        values.get(rank).copied()
    }
}
