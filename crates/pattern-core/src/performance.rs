//! Per-variant performance metrics computed from resolved predictions.

use serde::{Deserialize, Serialize};

use crate::stats::{max_drawdown_pct, mean, sharpe_like};
use crate::types::PredictionRecord;

/// Chronological buckets used to measure hit-rate stability.
const STABILITY_BUCKETS: usize = 4;
/// Below this many predictions stability is not measurable and reported as 1.0.
const STABILITY_MIN_RECORDS: usize = 2 * STABILITY_BUCKETS;

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct PerformanceMetrics {
    pub predictions: usize,
    /// Fraction of predictions whose pattern played out.
    pub pattern_match_rate: f64,
    pub sharpe_like: f64,
    /// Mean realized return per prediction, percent.
    pub expectancy: f64,
    /// Peak-to-trough of cumulative realized returns, percentage points.
    pub max_drawdown: f64,
    /// 1 - 2 * std of bucketed hit rates, in [0, 1].
    pub stability: f64,
    /// Length of the trailing run of misses.
    pub consecutive_losses: usize,
    pub mean_confidence: f64,
    /// mean_confidence - pattern_match_rate. Positive means overconfident.
    pub calibration_gap: f64,
}

impl PerformanceMetrics {
    pub fn from_records(records: &[PredictionRecord]) -> Self {
        if records.is_empty() {
            return Self::default();
        }

        let mut ordered: Vec<&PredictionRecord> = records.iter().collect();
        ordered.sort_by_key(|r| r.resolved_at);

        let n = ordered.len();
        let hits: Vec<f64> = ordered.iter().map(|r| if r.hit { 1.0 } else { 0.0 }).collect();
        let returns: Vec<f64> = ordered.iter().map(|r| r.realized_return).collect();
        let confidences: Vec<f64> = ordered.iter().map(|r| r.confidence.clamp(0.0, 1.0)).collect();

        let hit_rate = mean(&hits);
        let mean_confidence = mean(&confidences);
        let consecutive_losses = ordered.iter().rev().take_while(|r| !r.hit).count();

        Self {
            predictions: n,
            pattern_match_rate: hit_rate,
            sharpe_like: sharpe_like(&returns),
            expectancy: mean(&returns),
            max_drawdown: max_drawdown_pct(&returns),
            stability: hit_rate_stability(&hits),
            consecutive_losses,
            mean_confidence,
            calibration_gap: mean_confidence - hit_rate,
        }
    }
}

fn hit_rate_stability(hits: &[f64]) -> f64 {
    if hits.len() < STABILITY_MIN_RECORDS {
        return 1.0;
    }
    let bucket_len = hits.len() / STABILITY_BUCKETS;
    let rates: Vec<f64> = (0..STABILITY_BUCKETS)
        .map(|b| {
            let start = b * bucket_len;
            let end = if b == STABILITY_BUCKETS - 1 {
                hits.len()
            } else {
                start + bucket_len
            };
            mean(&hits[start..end])
        })
        .collect();
    let m = mean(&rates);
    let pop_std = (rates.iter().map(|r| (r - m).powi(2)).sum::<f64>() / rates.len() as f64).sqrt();
    (1.0 - 2.0 * pop_std).clamp(0.0, 1.0)
}
