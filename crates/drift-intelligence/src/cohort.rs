//! Cohort metrics and the hit-rate significance test.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use statrs::distribution::{ContinuousCDF, Normal};

use pattern_core::{PerformanceMetrics, PredictionRecord};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CohortMetrics {
    pub name: String,
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
    pub samples: usize,
    pub hits: usize,
    pub hit_rate: f64,
    pub expectancy: f64,
    pub sharpe_like: f64,
    /// Mean confidence minus hit rate.
    pub calibration_gap: f64,
    pub max_drawdown: f64,
}

impl CohortMetrics {
    pub fn from_records(
        name: impl Into<String>,
        window_start: DateTime<Utc>,
        window_end: DateTime<Utc>,
        records: &[PredictionRecord],
    ) -> Self {
        let m = PerformanceMetrics::from_records(records);
        Self {
            name: name.into(),
            window_start,
            window_end,
            samples: m.predictions,
            hits: records.iter().filter(|r| r.hit).count(),
            hit_rate: m.pattern_match_rate,
            expectancy: m.expectancy,
            sharpe_like: m.sharpe_like,
            calibration_gap: m.calibration_gap,
            max_drawdown: m.max_drawdown,
        }
    }
}

/// Two-sided p-value of a two-proportion z-test. `None` when either cohort
/// is empty or the pooled rate is degenerate.
pub fn two_proportion_p_value(hits_a: usize, n_a: usize, hits_b: usize, n_b: usize) -> Option<f64> {
    if n_a == 0 || n_b == 0 {
        return None;
    }
    let (na, nb) = (n_a as f64, n_b as f64);
    let pooled = (hits_a + hits_b) as f64 / (na + nb);
    let se = (pooled * (1.0 - pooled) * (1.0 / na + 1.0 / nb)).sqrt();
    if se < 1e-12 {
        return None;
    }
    let z = (hits_a as f64 / na - hits_b as f64 / nb) / se;
    let normal = Normal::new(0.0, 1.0).ok()?;
    Some((2.0 * (1.0 - normal.cdf(z.abs()))).clamp(0.0, 1.0))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_identical_rates_are_not_significant() {
        let p = two_proportion_p_value(30, 60, 50, 100).unwrap();
        assert_relative_eq!(p, 1.0, epsilon = 1e-9);
    }

    #[test]
    fn test_large_gap_is_significant() {
        let p = two_proportion_p_value(20, 100, 60, 100).unwrap();
        assert!(p < 0.001);
    }

    #[test]
    fn test_degenerate_inputs() {
        assert!(two_proportion_p_value(0, 0, 5, 10).is_none());
        assert!(two_proportion_p_value(10, 10, 10, 10).is_none());
    }
}
