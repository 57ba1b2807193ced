//! Confidence Calibration
//!
//! Computes the weighted forward-return distribution of a match set and a
//! confidence score driven by the effective sample size.

use serde::{Deserialize, Serialize};

use pattern_core::stats::{weighted_mean, weighted_quantile, weighted_std};
use pattern_core::{CoreResult, Match, Validate};

use crate::weights::{ConfidenceCurve, DecayConfig, WeightedMatch};

/// Weighted forecast derived from analogue matches.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalibratedForecast {
    pub match_count: usize,
    /// Kish effective sample size, `(sum w)^2 / sum w^2`
    pub effective_n: f64,
    /// Weighted mean forward return, percent
    pub weighted_mean: f64,
    pub weighted_std: f64,
    /// Weighted share of matches with a positive forward return
    pub win_probability: f64,
    pub p10: f64,
    pub p50: f64,
    pub p90: f64,
    pub mean_drawdown: f64,
    pub mean_excursion: f64,
    pub reliability_modifier: f64,
    /// `confN(effective_n)` before any adjustment
    pub confidence_raw: f64,
    pub confidence_final: f64,
}

/// Kish's effective sample size. Zero for empty or all-zero weights.
///
/// Equals the count when all weights are equal and tends to 1 as the weight
/// concentrates on a single match.
pub fn effective_n(weights: &[f64]) -> f64 {
    let sum: f64 = weights.iter().map(|w| w.max(0.0)).sum();
    let sum_sq: f64 = weights.iter().map(|w| w.max(0.0).powi(2)).sum();
    if sum_sq <= f64::MIN_POSITIVE {
        return 0.0;
    }
    (sum * sum / sum_sq).min(weights.len() as f64)
}

/// `(1 - w) + w * r`
pub fn reliability_modifier(curve: &ConfidenceCurve, reliability: f64) -> f64 {
    let r = if reliability.is_finite() {
        reliability.clamp(0.0, 1.0)
    } else {
        0.0
    };
    (1.0 - curve.reliability_weight) + curve.reliability_weight * r
}

fn conf_n(curve: &ConfidenceCurve, n: f64) -> f64 {
    1.0 - (-n.max(0.0) / curve.n_scale).exp()
}

/// Final confidence. Non-decreasing in `n` for fixed reliability.
pub fn confidence_final(
    curve: &ConfidenceCurve,
    n: f64,
    reliability: f64,
    base_confidence: f64,
) -> f64 {
    let base = if base_confidence.is_finite() {
        base_confidence.clamp(0.0, 1.0)
    } else {
        0.0
    };
    (conf_n(curve, n) * reliability_modifier(curve, reliability) * base)
        .clamp(curve.min_confidence, curve.max_confidence)
}

/// Applies the decay weights and computes calibrated statistics.
#[derive(Debug, Clone, Default)]
pub struct DecayCalibrator {
    config: DecayConfig,
}

impl DecayCalibrator {
    pub fn new(config: DecayConfig) -> CoreResult<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &DecayConfig {
        &self.config
    }

    pub fn apply_decay(&self, matches: &[Match], reliability: f64) -> Vec<WeightedMatch> {
        matches
            .iter()
            .map(|m| WeightedMatch {
                matched: m.clone(),
                weights: self.config.weigh(m, reliability),
            })
            .collect()
    }

    pub fn compute_stats(
        &self,
        weighted: &[WeightedMatch],
        reliability: f64,
        base_confidence: f64,
    ) -> CalibratedForecast {
        let curve = &self.config.confidence;
        let weights: Vec<f64> = weighted.iter().map(|w| w.weights.final_weight).collect();
        let total: f64 = weights.iter().sum();
        let rel_mod = reliability_modifier(curve, reliability);

        if weighted.is_empty() || total <= f64::EPSILON {
            tracing::debug!(
                "No usable weight across {} matches; returning minimum confidence",
                weighted.len()
            );
            return CalibratedForecast {
                match_count: weighted.len(),
                effective_n: 0.0,
                weighted_mean: 0.0,
                weighted_std: 0.0,
                win_probability: 0.0,
                p10: 0.0,
                p50: 0.0,
                p90: 0.0,
                mean_drawdown: 0.0,
                mean_excursion: 0.0,
                reliability_modifier: rel_mod,
                confidence_raw: 0.0,
                confidence_final: curve.min_confidence,
            };
        }

        let returns: Vec<f64> = weighted.iter().map(|w| w.matched.outcome.return_pct).collect();
        let drawdowns: Vec<f64> = weighted
            .iter()
            .map(|w| w.matched.outcome.max_drawdown)
            .collect();
        let excursions: Vec<f64> = weighted
            .iter()
            .map(|w| w.matched.outcome.max_excursion)
            .collect();
        let wins: Vec<f64> = returns.iter().map(|r| if *r > 0.0 { 1.0 } else { 0.0 }).collect();

        let n_eff = effective_n(&weights);
        let forecast = CalibratedForecast {
            match_count: weighted.len(),
            effective_n: n_eff,
            weighted_mean: weighted_mean(&returns, &weights),
            weighted_std: weighted_std(&returns, &weights),
            win_probability: weighted_mean(&wins, &weights),
            p10: weighted_quantile(&returns, &weights, 0.10),
            p50: weighted_quantile(&returns, &weights, 0.50),
            p90: weighted_quantile(&returns, &weights, 0.90),
            mean_drawdown: weighted_mean(&drawdowns, &weights),
            mean_excursion: weighted_mean(&excursions, &weights),
            reliability_modifier: rel_mod,
            confidence_raw: conf_n(curve, n_eff),
            confidence_final: confidence_final(curve, n_eff, reliability, base_confidence),
        };

        tracing::debug!(
            "Calibrated {} matches: n_eff={:.2}, mean={:.2}%, confidence={:.3}",
            forecast.match_count,
            forecast.effective_n,
            forecast.weighted_mean,
            forecast.confidence_final
        );
        forecast
    }

    /// `apply_decay` followed by `compute_stats`.
    pub fn calibrate(
        &self,
        matches: &[Match],
        reliability: f64,
        base_confidence: f64,
    ) -> (Vec<WeightedMatch>, CalibratedForecast) {
        let weighted = self.apply_decay(matches, reliability);
        let forecast = self.compute_stats(&weighted, reliability, base_confidence);
        (weighted, forecast)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use chrono::{TimeZone, Utc};
    use pattern_core::Outcome;

    fn make_match(i: usize, similarity: f64, return_pct: f64) -> Match {
        let ts = Utc.with_ymd_and_hms(2022, 1, 1, 0, 0, 0).unwrap();
        Match {
            id: format!("m{}", i),
            start_index: i,
            start_ts: ts,
            end_ts: ts,
            raw_similarity: similarity,
            selection_score: 1.0,
            age_weight: 1.0,
            stability_score: Some(0.9),
            outcome: Outcome {
                return_pct,
                max_drawdown: 2.0,
                max_excursion: 3.0,
            },
        }
    }

    #[test]
    fn test_effective_n_equal_weights() {
        assert_relative_eq!(effective_n(&[1.0; 10]), 10.0, epsilon = 1e-12);
    }

    #[test]
    fn test_effective_n_concentrated_weight() {
        let mut w = vec![0.0; 10];
        w[0] = 10.0;
        assert_relative_eq!(effective_n(&w), 1.0, epsilon = 1e-12);
    }

    #[test]
    fn test_effective_n_bounded_by_count() {
        let w = [1.0, 2.0, 3.0, 0.5];
        let n = effective_n(&w);
        assert!(n < 4.0);
        assert!(n >= 1.0);
        assert_eq!(effective_n(&[]), 0.0);
        assert_eq!(effective_n(&[0.0, 0.0]), 0.0);
    }

    #[test]
    fn test_confidence_monotonic_in_effective_n() {
        let curve = ConfidenceCurve::default();
        let mut prev = confidence_final(&curve, 0.0, 0.8, 1.0);
        for i in 1..200 {
            let c = confidence_final(&curve, i as f64 * 0.5, 0.8, 1.0);
            assert!(c >= prev);
            assert!(c <= curve.max_confidence);
            prev = c;
        }
    }

    #[test]
    fn test_reliability_modifier_blend() {
        let curve = ConfidenceCurve {
            reliability_weight: 0.4,
            ..ConfidenceCurve::default()
        };
        assert_relative_eq!(reliability_modifier(&curve, 1.0), 1.0);
        assert_relative_eq!(reliability_modifier(&curve, 0.0), 0.6);
    }

    #[test]
    fn test_empty_matches_yield_minimum_confidence() {
        let calibrator = DecayCalibrator::default();
        let (weighted, forecast) = calibrator.calibrate(&[], 0.9, 1.0);
        assert!(weighted.is_empty());
        assert_eq!(forecast.effective_n, 0.0);
        assert_eq!(forecast.weighted_mean, 0.0);
        assert_eq!(forecast.weighted_std, 0.0);
        assert_relative_eq!(
            forecast.confidence_final,
            calibrator.config().confidence.min_confidence
        );
    }

    #[test]
    fn test_weighted_stats() {
        let calibrator = DecayCalibrator::default();
        let matches: Vec<Match> = (0..10)
            .map(|i| make_match(i, 0.99, if i % 2 == 0 { 2.0 } else { -1.0 }))
            .collect();
        let (weighted, forecast) = calibrator.calibrate(&matches, 1.0, 1.0);

        assert_eq!(weighted.len(), 10);
        for w in &weighted {
            let b = w.weights;
            assert_relative_eq!(b.final_weight, b.age * b.health * b.stability * b.similarity);
        }
        // identical weights -> plain statistics
        assert_relative_eq!(forecast.effective_n, 10.0, epsilon = 1e-9);
        assert_relative_eq!(forecast.weighted_mean, 0.5, epsilon = 1e-9);
        assert_relative_eq!(forecast.weighted_std, 1.5, epsilon = 1e-9);
        assert_relative_eq!(forecast.win_probability, 0.5, epsilon = 1e-9);
        assert_relative_eq!(forecast.mean_drawdown, 2.0, epsilon = 1e-9);
        assert!(forecast.confidence_final > forecast.reliability_modifier * 0.0);
        assert!(forecast.confidence_final <= calibrator.config().confidence.max_confidence);
    }

    #[test]
    fn test_outlier_weight_cannot_inflate_confidence() {
        let calibrator = DecayCalibrator::default();
        let mut matches: Vec<Match> = (0..10).map(|i| make_match(i, 0.10, 1.0)).collect();
        matches[0].raw_similarity = 1.0;
        let (_, skewed) = calibrator.calibrate(&matches, 1.0, 1.0);

        let even: Vec<Match> = (0..10).map(|i| make_match(i, 1.0, 1.0)).collect();
        let (_, balanced) = calibrator.calibrate(&even, 1.0, 1.0);

        assert!(skewed.effective_n < balanced.effective_n);
        assert!(skewed.confidence_final <= balanced.confidence_final);
    }
}
