//! Calibration shift confirmation.
//!
//! The drift engine feeds per-prediction calibration error (confidence
//! minus hit, oldest first) through a two-sided CUSUM. The oldest `warmup`
//! records set the reference mean and deviation; an upward crossing that
//! lands inside the live window confirms that confidence has started to
//! overstate the hit rate. Only a confirmed shift lets calibration drift
//! reach CRITICAL.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChangeDirection {
    Increase,
    Decrease,
}

/// A point where a cumulative sum crossed the decision threshold.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangePoint {
    pub index: usize,
    pub direction: ChangeDirection,
    pub cusum_value: f64,
    /// Grows with the overshoot past the threshold, in [0.5, 0.99].
    pub confidence: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CusumResult {
    pub upper: Vec<f64>,
    pub lower: Vec<f64>,
    pub threshold: f64,
    pub change_points: Vec<ChangePoint>,
    /// False when the series was shorter than the warm-up.
    pub evaluated: bool,
}

impl CusumResult {
    /// First upward change at or after `from_index`.
    pub fn first_increase_from(&self, from_index: usize) -> Option<&ChangePoint> {
        self.change_points
            .iter()
            .find(|cp| cp.index >= from_index && cp.direction == ChangeDirection::Increase)
    }
}

#[derive(Debug, Clone)]
pub struct CusumDetector {
    /// Allowable slack (k) in standard deviations.
    slack: f64,
    /// Decision threshold (h).
    threshold: f64,
    warmup: usize,
}

impl Default for CusumDetector {
    fn default() -> Self {
        Self::new(0.5, 5.0, 20)
    }
}

impl CusumDetector {
    pub fn new(slack: f64, threshold: f64, warmup: usize) -> Self {
        Self {
            slack,
            threshold,
            warmup: warmup.max(2),
        }
    }

    pub fn analyze(&self, values: &[f64]) -> CusumResult {
        let n = values.len();
        if n < self.warmup {
            return CusumResult {
                upper: vec![0.0; n],
                lower: vec![0.0; n],
                threshold: self.threshold,
                change_points: Vec::new(),
                evaluated: false,
            };
        }

        let reference = &values[..self.warmup];
        let mean = reference.iter().sum::<f64>() / reference.len() as f64;
        let variance = reference.iter().map(|x| (x - mean).powi(2)).sum::<f64>()
            / (reference.len() - 1) as f64;
        // Binary outcomes make a constant warm-up common
        let std = variance.sqrt().max(0.05);

        let mut upper = vec![0.0; n];
        let mut lower = vec![0.0; n];
        let mut change_points = Vec::new();

        for i in 1..n {
            let z = (values[i] - mean) / std;
            upper[i] = (upper[i - 1] + z - self.slack).max(0.0);
            lower[i] = (lower[i - 1] - z - self.slack).max(0.0);

            if upper[i] > self.threshold {
                change_points.push(ChangePoint {
                    index: i,
                    direction: ChangeDirection::Increase,
                    cusum_value: upper[i],
                    confidence: self.confidence(upper[i]),
                });
                upper[i] = 0.0;
            }
            if lower[i] > self.threshold {
                change_points.push(ChangePoint {
                    index: i,
                    direction: ChangeDirection::Decrease,
                    cusum_value: lower[i],
                    confidence: self.confidence(lower[i]),
                });
                lower[i] = 0.0;
            }
        }

        CusumResult {
            upper,
            lower,
            threshold: self.threshold,
            change_points,
            evaluated: true,
        }
    }

    fn confidence(&self, cusum_value: f64) -> f64 {
        let excess = (cusum_value - self.threshold) / self.threshold;
        (0.5 + 0.5 * (1.0 - (-excess).exp())).min(0.99)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constant_series_is_stable() {
        let result = CusumDetector::default().analyze(&[0.2; 100]);
        assert!(result.evaluated);
        assert!(result.change_points.is_empty());
    }

    #[test]
    fn test_short_series_not_evaluated() {
        let result = CusumDetector::default().analyze(&[0.1; 5]);
        assert!(!result.evaluated);
        assert_eq!(result.upper.len(), 5);
    }

    #[test]
    fn test_detects_upward_shift_after_warmup() {
        // calibration error alternating around 0.1, then jumping to 0.6
        let mut values: Vec<f64> = (0..40).map(|i| if i % 2 == 0 { 0.0 } else { 0.2 }).collect();
        values.extend(std::iter::repeat(0.6).take(20));

        let result = CusumDetector::new(0.5, 4.0, 20).analyze(&values);
        let cp = result.first_increase_from(40).expect("upward change");
        assert!(cp.index >= 40);
        assert!(cp.confidence >= 0.5 && cp.confidence <= 0.99);
        assert!(result.first_increase_from(0).map(|c| c.index >= 40).unwrap_or(false));
    }

    #[test]
    fn test_detects_downward_shift() {
        let mut values: Vec<f64> = (0..30).map(|i| if i % 2 == 0 { 0.4 } else { 0.6 }).collect();
        values.extend(std::iter::repeat(-0.5).take(10));
        let result = CusumDetector::new(0.5, 4.0, 20).analyze(&values);
        assert!(result
            .change_points
            .iter()
            .any(|cp| cp.direction == ChangeDirection::Decrease));
    }
}
