use serde::{Deserialize, Serialize};

use pattern_core::config::ensure_range;
use pattern_core::{CoreError, CoreResult, Horizon, Validate};

/// A historical cohort ending `offset_days` before now.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BaselineSpec {
    pub name: String,
    pub offset_days: i64,
    pub window_days: i64,
}

/// Degradation magnitudes (live worse than baseline) for one severity level.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DriftThresholds {
    /// Hit-rate drop, percentage points.
    pub hit_rate_pp: f64,
    /// Expectancy drop, percent per prediction.
    pub expectancy: f64,
    pub sharpe: f64,
    /// Growth of the absolute calibration gap, percentage points.
    pub calibration_pp: f64,
}

impl DriftThresholds {
    fn validate_as(&self, prefix: &str) -> CoreResult<()> {
        for (name, value) in [
            ("hit_rate_pp", self.hit_rate_pp),
            ("expectancy", self.expectancy),
            ("sharpe", self.sharpe),
            ("calibration_pp", self.calibration_pp),
        ] {
            if !(value.is_finite() && value > 0.0) {
                return Err(CoreError::config(
                    format!("{}.{}", prefix, name),
                    "must be positive",
                ));
            }
        }
        Ok(())
    }

    fn dominated_by(&self, other: &DriftThresholds) -> bool {
        self.hit_rate_pp <= other.hit_rate_pp
            && self.expectancy <= other.expectancy
            && self.sharpe <= other.sharpe
            && self.calibration_pp <= other.calibration_pp
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DriftConfig {
    pub horizons: Vec<Horizon>,
    pub baselines: Vec<BaselineSpec>,
    pub min_live_samples: usize,
    pub min_baseline_samples: usize,
    pub watch: DriftThresholds,
    pub warn: DriftThresholds,
    pub critical: DriftThresholds,
    pub cusum_slack: f64,
    pub cusum_threshold: f64,
    pub cusum_warmup: usize,
    /// Significance level reported for the hit-rate z-test.
    pub significance_alpha: f64,
    /// Let a CRITICAL verdict trigger rollback instead of blocking it.
    pub rollback_on_critical: bool,
}

impl Default for DriftConfig {
    fn default() -> Self {
        Self {
            horizons: vec![Horizon::days(1), Horizon::days(7), Horizon::days(30)],
            baselines: vec![
                BaselineSpec {
                    name: "BASELINE_A".to_string(),
                    offset_days: 30,
                    window_days: 60,
                },
                BaselineSpec {
                    name: "BASELINE_B".to_string(),
                    offset_days: 90,
                    window_days: 90,
                },
            ],
            min_live_samples: 30,
            min_baseline_samples: 30,
            watch: DriftThresholds {
                hit_rate_pp: 5.0,
                expectancy: 0.25,
                sharpe: 0.25,
                calibration_pp: 5.0,
            },
            warn: DriftThresholds {
                hit_rate_pp: 10.0,
                expectancy: 0.5,
                sharpe: 0.5,
                calibration_pp: 10.0,
            },
            critical: DriftThresholds {
                hit_rate_pp: 20.0,
                expectancy: 1.0,
                sharpe: 1.0,
                calibration_pp: 20.0,
            },
            cusum_slack: 0.5,
            cusum_threshold: 5.0,
            cusum_warmup: 20,
            significance_alpha: 0.05,
            rollback_on_critical: false,
        }
    }
}

impl Validate for DriftConfig {
    fn validate(&self) -> CoreResult<()> {
        if self.horizons.is_empty() {
            return Err(CoreError::config("drift.horizons", "must name at least one horizon"));
        }
        if self.baselines.is_empty() {
            return Err(CoreError::config("drift.baselines", "must define at least one baseline"));
        }
        for b in &self.baselines {
            if b.offset_days < 0 || b.window_days < 1 {
                return Err(CoreError::config(
                    format!("drift.baselines.{}", b.name),
                    "offset must be >= 0 and window >= 1 day",
                ));
            }
        }
        if self.min_live_samples == 0 {
            return Err(CoreError::config("drift.min_live_samples", "must be at least 1"));
        }
        self.watch.validate_as("drift.watch")?;
        self.warn.validate_as("drift.warn")?;
        self.critical.validate_as("drift.critical")?;
        if !self.watch.dominated_by(&self.warn) || !self.warn.dominated_by(&self.critical) {
            return Err(CoreError::config(
                "drift.critical",
                "levels must be ordered watch <= warn <= critical",
            ));
        }
        if !(self.cusum_threshold.is_finite() && self.cusum_threshold > 0.0) {
            return Err(CoreError::config("drift.cusum_threshold", "must be positive"));
        }
        ensure_range("drift.cusum_slack", self.cusum_slack, 0.0, 10.0)?;
        if self.cusum_warmup < 2 {
            return Err(CoreError::config("drift.cusum_warmup", "must be at least 2"));
        }
        ensure_range("drift.significance_alpha", self.significance_alpha, 0.0, 0.5)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_valid() {
        assert!(DriftConfig::default().validate().is_ok());
        assert!(!DriftConfig::default().rollback_on_critical);
    }

    #[test]
    fn test_unordered_levels_rejected() {
        let mut config = DriftConfig::default();
        config.warn.hit_rate_pp = 30.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: DriftConfig =
            serde_json::from_str(r#"{"min_live_samples": 10, "rollback_on_critical": true}"#).unwrap();
        assert_eq!(config.min_live_samples, 10);
        assert!(config.rollback_on_critical);
        assert_eq!(config.baselines.len(), 2);
        assert!(config.validate().is_ok());
    }
}
