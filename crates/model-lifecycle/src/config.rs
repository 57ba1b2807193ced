//! Lifecycle thresholds.
//!
//! Loaded from the agent's JSON document and swapped through
//! `ConfigHandle<LifecycleConfig>` on reload.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use pattern_core::config::ensure_range;
use pattern_core::{CoreError, CoreResult, Horizon, Validate};

/// Promotion gates for one horizon.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HorizonThresholds {
    pub min_samples: usize,
    /// Shadow hit rate minus active hit rate, as a fraction.
    pub min_win_rate_lift: f64,
    pub min_sharpe_lift: f64,
    /// Percentage points.
    pub max_dd_for_promo: f64,
    pub min_stability: f64,
    pub cooldown_days: i64,
    pub window_days: i64,
}

impl Default for HorizonThresholds {
    fn default() -> Self {
        Self {
            min_samples: 50,
            min_win_rate_lift: 0.03,
            min_sharpe_lift: 0.10,
            max_dd_for_promo: 15.0,
            min_stability: 0.60,
            cooldown_days: 14,
            window_days: 30,
        }
    }
}

impl HorizonThresholds {
    fn validate_as(&self, prefix: &str) -> CoreResult<()> {
        if self.min_samples == 0 {
            return Err(CoreError::config(
                format!("{}.min_samples", prefix),
                "must be at least 1",
            ));
        }
        ensure_range(&format!("{}.min_win_rate_lift", prefix), self.min_win_rate_lift, -1.0, 1.0)?;
        ensure_range(&format!("{}.min_sharpe_lift", prefix), self.min_sharpe_lift, -10.0, 10.0)?;
        ensure_range(&format!("{}.max_dd_for_promo", prefix), self.max_dd_for_promo, 0.0, 100.0)?;
        ensure_range(&format!("{}.min_stability", prefix), self.min_stability, 0.0, 1.0)?;
        if self.cooldown_days < 0 {
            return Err(CoreError::config(
                format!("{}.cooldown_days", prefix),
                "must not be negative",
            ));
        }
        if self.window_days < 1 {
            return Err(CoreError::config(
                format!("{}.window_days", prefix),
                "must be at least 1",
            ));
        }
        Ok(())
    }
}

/// Multi-window confirmation run after the base gates pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SustainedLiftConfig {
    pub windows: usize,
    pub window_days: i64,
    /// Minimum shadow predictions inside each window.
    pub min_predictions: usize,
    pub min_win_rate_lift: f64,
    pub min_sharpe_lift: f64,
}

impl Default for SustainedLiftConfig {
    fn default() -> Self {
        Self {
            windows: 3,
            window_days: 14,
            min_predictions: 10,
            min_win_rate_lift: 0.0,
            min_sharpe_lift: 0.0,
        }
    }
}

/// Safety triggers for the active variant. Any single breach rolls back.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RollbackConfig {
    pub win_rate_floor: f64,
    /// Percentage points.
    pub max_drawdown_ceil: f64,
    pub min_stability: f64,
    pub max_consecutive_losses: usize,
    pub cooldown_days: i64,
    pub window_days: i64,
    /// Below this many live predictions no trigger is evaluated.
    pub min_samples: usize,
}

impl Default for RollbackConfig {
    fn default() -> Self {
        Self {
            win_rate_floor: 0.45,
            max_drawdown_ceil: 20.0,
            min_stability: 0.40,
            max_consecutive_losses: 6,
            cooldown_days: 3,
            window_days: 7,
            min_samples: 10,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct LifecycleConfig {
    /// Used for every horizon without an explicit entry.
    #[serde(default)]
    pub defaults: HorizonThresholds,
    #[serde(default)]
    pub horizons: BTreeMap<Horizon, HorizonThresholds>,
    #[serde(default)]
    pub sustained: SustainedLiftConfig,
    #[serde(default)]
    pub rollback: RollbackConfig,
}

impl LifecycleConfig {
    pub fn thresholds_for(&self, horizon: Horizon) -> &HorizonThresholds {
        self.horizons.get(&horizon).unwrap_or(&self.defaults)
    }
}

impl Validate for LifecycleConfig {
    fn validate(&self) -> CoreResult<()> {
        self.defaults.validate_as("lifecycle.defaults")?;
        for (horizon, thresholds) in &self.horizons {
            thresholds.validate_as(&format!("lifecycle.horizons.{}", horizon))?;
        }

        let s = &self.sustained;
        if s.windows == 0 {
            return Err(CoreError::config("lifecycle.sustained.windows", "must be at least 1"));
        }
        if s.window_days < 1 {
            return Err(CoreError::config(
                "lifecycle.sustained.window_days",
                "must be at least 1",
            ));
        }
        ensure_range("lifecycle.sustained.min_win_rate_lift", s.min_win_rate_lift, -1.0, 1.0)?;
        ensure_range("lifecycle.sustained.min_sharpe_lift", s.min_sharpe_lift, -10.0, 10.0)?;

        let r = &self.rollback;
        ensure_range("lifecycle.rollback.win_rate_floor", r.win_rate_floor, 0.0, 1.0)?;
        ensure_range("lifecycle.rollback.max_drawdown_ceil", r.max_drawdown_ceil, 0.0, 100.0)?;
        ensure_range("lifecycle.rollback.min_stability", r.min_stability, 0.0, 1.0)?;
        if r.cooldown_days < 0 {
            return Err(CoreError::config(
                "lifecycle.rollback.cooldown_days",
                "must not be negative",
            ));
        }
        if r.window_days < 1 {
            return Err(CoreError::config(
                "lifecycle.rollback.window_days",
                "must be at least 1",
            ));
        }
        Ok(())
    }
}
