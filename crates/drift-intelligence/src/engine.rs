//! Drift computation.
//!
//! The live cohort covers the last `window_days`; each configured baseline
//! covers its own historical window. Severity is the worst usable
//! comparison, escalated by confirmed calibration drift and capped below
//! CRITICAL when the live sample is too small to trust.

use std::sync::Arc;

use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use pattern_core::{
    ConfigHandle, CoreError, CoreResult, Horizon, HorizonKey, LifecycleAction, PredictionRecord,
    PredictionSource,
};

use crate::cohort::{two_proportion_p_value, CohortMetrics};
use crate::config::{DriftConfig, DriftThresholds};
use crate::cusum::CusumDetector;
use crate::severity::{DriftFlag, Recommendation, Severity};

/// Live minus baseline. `calibration_pp` is the growth of the absolute
/// calibration gap, so positive is worse there and negative is worse
/// everywhere else.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct MetricDeltas {
    pub hit_rate_pp: f64,
    pub expectancy: f64,
    pub sharpe: f64,
    pub calibration_pp: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CohortComparison {
    pub baseline: String,
    /// False when the baseline had too few samples to compare against.
    pub usable: bool,
    pub deltas: MetricDeltas,
    pub severity: Severity,
    pub reasons: Vec<String>,
    pub hit_rate_p_value: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct CalibrationDrift {
    pub evaluated: bool,
    pub confirmed: bool,
    pub resolved_at: Option<DateTime<Utc>>,
    pub cusum_value: Option<f64>,
    pub confidence: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HorizonBreakdown {
    pub horizon: Horizon,
    pub live: CohortMetrics,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DriftPayload {
    pub symbol: String,
    pub as_of: DateTime<Utc>,
    pub window_days: i64,
    pub live: CohortMetrics,
    pub baselines: Vec<CohortMetrics>,
    pub comparisons: Vec<CohortComparison>,
    pub by_horizon: Vec<HorizonBreakdown>,
    pub calibration_drift: CalibrationDrift,
    pub severity: Severity,
    pub flags: Vec<DriftFlag>,
    pub recommendation: Recommendation,
    pub blocked_actions: Vec<LifecycleAction>,
    pub reasons: Vec<String>,
}

impl DriftPayload {
    pub fn blocks(&self, action: LifecycleAction) -> bool {
        self.blocked_actions.contains(&action)
    }

    pub fn snapshot_date(&self) -> NaiveDate {
        self.as_of.date_naive()
    }
}

pub struct DriftEngine {
    predictions: Arc<dyn PredictionSource>,
    config: ConfigHandle<DriftConfig>,
}

impl DriftEngine {
    pub fn new(predictions: Arc<dyn PredictionSource>, config: ConfigHandle<DriftConfig>) -> Self {
        Self {
            predictions,
            config,
        }
    }

    pub async fn compute_drift_intelligence(
        &self,
        symbol: &str,
        window_days: i64,
        now: DateTime<Utc>,
    ) -> CoreResult<DriftPayload> {
        if window_days < 1 {
            return Err(CoreError::config("window_days", "must be at least 1"));
        }
        let config = self.config.snapshot();
        let symbol = symbol.trim().to_ascii_uppercase();

        let live_start = now - Duration::days(window_days);
        let earliest = config
            .baselines
            .iter()
            .map(|b| now - Duration::days(b.offset_days + b.window_days))
            .min()
            .unwrap_or(live_start)
            .min(live_start);

        let mut all: Vec<PredictionRecord> = Vec::new();
        let mut by_horizon = Vec::with_capacity(config.horizons.len());
        for horizon in &config.horizons {
            let key = HorizonKey::new(symbol.as_str(), *horizon);
            let records = self.predictions.all_predictions(&key, earliest, now).await?;
            let live: Vec<PredictionRecord> = within(&records, live_start, now);
            by_horizon.push(HorizonBreakdown {
                horizon: *horizon,
                live: CohortMetrics::from_records("LIVE", live_start, now, &live),
            });
            all.extend(records);
        }
        all.sort_by_key(|r| r.resolved_at);

        let live = CohortMetrics::from_records("LIVE", live_start, now, &within(&all, live_start, now));
        let baselines: Vec<CohortMetrics> = config
            .baselines
            .iter()
            .map(|b| {
                let end = now - Duration::days(b.offset_days);
                let start = end - Duration::days(b.window_days);
                CohortMetrics::from_records(b.name.clone(), start, end, &within(&all, start, end))
            })
            .collect();

        let calibration_drift = detect_calibration_drift(&config, &all, live_start);

        let mut flags = Vec::new();
        let comparisons: Vec<CohortComparison> = baselines
            .iter()
            .map(|b| compare(&config, &live, b, calibration_drift.confirmed))
            .collect();
        if comparisons.iter().any(|c| !c.usable) {
            flags.push(DriftFlag::BaselineLowSample);
        }

        let mut reasons: Vec<String> = comparisons
            .iter()
            .flat_map(|c| c.reasons.iter().cloned())
            .collect();
        let mut severity = comparisons
            .iter()
            .filter(|c| c.usable)
            .map(|c| c.severity)
            .max()
            .unwrap_or(Severity::Ok);

        if calibration_drift.confirmed {
            flags.push(DriftFlag::CalibrationDriftConfirmed);
            reasons.push("CALIBRATION_DRIFT: CUSUM confirmed upward shift".to_string());
            severity = Severity::Critical;
        }

        let worst = comparisons
            .iter()
            .filter(|c| c.usable)
            .min_by(|a, b| {
                a.deltas
                    .hit_rate_pp
                    .partial_cmp(&b.deltas.hit_rate_pp)
                    .unwrap_or(std::cmp::Ordering::Equal)
            });
        if let Some(c) = worst {
            let drop = -c.deltas.hit_rate_pp;
            let significant = c
                .hit_rate_p_value
                .map(|p| p <= config.significance_alpha)
                .unwrap_or(false);
            if drop >= config.watch.hit_rate_pp && !significant {
                flags.push(DriftFlag::NotSignificant);
            }
        }

        if live.samples < config.min_live_samples {
            flags.push(DriftFlag::LowSample);
            reasons.push(format!(
                "LOW_SAMPLE: {} live predictions < {}",
                live.samples, config.min_live_samples
            ));
            severity = severity.min(Severity::Warn);
        }

        let recommendation = severity.recommendation();
        let blocked_actions = recommendation.blocked_actions(config.rollback_on_critical);

        if severity >= Severity::Warn {
            tracing::warn!(
                "Drift on {}: {} -> {} ({})",
                symbol,
                severity,
                recommendation,
                reasons.join("; ")
            );
        } else {
            tracing::info!("Drift on {}: {}", symbol, severity);
        }

        Ok(DriftPayload {
            symbol,
            as_of: now,
            window_days,
            live,
            baselines,
            comparisons,
            by_horizon,
            calibration_drift,
            severity,
            flags,
            recommendation,
            blocked_actions,
            reasons,
        })
    }
}

fn within(records: &[PredictionRecord], from: DateTime<Utc>, to: DateTime<Utc>) -> Vec<PredictionRecord> {
    records
        .iter()
        .filter(|r| r.resolved_at >= from && r.resolved_at < to)
        .cloned()
        .collect()
}

fn level(degradation: f64, pick: impl Fn(&DriftThresholds) -> f64, config: &DriftConfig) -> Severity {
    if degradation >= pick(&config.critical) {
        Severity::Critical
    } else if degradation >= pick(&config.warn) {
        Severity::Warn
    } else if degradation >= pick(&config.watch) {
        Severity::Watch
    } else {
        Severity::Ok
    }
}

fn compare(
    config: &DriftConfig,
    live: &CohortMetrics,
    baseline: &CohortMetrics,
    calibration_confirmed: bool,
) -> CohortComparison {
    let deltas = MetricDeltas {
        hit_rate_pp: (live.hit_rate - baseline.hit_rate) * 100.0,
        expectancy: live.expectancy - baseline.expectancy,
        sharpe: live.sharpe_like - baseline.sharpe_like,
        calibration_pp: (live.calibration_gap.abs() - baseline.calibration_gap.abs()) * 100.0,
    };
    let hit_rate_p_value =
        two_proportion_p_value(live.hits, live.samples, baseline.hits, baseline.samples);

    if baseline.samples < config.min_baseline_samples {
        return CohortComparison {
            baseline: baseline.name.clone(),
            usable: false,
            deltas,
            severity: Severity::Ok,
            reasons: vec![format!(
                "BASELINE_LOW_SAMPLE: {} has {} predictions < {}",
                baseline.name, baseline.samples, config.min_baseline_samples
            )],
            hit_rate_p_value,
        };
    }

    let mut calibration = level(deltas.calibration_pp, |t| t.calibration_pp, config);
    if calibration == Severity::Critical && !calibration_confirmed {
        calibration = Severity::Warn;
    }
    let levels = [
        ("HIT_RATE", level(-deltas.hit_rate_pp, |t| t.hit_rate_pp, config), format!("{:+.1}pp", deltas.hit_rate_pp)),
        ("EXPECTANCY", level(-deltas.expectancy, |t| t.expectancy, config), format!("{:+.3}", deltas.expectancy)),
        ("SHARPE", level(-deltas.sharpe, |t| t.sharpe, config), format!("{:+.3}", deltas.sharpe)),
        ("CALIBRATION", calibration, format!("{:+.1}pp", deltas.calibration_pp)),
    ];

    let severity = levels.iter().map(|(_, s, _)| *s).max().unwrap_or(Severity::Ok);
    let reasons = levels
        .iter()
        .filter(|(_, s, _)| *s > Severity::Ok)
        .map(|(name, s, delta)| format!("{}: {} vs {} ({})", name, delta, baseline.name, s))
        .collect();

    CohortComparison {
        baseline: baseline.name.clone(),
        usable: true,
        deltas,
        severity,
        reasons,
        hit_rate_p_value,
    }
}

/// CUSUM over per-prediction calibration error (`confidence - hit`), with
/// the oldest predictions as reference. Confirmed only by an upward change
/// inside the live cohort.
fn detect_calibration_drift(
    config: &DriftConfig,
    records: &[PredictionRecord],
    live_start: DateTime<Utc>,
) -> CalibrationDrift {
    let errors: Vec<f64> = records
        .iter()
        .map(|r| r.confidence.clamp(0.0, 1.0) - if r.hit { 1.0 } else { 0.0 })
        .collect();
    let live_index = records
        .iter()
        .position(|r| r.resolved_at >= live_start)
        .unwrap_or(records.len());
    if live_index < config.cusum_warmup {
        // The reference window would overlap the live cohort
        return CalibrationDrift::default();
    }

    let detector = CusumDetector::new(config.cusum_slack, config.cusum_threshold, config.cusum_warmup);
    let result = detector.analyze(&errors);
    match result.first_increase_from(live_index) {
        Some(cp) => CalibrationDrift {
            evaluated: result.evaluated,
            confirmed: true,
            resolved_at: records.get(cp.index).map(|r| r.resolved_at),
            cusum_value: Some(cp.cusum_value),
            confidence: Some(cp.confidence),
        },
        None => CalibrationDrift {
            evaluated: result.evaluated,
            ..CalibrationDrift::default()
        },
    }
}
