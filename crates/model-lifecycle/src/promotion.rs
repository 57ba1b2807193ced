//! Auto-Promotion Engine
//!
//! Six base gates that must all pass (cooldown, sample count, win-rate lift,
//! Sharpe-like lift, shadow drawdown ceiling, shadow stability floor),
//! followed by a sustained-lift check over consecutive non-overlapping
//! windows. Only then, and only when governance allows it, is the shadow
//! promoted.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use pattern_core::{
    ConfigHandle, CoreError, CoreResult, GovernanceGate, HorizonKey, LifecycleAction,
    PerformanceMetrics, PredictionSource,
};

use crate::config::LifecycleConfig;
use crate::evaluation::{EvaluationLog, EvaluationWindow};
use crate::gate::{Decision, GateCheck};
use crate::registry::{HorizonSnapshot, ModelRegistry};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PromotionChecks {
    pub cooldown: GateCheck,
    pub sample_count: GateCheck,
    pub win_rate_lift: GateCheck,
    pub sharpe_lift: GateCheck,
    pub drawdown: GateCheck,
    pub stability: GateCheck,
}

impl PromotionChecks {
    fn named(&self) -> [(&'static str, &GateCheck); 6] {
        [
            ("COOLDOWN", &self.cooldown),
            ("SAMPLE_COUNT", &self.sample_count),
            ("WIN_RATE_LIFT", &self.win_rate_lift),
            ("SHARPE_LIFT", &self.sharpe_lift),
            ("DRAWDOWN", &self.drawdown),
            ("STABILITY", &self.stability),
        ]
    }

    pub fn all_passed(&self) -> bool {
        self.named().iter().all(|(_, c)| c.passed)
    }

    /// One entry per failed gate, e.g. `SAMPLE_COUNT: 40 < 50`.
    pub fn failures(&self) -> Vec<String> {
        self.named()
            .iter()
            .filter(|(_, c)| !c.passed)
            .map(|(name, c)| {
                let op = if *name == "DRAWDOWN" { ">" } else { "<" };
                format!("{}: {:.4} {} {:.4}", name, c.value, op, c.threshold)
            })
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SustainedWindowCheck {
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
    pub predictions: GateCheck,
    pub win_rate_lift: GateCheck,
    pub sharpe_lift: GateCheck,
    pub passed: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PromotionDecision {
    pub key: HorizonKey,
    pub should_promote: bool,
    pub reason: String,
    pub reasons: Vec<String>,
    pub checks: PromotionChecks,
    /// Empty unless every base gate passed.
    pub sustained: Vec<SustainedWindowCheck>,
    pub active_model_id: String,
    pub shadow_model_id: Option<String>,
    pub active_metrics: PerformanceMetrics,
    pub shadow_metrics: PerformanceMetrics,
    /// Registry revision the decision was evaluated against.
    pub revision: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PromotionReport {
    pub decision: PromotionDecision,
    pub outcome: Decision,
}

pub struct PromotionEngine {
    registry: Arc<ModelRegistry>,
    predictions: Arc<dyn PredictionSource>,
    governance: Arc<dyn GovernanceGate>,
    config: ConfigHandle<LifecycleConfig>,
    evaluations: Arc<EvaluationLog>,
}

impl PromotionEngine {
    pub fn new(
        registry: Arc<ModelRegistry>,
        predictions: Arc<dyn PredictionSource>,
        governance: Arc<dyn GovernanceGate>,
        config: ConfigHandle<LifecycleConfig>,
        evaluations: Arc<EvaluationLog>,
    ) -> Self {
        Self {
            registry,
            predictions,
            governance,
            config,
            evaluations,
        }
    }

    /// Evaluate every gate without touching the registry.
    pub async fn check_promotion_eligibility(
        &self,
        key: &HorizonKey,
        now: DateTime<Utc>,
    ) -> CoreResult<PromotionDecision> {
        let row = self.registry.snapshot(key)?;
        self.evaluate(&row, now).await
    }

    async fn evaluate(&self, row: &HorizonSnapshot, now: DateTime<Utc>) -> CoreResult<PromotionDecision> {
        let config = self.config.snapshot();
        let thresholds = config.thresholds_for(row.key.horizon);
        let key = &row.key;

        let window_start = now - Duration::days(thresholds.window_days);
        let active_metrics = self
            .metrics(key, &row.active.model_id, window_start, now)
            .await?;
        let shadow_metrics = match &row.shadow {
            Some(shadow) => self.metrics(key, &shadow.model_id, window_start, now).await?,
            None => PerformanceMetrics::default(),
        };

        let since = row.last_promotion_at.unwrap_or(row.created_at);
        let checks = PromotionChecks {
            cooldown: GateCheck::at_least(days_between(since, now), thresholds.cooldown_days as f64),
            sample_count: GateCheck::at_least(
                shadow_metrics.predictions as f64,
                thresholds.min_samples as f64,
            ),
            win_rate_lift: GateCheck::at_least(
                shadow_metrics.pattern_match_rate - active_metrics.pattern_match_rate,
                thresholds.min_win_rate_lift,
            ),
            sharpe_lift: GateCheck::at_least(
                shadow_metrics.sharpe_like - active_metrics.sharpe_like,
                thresholds.min_sharpe_lift,
            ),
            drawdown: GateCheck::at_most(shadow_metrics.max_drawdown, thresholds.max_dd_for_promo),
            stability: GateCheck::at_least(shadow_metrics.stability, thresholds.min_stability),
        };

        let mut reasons = Vec::new();
        let mut sustained = Vec::new();
        let shadow_model_id = row.shadow.as_ref().map(|s| s.model_id.clone());

        if shadow_model_id.is_none() {
            reasons.push("NO_SHADOW".to_string());
        }
        reasons.extend(checks.failures());

        if reasons.is_empty() {
            if let Some(shadow_id) = &shadow_model_id {
                sustained = self
                    .sustained_windows(key, &row.active.model_id, shadow_id, &config, now)
                    .await?;
                for (i, w) in sustained.iter().enumerate().filter(|(_, w)| !w.passed) {
                    reasons.push(format!(
                        "SUSTAINED_LIFT: window {} ({} .. {}) failed",
                        i + 1,
                        w.window_start.date_naive(),
                        w.window_end.date_naive()
                    ));
                }
            }
        }

        let should_promote = reasons.is_empty();
        let reason = if should_promote {
            "ALL_GATES_PASSED".to_string()
        } else {
            reasons.join("; ")
        };

        tracing::debug!(
            "Promotion check {}: should_promote={} ({})",
            key,
            should_promote,
            reason
        );

        Ok(PromotionDecision {
            key: key.clone(),
            should_promote,
            reason,
            reasons,
            checks,
            sustained,
            active_model_id: row.active.model_id.clone(),
            shadow_model_id,
            active_metrics,
            shadow_metrics,
            revision: row.revision,
        })
    }

    async fn sustained_windows(
        &self,
        key: &HorizonKey,
        active_id: &str,
        shadow_id: &str,
        config: &LifecycleConfig,
        now: DateTime<Utc>,
    ) -> CoreResult<Vec<SustainedWindowCheck>> {
        let s = &config.sustained;
        let mut windows = Vec::with_capacity(s.windows);
        for i in 0..s.windows as i64 {
            let end = now - Duration::days(i * s.window_days);
            let start = end - Duration::days(s.window_days);
            let active = self.metrics(key, active_id, start, end).await?;
            let shadow = self.metrics(key, shadow_id, start, end).await?;

            let predictions = GateCheck::at_least(shadow.predictions as f64, s.min_predictions as f64);
            let win_rate_lift = GateCheck::at_least(
                shadow.pattern_match_rate - active.pattern_match_rate,
                s.min_win_rate_lift,
            );
            let sharpe_lift =
                GateCheck::at_least(shadow.sharpe_like - active.sharpe_like, s.min_sharpe_lift);
            self.evaluations.record(EvaluationWindow::new(
                key.clone(),
                i as u32,
                start,
                end,
                active_id,
                shadow_id,
                active,
                shadow,
            ))?;
            windows.push(SustainedWindowCheck {
                window_start: start,
                window_end: end,
                passed: predictions.passed && win_rate_lift.passed && sharpe_lift.passed,
                predictions,
                win_rate_lift,
                sharpe_lift,
            });
        }
        Ok(windows)
    }

    async fn metrics(
        &self,
        key: &HorizonKey,
        model_id: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> CoreResult<PerformanceMetrics> {
        let records = self.predictions.predictions(key, model_id, from, to).await?;
        Ok(PerformanceMetrics::from_records(&records))
    }

    /// Check eligibility and promote when every gate passes.
    ///
    /// On a registry conflict the row is re-read and the gates re-evaluated
    /// once before giving up.
    pub async fn evaluate_and_promote(
        &self,
        key: &HorizonKey,
        now: DateTime<Utc>,
    ) -> CoreResult<PromotionReport> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let row = self.registry.snapshot(key)?;
            let decision = self.evaluate(&row, now).await?;

            if !decision.should_promote {
                let outcome = Decision::Held {
                    reasons: decision.reasons.clone(),
                };
                return Ok(PromotionReport { decision, outcome });
            }

            if row.frozen {
                let reason = format!(
                    "FROZEN: {}",
                    row.frozen_reason.as_deref().unwrap_or("no reason given")
                );
                tracing::warn!("Promotion on {} suppressed: {}", key, reason);
                return Ok(PromotionReport {
                    decision,
                    outcome: Decision::GovernanceLocked { reason },
                });
            }
            if let Some(reason) = self
                .governance
                .blocked_reason(key, LifecycleAction::Promote)
                .await
            {
                tracing::warn!("Promotion on {} suppressed: {}", key, reason);
                return Ok(PromotionReport {
                    decision,
                    outcome: Decision::GovernanceLocked { reason },
                });
            }

            let details = serde_json::json!({
                "win_rate_lift": decision.checks.win_rate_lift.value,
                "sharpe_lift": decision.checks.sharpe_lift.value,
                "shadow_max_drawdown": decision.checks.drawdown.value,
                "shadow_stability": decision.checks.stability.value,
                "shadow_predictions": decision.shadow_metrics.predictions,
            });
            match self
                .registry
                .promote(key, decision.revision, &decision.reason, details, now)
            {
                Ok(event) => {
                    return Ok(PromotionReport {
                        decision,
                        outcome: Decision::Executed { event },
                    })
                }
                Err(e @ CoreError::RegistryConflict { .. }) if attempt >= 2 => return Err(e),
                Err(CoreError::RegistryConflict { .. }) => continue,
                Err(e) => return Err(e),
            }
        }
    }
}

fn days_between(from: DateTime<Utc>, to: DateTime<Utc>) -> f64 {
    (to - from).num_seconds() as f64 / 86_400.0
}
