//! Auto-Rollback Engine
//!
//! Any single breached safety trigger rolls the active variant back to the
//! most recently archived eligible one. Evaluated over a shorter window and
//! with a shorter cooldown than promotion.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use pattern_core::{
    ConfigHandle, CoreError, CoreResult, GovernanceGate, HorizonKey, LifecycleAction,
    PerformanceMetrics, PredictionSource,
};

use crate::config::LifecycleConfig;
use crate::gate::{Decision, GateCheck};
use crate::registry::{HorizonSnapshot, ModelRegistry};

/// A trigger fires when its check did not pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RollbackChecks {
    pub win_rate: GateCheck,
    pub drawdown: GateCheck,
    pub stability: GateCheck,
    pub consecutive_losses: GateCheck,
    /// Set when governance demands a rollback on its own.
    pub governance_trigger: Option<String>,
}

impl RollbackChecks {
    pub fn triggers(&self) -> Vec<String> {
        let mut out = Vec::new();
        if !self.win_rate.passed {
            out.push(format!(
                "WIN_RATE_FLOOR: {:.4} < {:.4}",
                self.win_rate.value, self.win_rate.threshold
            ));
        }
        if !self.drawdown.passed {
            out.push(format!(
                "MAX_DRAWDOWN: {:.2} > {:.2}",
                self.drawdown.value, self.drawdown.threshold
            ));
        }
        if !self.stability.passed {
            out.push(format!(
                "STABILITY: {:.4} < {:.4}",
                self.stability.value, self.stability.threshold
            ));
        }
        if !self.consecutive_losses.passed {
            out.push(format!(
                "CONSECUTIVE_LOSSES: {} > {}",
                self.consecutive_losses.value, self.consecutive_losses.threshold
            ));
        }
        if let Some(reason) = &self.governance_trigger {
            out.push(format!("GOVERNANCE: {}", reason));
        }
        out
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RollbackDecision {
    pub key: HorizonKey,
    pub should_rollback: bool,
    pub reason: String,
    pub reasons: Vec<String>,
    pub checks: RollbackChecks,
    pub sample_count: GateCheck,
    pub cooldown: GateCheck,
    pub active_model_id: String,
    pub metrics: PerformanceMetrics,
    pub revision: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RollbackReport {
    pub decision: RollbackDecision,
    pub outcome: Decision,
}

pub struct RollbackEngine {
    registry: Arc<ModelRegistry>,
    predictions: Arc<dyn PredictionSource>,
    governance: Arc<dyn GovernanceGate>,
    config: ConfigHandle<LifecycleConfig>,
}

impl RollbackEngine {
    pub fn new(
        registry: Arc<ModelRegistry>,
        predictions: Arc<dyn PredictionSource>,
        governance: Arc<dyn GovernanceGate>,
        config: ConfigHandle<LifecycleConfig>,
    ) -> Self {
        Self {
            registry,
            predictions,
            governance,
            config,
        }
    }

    pub async fn check_rollback(
        &self,
        key: &HorizonKey,
        now: DateTime<Utc>,
    ) -> CoreResult<RollbackDecision> {
        let row = self.registry.snapshot(key)?;
        self.evaluate(&row, now).await
    }

    async fn evaluate(&self, row: &HorizonSnapshot, now: DateTime<Utc>) -> CoreResult<RollbackDecision> {
        let config = self.config.snapshot();
        let r = &config.rollback;
        let key = &row.key;

        let from = now - Duration::days(r.window_days);
        let records = self
            .predictions
            .predictions(key, &row.active.model_id, from, now)
            .await?;
        let metrics = PerformanceMetrics::from_records(&records);

        let checks = RollbackChecks {
            win_rate: GateCheck::at_least(metrics.pattern_match_rate, r.win_rate_floor),
            drawdown: GateCheck::at_most(metrics.max_drawdown, r.max_drawdown_ceil),
            stability: GateCheck::at_least(metrics.stability, r.min_stability),
            consecutive_losses: GateCheck::at_most(
                metrics.consecutive_losses as f64,
                r.max_consecutive_losses as f64,
            ),
            governance_trigger: self.governance.rollback_trigger(key).await,
        };
        let sample_count = GateCheck::at_least(metrics.predictions as f64, r.min_samples as f64);
        let since = row.last_rollback_at.unwrap_or(row.created_at);
        let cooldown = GateCheck::at_least(
            (now - since).num_seconds() as f64 / 86_400.0,
            r.cooldown_days as f64,
        );

        let triggers = checks.triggers();
        let mut reasons = Vec::new();
        if !sample_count.passed {
            reasons.push(format!(
                "INSUFFICIENT_SAMPLES: {} < {}",
                sample_count.value, sample_count.threshold
            ));
        }
        if !cooldown.passed {
            reasons.push(format!(
                "COOLDOWN: {:.2} < {:.2} days",
                cooldown.value, cooldown.threshold
            ));
        }

        let should_rollback = reasons.is_empty() && !triggers.is_empty();
        let reason = if should_rollback {
            triggers.join("; ")
        } else if triggers.is_empty() {
            reasons.push("NO_TRIGGER".to_string());
            reasons.join("; ")
        } else {
            reasons.join("; ")
        };
        if should_rollback {
            reasons = triggers;
        }

        tracing::debug!(
            "Rollback check {}: should_rollback={} ({})",
            key,
            should_rollback,
            reason
        );

        Ok(RollbackDecision {
            key: key.clone(),
            should_rollback,
            reason,
            reasons,
            checks,
            sample_count,
            cooldown,
            active_model_id: row.active.model_id.clone(),
            metrics,
            revision: row.revision,
        })
    }

    /// Check the triggers and roll back when any fires.
    pub async fn evaluate_and_rollback(
        &self,
        key: &HorizonKey,
        now: DateTime<Utc>,
    ) -> CoreResult<RollbackReport> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let row = self.registry.snapshot(key)?;
            let decision = self.evaluate(&row, now).await?;

            if !decision.should_rollback {
                let outcome = Decision::Held {
                    reasons: decision.reasons.clone(),
                };
                return Ok(RollbackReport { decision, outcome });
            }

            let locked = if row.frozen {
                Some(format!(
                    "FROZEN: {}",
                    row.frozen_reason.as_deref().unwrap_or("no reason given")
                ))
            } else {
                self.governance
                    .blocked_reason(key, LifecycleAction::Rollback)
                    .await
            };
            if let Some(reason) = locked {
                tracing::warn!("Rollback on {} suppressed: {}", key, reason);
                return Ok(RollbackReport {
                    decision,
                    outcome: Decision::GovernanceLocked { reason },
                });
            }

            let details = serde_json::json!({
                "win_rate": decision.checks.win_rate.value,
                "max_drawdown": decision.checks.drawdown.value,
                "stability": decision.checks.stability.value,
                "consecutive_losses": decision.metrics.consecutive_losses,
                "predictions": decision.metrics.predictions,
            });
            match self
                .registry
                .rollback(key, decision.revision, &decision.reason, details, now)
            {
                Ok(result) => {
                    let outcome = match result.event {
                        Some(event) => Decision::Executed { event },
                        None => Decision::NoOp {
                            reason: result.reason,
                        },
                    };
                    return Ok(RollbackReport { decision, outcome });
                }
                Err(e @ CoreError::RegistryConflict { .. }) if attempt >= 2 => return Err(e),
                Err(CoreError::RegistryConflict { .. }) => continue,
                Err(e) => return Err(e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::TimeZone;
    use pattern_core::{Horizon, InMemoryPredictionLedger, OpenGovernance, PredictionRecord};

    struct DriftGate {
        block: bool,
        trigger: bool,
    }

    #[async_trait]
    impl GovernanceGate for DriftGate {
        async fn blocked_reason(&self, _key: &HorizonKey, action: LifecycleAction) -> Option<String> {
            (self.block && action == LifecycleAction::Rollback).then(|| "LOCKDOWN".to_string())
        }

        async fn rollback_trigger(&self, _key: &HorizonKey) -> Option<String> {
            self.trigger.then(|| "CRITICAL drift".to_string())
        }
    }

    fn key() -> HorizonKey {
        HorizonKey::new("QQQ", Horizon::days(3))
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 2, 1, 0, 0, 0).unwrap()
    }

    fn now() -> DateTime<Utc> {
        t0() + Duration::days(30)
    }

    /// Predictions for `model` spread over the 7 days before `now()`.
    fn ledger_with(model: &str, pattern: &[bool]) -> Arc<InMemoryPredictionLedger> {
        let ledger = Arc::new(InMemoryPredictionLedger::new());
        let span = Duration::days(7).num_seconds();
        for (i, hit) in pattern.iter().enumerate() {
            let resolved = now() - Duration::seconds(span)
                + Duration::seconds(span * i as i64 / pattern.len() as i64 + 60);
            ledger
                .record(PredictionRecord {
                    id: format!("{}-{}", model, i),
                    key: key(),
                    model_id: model.to_string(),
                    made_at: resolved - Duration::days(3),
                    resolved_at: resolved,
                    confidence: 0.6,
                    realized_return: if *hit { 1.5 } else { -1.0 },
                    hit: *hit,
                })
                .unwrap();
        }
        ledger
    }

    /// 20 predictions alternating miss / hit: win rate exactly 0.5.
    fn alternating() -> Vec<bool> {
        (0..20).map(|i| i % 2 == 1).collect()
    }

    /// v1 archived, v2 active.
    fn promoted_registry() -> Arc<ModelRegistry> {
        let registry = Arc::new(ModelRegistry::default());
        registry.bootstrap(&key(), "v1", t0()).unwrap();
        registry.create_shadow(&key(), "v2", 1, t0()).unwrap();
        registry
            .promote(&key(), 2, "ALL_GATES_PASSED", serde_json::Value::Null, t0())
            .unwrap();
        registry
    }

    fn build_engine(
        registry: &Arc<ModelRegistry>,
        ledger: Arc<InMemoryPredictionLedger>,
        config: LifecycleConfig,
        governance: Arc<dyn GovernanceGate>,
    ) -> RollbackEngine {
        RollbackEngine::new(
            Arc::clone(registry),
            ledger,
            governance,
            ConfigHandle::new(config).unwrap(),
        )
    }

    fn config_with_floor(floor: f64) -> LifecycleConfig {
        let mut config = LifecycleConfig::default();
        config.rollback.win_rate_floor = floor;
        config
    }

    #[tokio::test]
    async fn test_win_rate_at_floor_does_not_trigger() {
        let registry = promoted_registry();
        let engine = build_engine(
            &registry,
            ledger_with("v2", &alternating()),
            config_with_floor(0.5),
            Arc::new(OpenGovernance),
        );
        let decision = engine.check_rollback(&key(), now()).await.unwrap();
        assert_eq!(decision.checks.win_rate.value, 0.5);
        assert!(decision.checks.win_rate.passed);
        assert!(!decision.should_rollback);
        assert_eq!(decision.reasons, vec!["NO_TRIGGER".to_string()]);
    }

    #[tokio::test]
    async fn test_win_rate_below_floor_alone_triggers() {
        let registry = promoted_registry();
        let engine = build_engine(
            &registry,
            ledger_with("v2", &alternating()),
            config_with_floor(0.55),
            Arc::new(OpenGovernance),
        );
        let report = engine.evaluate_and_rollback(&key(), now()).await.unwrap();
        assert!(report.decision.checks.drawdown.passed);
        assert!(report.decision.checks.stability.passed);
        assert!(report.decision.checks.consecutive_losses.passed);
        assert_eq!(report.decision.reasons.len(), 1);
        assert!(report.decision.reasons[0].starts_with("WIN_RATE_FLOOR"));
        assert!(report.outcome.executed());

        let row = registry.snapshot(&key()).unwrap();
        assert_eq!(row.active.model_id, "v1");
        assert_eq!(row.archived[0].model_id, "v2");
    }

    #[tokio::test]
    async fn test_each_trigger_alone_triggers() {
        let tweaks: Vec<(&str, Box<dyn Fn(&mut LifecycleConfig)>)> = vec![
            ("MAX_DRAWDOWN", Box::new(|c: &mut LifecycleConfig| c.rollback.max_drawdown_ceil = 0.5)),
            ("STABILITY", Box::new(|c: &mut LifecycleConfig| c.rollback.min_stability = 0.9)),
        ];
        for (name, tweak) in tweaks {
            let registry = promoted_registry();
            let mut config = LifecycleConfig::default();
            tweak(&mut config);
            let engine = build_engine(
                &registry,
                ledger_with("v2", &alternating()),
                config,
                Arc::new(OpenGovernance),
            );
            let decision = engine.check_rollback(&key(), now()).await.unwrap();
            assert!(decision.should_rollback, "{} should trigger", name);
            assert_eq!(decision.reasons.len(), 1, "{:?}", decision.reasons);
            assert!(decision.reasons[0].starts_with(name));
        }
    }

    #[tokio::test]
    async fn test_consecutive_losses_boundary() {
        // 10 hits of 21, ending in three misses
        let mut pattern: Vec<bool> = (0..16).map(|i| i % 2 == 0).collect();
        pattern.extend([true, true, false, false, false]);

        let registry = promoted_registry();
        let mut config = LifecycleConfig::default();
        config.rollback.max_consecutive_losses = 3;
        let engine = build_engine(&registry, ledger_with("v2", &pattern), config, Arc::new(OpenGovernance));
        let decision = engine.check_rollback(&key(), now()).await.unwrap();
        assert_eq!(decision.metrics.consecutive_losses, 3);
        assert!(!decision.should_rollback);

        let mut config = LifecycleConfig::default();
        config.rollback.max_consecutive_losses = 2;
        let engine = build_engine(&registry, ledger_with("v2", &pattern), config, Arc::new(OpenGovernance));
        let decision = engine.check_rollback(&key(), now()).await.unwrap();
        assert!(decision.should_rollback);
        assert_eq!(decision.reasons.len(), 1, "{:?}", decision.reasons);
        assert!(decision.reasons[0].starts_with("CONSECUTIVE_LOSSES"));
    }

    #[tokio::test]
    async fn test_too_few_samples_never_rolls_back() {
        let registry = promoted_registry();
        let engine = build_engine(
            &registry,
            ledger_with("v2", &[false; 5]),
            LifecycleConfig::default(),
            Arc::new(OpenGovernance),
        );
        let report = engine.evaluate_and_rollback(&key(), now()).await.unwrap();
        assert!(!report.decision.should_rollback);
        assert!(report.decision.reason.starts_with("INSUFFICIENT_SAMPLES"));
        assert_eq!(registry.snapshot(&key()).unwrap().active.model_id, "v2");
    }

    #[tokio::test]
    async fn test_cooldown_prevents_thrashing() {
        let registry = promoted_registry();
        let bad = ledger_with("v2", &[false; 20]);
        let engine = build_engine(&registry, bad, LifecycleConfig::default(), Arc::new(OpenGovernance));
        assert!(engine.evaluate_and_rollback(&key(), now()).await.unwrap().outcome.executed());

        let engine = build_engine(
            &registry,
            ledger_with("v1", &[false; 20]),
            LifecycleConfig::default(),
            Arc::new(OpenGovernance),
        );
        let report = engine.evaluate_and_rollback(&key(), now()).await.unwrap();
        assert!(!report.decision.should_rollback);
        assert!(!report.decision.cooldown.passed);
    }

    #[tokio::test]
    async fn test_no_archive_is_noop() {
        let registry = Arc::new(ModelRegistry::default());
        registry.bootstrap(&key(), "v2", t0()).unwrap();
        let engine = build_engine(
            &registry,
            ledger_with("v2", &[false; 20]),
            LifecycleConfig::default(),
            Arc::new(OpenGovernance),
        );
        let report = engine.evaluate_and_rollback(&key(), now()).await.unwrap();
        assert!(report.decision.should_rollback);
        assert_eq!(
            report.outcome,
            Decision::NoOp {
                reason: "NO_ARCHIVE".to_string()
            }
        );
    }

    #[tokio::test]
    async fn test_governance_lock_and_trigger() {
        let registry = promoted_registry();
        let engine = build_engine(
            &registry,
            ledger_with("v2", &[false; 20]),
            LifecycleConfig::default(),
            Arc::new(DriftGate {
                block: true,
                trigger: false,
            }),
        );
        let report = engine.evaluate_and_rollback(&key(), now()).await.unwrap();
        assert!(matches!(report.outcome, Decision::GovernanceLocked { .. }));
        assert_eq!(registry.snapshot(&key()).unwrap().active.model_id, "v2");

        let engine = build_engine(
            &registry,
            ledger_with("v2", &alternating()),
            LifecycleConfig::default(),
            Arc::new(DriftGate {
                block: false,
                trigger: true,
            }),
        );
        let report = engine.evaluate_and_rollback(&key(), now()).await.unwrap();
        assert_eq!(report.decision.reasons, vec!["GOVERNANCE: CRITICAL drift".to_string()]);
        assert!(report.outcome.executed());
    }
}
