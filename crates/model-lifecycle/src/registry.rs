//! Model Registry
//!
//! One row per (symbol, horizon). Every row holds exactly one ACTIVE
//! variant, at most one SHADOW and a stack of ARCHIVED variants, most
//! recently archived first.
//!
//! Rows are guarded per key by the map shard lock and versioned with a
//! `revision`: each mutating call names the revision it was evaluated
//! against and fails with `RegistryConflict` if the row moved since.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use pattern_core::{CoreError, CoreResult, HorizonKey};

use crate::events::{EventLog, LifecycleEvent, LifecycleEventType};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ModelStatus {
    Active,
    Shadow,
    Archived,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelVariant {
    pub model_id: String,
    pub key: HorizonKey,
    pub status: ModelStatus,
    pub created_at: DateTime<Utc>,
    pub promoted_at: Option<DateTime<Utc>>,
    pub archived_at: Option<DateTime<Utc>>,
    /// Only variants that once served as ACTIVE may be restored.
    pub rollback_eligible: bool,
}

impl ModelVariant {
    fn new(key: HorizonKey, model_id: String, status: ModelStatus, now: DateTime<Utc>) -> Self {
        Self {
            model_id,
            key,
            status,
            created_at: now,
            promoted_at: None,
            archived_at: None,
            rollback_eligible: false,
        }
    }

    fn archive(&mut self, now: DateTime<Utc>, rollback_eligible: bool) {
        self.status = ModelStatus::Archived;
        self.archived_at = Some(now);
        self.rollback_eligible = rollback_eligible;
    }
}

/// A consistent copy of one registry row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HorizonSnapshot {
    pub key: HorizonKey,
    pub revision: u64,
    pub frozen: bool,
    pub frozen_reason: Option<String>,
    pub active: ModelVariant,
    pub shadow: Option<ModelVariant>,
    /// Most recently archived first.
    pub archived: Vec<ModelVariant>,
    pub created_at: DateTime<Utc>,
    pub last_promotion_at: Option<DateTime<Utc>>,
    pub last_rollback_at: Option<DateTime<Utc>>,
}

impl HorizonSnapshot {
    pub fn rollback_target(&self) -> Option<&ModelVariant> {
        self.archived.iter().find(|v| v.rollback_eligible)
    }

    fn knows_model(&self, model_id: &str) -> bool {
        self.active.model_id == model_id
            || self.shadow.as_ref().map(|s| s.model_id == model_id).unwrap_or(false)
            || self.archived.iter().any(|v| v.model_id == model_id)
    }
}

/// Result of a rollback request. A rollback without an eligible archived
/// variant does nothing and emits no event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RollbackResult {
    pub rolled: bool,
    pub reason: String,
    pub event: Option<LifecycleEvent>,
}

pub struct ModelRegistry {
    rows: DashMap<HorizonKey, HorizonSnapshot>,
    events: Arc<EventLog>,
}

impl Default for ModelRegistry {
    fn default() -> Self {
        Self::new(Arc::new(EventLog::default()))
    }
}

impl ModelRegistry {
    pub fn new(events: Arc<EventLog>) -> Self {
        Self {
            rows: DashMap::new(),
            events,
        }
    }

    pub fn events(&self) -> &Arc<EventLog> {
        &self.events
    }

    pub fn keys(&self) -> Vec<HorizonKey> {
        let mut keys: Vec<HorizonKey> = self.rows.iter().map(|r| r.key().clone()).collect();
        keys.sort();
        keys
    }

    pub fn snapshot(&self, key: &HorizonKey) -> CoreResult<HorizonSnapshot> {
        self.rows
            .get(key)
            .map(|row| row.value().clone())
            .ok_or_else(|| CoreError::UnknownHorizon(key.clone()))
    }

    /// ∅ → ACTIVE for a horizon that has no row yet.
    pub fn bootstrap(
        &self,
        key: &HorizonKey,
        model_id: &str,
        now: DateTime<Utc>,
    ) -> CoreResult<LifecycleEvent> {
        match self.rows.entry(key.clone()) {
            Entry::Occupied(_) => Err(CoreError::ForbiddenTransition {
                key: key.clone(),
                reason: "horizon already has an ACTIVE variant".to_string(),
            }),
            Entry::Vacant(slot) => {
                let mut active =
                    ModelVariant::new(key.clone(), model_id.to_string(), ModelStatus::Active, now);
                active.promoted_at = Some(now);
                slot.insert(HorizonSnapshot {
                    key: key.clone(),
                    revision: 1,
                    frozen: false,
                    frozen_reason: None,
                    active,
                    shadow: None,
                    archived: Vec::new(),
                    created_at: now,
                    last_promotion_at: None,
                    last_rollback_at: None,
                });
                let event = LifecycleEvent::new(
                    LifecycleEventType::Bootstrapped,
                    key.clone(),
                    None,
                    Some(model_id.to_string()),
                    "initial active variant",
                    now,
                );
                self.emit(event)
            }
        }
    }

    /// ∅ → SHADOW. Rejected while a shadow exists.
    pub fn create_shadow(
        &self,
        key: &HorizonKey,
        model_id: &str,
        expected_revision: u64,
        now: DateTime<Utc>,
    ) -> CoreResult<LifecycleEvent> {
        let mut row = self.checked_row(key, expected_revision)?;
        if row.shadow.is_some() {
            return Err(forbidden(key, "a SHADOW variant already exists"));
        }
        if row.knows_model(model_id) {
            return Err(forbidden(key, format!("model '{}' is already registered", model_id)));
        }
        row.shadow = Some(ModelVariant::new(
            key.clone(),
            model_id.to_string(),
            ModelStatus::Shadow,
            now,
        ));
        row.revision += 1;

        let event = LifecycleEvent::new(
            LifecycleEventType::ShadowCreated,
            key.clone(),
            None,
            Some(model_id.to_string()),
            "shadow created",
            now,
        );
        self.emit(event)
    }

    /// SHADOW → ACTIVE, previous ACTIVE → ARCHIVED, in one step.
    pub fn promote(
        &self,
        key: &HorizonKey,
        expected_revision: u64,
        reason: &str,
        details: serde_json::Value,
        now: DateTime<Utc>,
    ) -> CoreResult<LifecycleEvent> {
        let mut row = self.checked_row(key, expected_revision)?;
        ensure_not_frozen(&row)?;
        let mut shadow = row
            .shadow
            .take()
            .ok_or_else(|| forbidden(key, "no SHADOW variant to promote"))?;

        shadow.status = ModelStatus::Active;
        shadow.promoted_at = Some(now);
        let mut previous = std::mem::replace(&mut row.active, shadow);
        previous.archive(now, true);
        let from = previous.model_id.clone();
        let to = row.active.model_id.clone();
        row.archived.insert(0, previous);
        row.last_promotion_at = Some(now);
        row.revision += 1;

        tracing::info!("Promoted {} on {}: {} -> {}", to, key, from, to);
        let event = LifecycleEvent::new(
            LifecycleEventType::Promoted,
            key.clone(),
            Some(from),
            Some(to),
            reason,
            now,
        )
        .with_details(details);
        self.emit(event)
    }

    /// ACTIVE → ARCHIVED, most recent eligible ARCHIVED → ACTIVE.
    ///
    /// The demoted variant is archived as not rollback-eligible so a second
    /// rollback cannot restore the variant that just failed.
    pub fn rollback(
        &self,
        key: &HorizonKey,
        expected_revision: u64,
        reason: &str,
        details: serde_json::Value,
        now: DateTime<Utc>,
    ) -> CoreResult<RollbackResult> {
        let mut row = self.checked_row(key, expected_revision)?;
        ensure_not_frozen(&row)?;
        let Some(pos) = row.archived.iter().position(|v| v.rollback_eligible) else {
            tracing::warn!("Rollback on {} skipped: rolled=false reason=NO_ARCHIVE", key);
            return Ok(RollbackResult {
                rolled: false,
                reason: "NO_ARCHIVE".to_string(),
                event: None,
            });
        };

        let mut restored = row.archived.remove(pos);
        restored.status = ModelStatus::Active;
        restored.archived_at = None;
        restored.promoted_at = Some(now);
        let mut failed = std::mem::replace(&mut row.active, restored);
        failed.archive(now, false);
        let from = failed.model_id.clone();
        let to = row.active.model_id.clone();
        row.archived.insert(0, failed);
        row.last_rollback_at = Some(now);
        row.revision += 1;

        tracing::info!("Rolled back {}: {} -> {} ({})", key, from, to, reason);
        let event = LifecycleEvent::new(
            LifecycleEventType::RolledBack,
            key.clone(),
            Some(from),
            Some(to),
            reason,
            now,
        )
        .with_details(details);
        let event = self.emit(event)?;
        Ok(RollbackResult {
            rolled: true,
            reason: reason.to_string(),
            event: Some(event),
        })
    }

    /// Replace the current SHADOW with a freshly trained variant. The
    /// discarded shadow never served, so it is not rollback-eligible.
    pub fn retrain_shadow(
        &self,
        key: &HorizonKey,
        model_id: &str,
        expected_revision: u64,
        reason: &str,
        now: DateTime<Utc>,
    ) -> CoreResult<LifecycleEvent> {
        let mut row = self.checked_row(key, expected_revision)?;
        ensure_not_frozen(&row)?;
        if row.knows_model(model_id) {
            return Err(forbidden(key, format!("model '{}' is already registered", model_id)));
        }
        let mut discarded = row
            .shadow
            .take()
            .ok_or_else(|| forbidden(key, "no SHADOW variant to retrain"))?;
        discarded.archive(now, false);
        let from = discarded.model_id.clone();
        row.archived.insert(0, discarded);
        row.shadow = Some(ModelVariant::new(
            key.clone(),
            model_id.to_string(),
            ModelStatus::Shadow,
            now,
        ));
        row.revision += 1;

        let event = LifecycleEvent::new(
            LifecycleEventType::Retrained,
            key.clone(),
            Some(from),
            Some(model_id.to_string()),
            reason,
            now,
        );
        self.emit(event)
    }

    pub fn freeze(
        &self,
        key: &HorizonKey,
        expected_revision: u64,
        reason: &str,
        now: DateTime<Utc>,
    ) -> CoreResult<LifecycleEvent> {
        let mut row = self.checked_row(key, expected_revision)?;
        if row.frozen {
            return Err(forbidden(key, "horizon is already frozen"));
        }
        row.frozen = true;
        row.frozen_reason = Some(reason.to_string());
        row.revision += 1;

        tracing::warn!("Froze {}: {}", key, reason);
        let event = LifecycleEvent::new(
            LifecycleEventType::Frozen,
            key.clone(),
            None,
            None,
            reason,
            now,
        );
        self.emit(event)
    }

    pub fn unfreeze(
        &self,
        key: &HorizonKey,
        expected_revision: u64,
        reason: &str,
        now: DateTime<Utc>,
    ) -> CoreResult<LifecycleEvent> {
        let mut row = self.checked_row(key, expected_revision)?;
        if !row.frozen {
            return Err(forbidden(key, "horizon is not frozen"));
        }
        row.frozen = false;
        row.frozen_reason = None;
        row.revision += 1;

        tracing::info!("Unfroze {}: {}", key, reason);
        let event = LifecycleEvent::new(
            LifecycleEventType::Unfrozen,
            key.clone(),
            None,
            None,
            reason,
            now,
        );
        self.emit(event)
    }

    fn checked_row(
        &self,
        key: &HorizonKey,
        expected_revision: u64,
    ) -> CoreResult<dashmap::mapref::one::RefMut<'_, HorizonKey, HorizonSnapshot>> {
        let row = self
            .rows
            .get_mut(key)
            .ok_or_else(|| CoreError::UnknownHorizon(key.clone()))?;
        if row.revision != expected_revision {
            tracing::warn!(
                "Registry conflict on {}: expected revision {}, found {}",
                key,
                expected_revision,
                row.revision
            );
            return Err(CoreError::RegistryConflict {
                key: key.clone(),
                expected: expected_revision,
                actual: row.revision,
            });
        }
        Ok(row)
    }

    fn emit(&self, event: LifecycleEvent) -> CoreResult<LifecycleEvent> {
        self.events.append(event.clone())?;
        Ok(event)
    }
}

fn forbidden(key: &HorizonKey, reason: impl Into<String>) -> CoreError {
    CoreError::ForbiddenTransition {
        key: key.clone(),
        reason: reason.into(),
    }
}

fn ensure_not_frozen(row: &HorizonSnapshot) -> CoreResult<()> {
    if row.frozen {
        return Err(forbidden(
            &row.key,
            format!(
                "horizon is frozen: {}",
                row.frozen_reason.as_deref().unwrap_or("no reason given")
            ),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use pattern_core::Horizon;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
    }

    fn key() -> HorizonKey {
        HorizonKey::new("BTC", Horizon::days(7))
    }

    fn assert_invariant(row: &HorizonSnapshot) {
        assert_eq!(row.active.status, ModelStatus::Active);
        if let Some(shadow) = &row.shadow {
            assert_eq!(shadow.status, ModelStatus::Shadow);
        }
        assert!(row.archived.iter().all(|v| v.status == ModelStatus::Archived));
    }

    #[test]
    fn test_bootstrap_once() {
        let registry = ModelRegistry::default();
        registry.bootstrap(&key(), "v1", t0()).unwrap();
        assert!(matches!(
            registry.bootstrap(&key(), "v1b", t0()),
            Err(CoreError::ForbiddenTransition { .. })
        ));
        let row = registry.snapshot(&key()).unwrap();
        assert_eq!(row.active.model_id, "v1");
        assert_eq!(row.revision, 1);
        assert_invariant(&row);
    }

    #[test]
    fn test_unknown_horizon() {
        let registry = ModelRegistry::default();
        assert!(matches!(
            registry.snapshot(&key()),
            Err(CoreError::UnknownHorizon(_))
        ));
    }

    #[test]
    fn test_single_shadow() {
        let registry = ModelRegistry::default();
        registry.bootstrap(&key(), "v1", t0()).unwrap();
        registry.create_shadow(&key(), "v2", 1, t0()).unwrap();
        assert!(matches!(
            registry.create_shadow(&key(), "v3", 2, t0()),
            Err(CoreError::ForbiddenTransition { .. })
        ));
        assert_invariant(&registry.snapshot(&key()).unwrap());
    }

    #[test]
    fn test_stale_revision_conflicts() {
        let registry = ModelRegistry::default();
        registry.bootstrap(&key(), "v1", t0()).unwrap();
        registry.create_shadow(&key(), "v2", 1, t0()).unwrap();
        let err = registry
            .promote(&key(), 1, "stale", serde_json::Value::Null, t0())
            .unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(registry.snapshot(&key()).unwrap().active.model_id, "v1");
    }

    #[test]
    fn test_promote_then_rollback() {
        let registry = ModelRegistry::default();
        registry.bootstrap(&key(), "v1", t0()).unwrap();
        registry.create_shadow(&key(), "v2", 1, t0()).unwrap();
        let later = t0() + Duration::days(30);
        let event = registry
            .promote(&key(), 2, "ALL_GATES_PASSED", serde_json::json!({"win_rate_lift": 0.05}), later)
            .unwrap();
        assert_eq!(event.from_model_id.as_deref(), Some("v1"));
        assert_eq!(event.to_model_id.as_deref(), Some("v2"));

        let row = registry.snapshot(&key()).unwrap();
        assert_invariant(&row);
        assert!(row.shadow.is_none());
        assert_eq!(row.rollback_target().map(|v| v.model_id.as_str()), Some("v1"));
        assert_eq!(row.last_promotion_at, Some(later));

        let result = registry
            .rollback(&key(), row.revision, "WIN_RATE_FLOOR", serde_json::Value::Null, later)
            .unwrap();
        assert!(result.rolled);
        let row = registry.snapshot(&key()).unwrap();
        assert_invariant(&row);
        assert_eq!(row.active.model_id, "v1");
        // the failed variant cannot be restored again
        assert!(row.rollback_target().is_none());

        let types: Vec<LifecycleEventType> =
            registry.events().events().iter().map(|e| e.event_type).collect();
        assert_eq!(
            types,
            vec![
                LifecycleEventType::Bootstrapped,
                LifecycleEventType::ShadowCreated,
                LifecycleEventType::Promoted,
                LifecycleEventType::RolledBack,
            ]
        );
    }

    #[test]
    fn test_rollback_without_archive_is_noop() {
        let registry = ModelRegistry::default();
        registry.bootstrap(&key(), "v1", t0()).unwrap();
        let result = registry
            .rollback(&key(), 1, "WIN_RATE_FLOOR", serde_json::Value::Null, t0())
            .unwrap();
        assert!(!result.rolled);
        assert_eq!(result.reason, "NO_ARCHIVE");
        assert!(result.event.is_none());
        let row = registry.snapshot(&key()).unwrap();
        assert_eq!(row.revision, 1);
        assert_eq!(registry.events().len(), 1);
    }

    #[test]
    fn test_retrain_archives_shadow_as_ineligible() {
        let registry = ModelRegistry::default();
        registry.bootstrap(&key(), "v1", t0()).unwrap();
        registry.create_shadow(&key(), "v2", 1, t0()).unwrap();
        let event = registry.retrain_shadow(&key(), "v3", 2, "weekly retrain", t0()).unwrap();
        assert_eq!(event.event_type, LifecycleEventType::Retrained);

        let row = registry.snapshot(&key()).unwrap();
        assert_invariant(&row);
        assert_eq!(row.shadow.as_ref().map(|s| s.model_id.as_str()), Some("v3"));
        assert_eq!(row.archived.len(), 1);
        assert!(!row.archived[0].rollback_eligible);
        assert!(row.rollback_target().is_none());
    }

    #[test]
    fn test_frozen_horizon_rejects_transitions() {
        let registry = ModelRegistry::default();
        registry.bootstrap(&key(), "v1", t0()).unwrap();
        registry.create_shadow(&key(), "v2", 1, t0()).unwrap();
        registry.freeze(&key(), 2, "manual review", t0()).unwrap();
        assert!(registry.freeze(&key(), 3, "again", t0()).is_err());
        assert!(matches!(
            registry.promote(&key(), 3, "x", serde_json::Value::Null, t0()),
            Err(CoreError::ForbiddenTransition { .. })
        ));
        registry.unfreeze(&key(), 3, "review done", t0()).unwrap();
        registry
            .promote(&key(), 4, "x", serde_json::Value::Null, t0())
            .unwrap();
        assert_eq!(registry.snapshot(&key()).unwrap().active.model_id, "v2");
    }

    #[test]
    fn test_concurrent_shadow_creation_admits_one() {
        let registry = Arc::new(ModelRegistry::default());
        registry.bootstrap(&key(), "v1", t0()).unwrap();

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let registry = Arc::clone(&registry);
                std::thread::spawn(move || {
                    registry
                        .create_shadow(&key(), &format!("s{}", i), 1, t0())
                        .is_ok()
                })
            })
            .collect();
        let created = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|ok| *ok)
            .count();
        assert_eq!(created, 1);
        assert_invariant(&registry.snapshot(&key()).unwrap());
    }
}
