use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::CoreResult;
use crate::types::{HorizonKey, LifecycleAction, PredictionRecord, Series};

/// Supplier of ordered price history. Implemented outside the core.
#[async_trait]
pub trait SeriesStore: Send + Sync {
    async fn get_range(
        &self,
        symbol: &str,
        timeframe: &str,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
    ) -> CoreResult<Series>;

    async fn get_all(&self, symbol: &str, timeframe: &str) -> CoreResult<Series> {
        self.get_range(symbol, timeframe, None, None).await
    }
}

/// System health score in [0, 1] from an external observability layer.
#[async_trait]
pub trait ReliabilitySource: Send + Sync {
    async fn reliability(&self, context: &str) -> f64;
}

/// Resolved predictions per model variant.
#[async_trait]
pub trait PredictionSource: Send + Sync {
    /// Predictions for `model_id` resolved in `[from, to)`, oldest first.
    async fn predictions(
        &self,
        key: &HorizonKey,
        model_id: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> CoreResult<Vec<PredictionRecord>>;

    /// Every resolved prediction for the key in `[from, to)`, any model.
    async fn all_predictions(
        &self,
        key: &HorizonKey,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> CoreResult<Vec<PredictionRecord>>;
}

/// Governance input consulted before any lifecycle action is executed.
#[async_trait]
pub trait GovernanceGate: Send + Sync {
    /// `Some(reason)` when `action` is currently suppressed for `key`.
    async fn blocked_reason(&self, key: &HorizonKey, action: LifecycleAction) -> Option<String>;

    /// `Some(reason)` when governance itself demands a rollback.
    async fn rollback_trigger(&self, _key: &HorizonKey) -> Option<String> {
        None
    }
}
