//! In-process implementations of the collaborator traits.
//!
//! Used by the agent when series come from a file and by tests as doubles.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::{CoreError, CoreResult};
use crate::traits::{GovernanceGate, PredictionSource, ReliabilitySource, SeriesStore};
use crate::types::{HorizonKey, LifecycleAction, PredictionRecord, Series};

#[derive(Default)]
pub struct InMemorySeriesStore {
    series: RwLock<HashMap<(String, String), Series>>,
}

impl InMemorySeriesStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, symbol: &str, timeframe: &str, series: Series) -> CoreResult<()> {
        let mut guard = self
            .series
            .write()
            .map_err(|_| CoreError::Storage("series store lock poisoned".to_string()))?;
        guard.insert(
            (symbol.to_ascii_uppercase(), timeframe.to_string()),
            series,
        );
        Ok(())
    }
}

#[async_trait]
impl SeriesStore for InMemorySeriesStore {
    async fn get_range(
        &self,
        symbol: &str,
        timeframe: &str,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
    ) -> CoreResult<Series> {
        let guard = self
            .series
            .read()
            .map_err(|_| CoreError::Storage("series store lock poisoned".to_string()))?;
        let series = guard
            .get(&(symbol.to_ascii_uppercase(), timeframe.to_string()))
            .ok_or_else(|| {
                CoreError::InsufficientData(format!("no series for {} {}", symbol, timeframe))
            })?;
        Ok(series.range(from, to))
    }
}

/// Fixed reliability, for deployments without an observability feed.
#[derive(Debug, Clone, Copy)]
pub struct StaticReliability(pub f64);

#[async_trait]
impl ReliabilitySource for StaticReliability {
    async fn reliability(&self, _context: &str) -> f64 {
        self.0.clamp(0.0, 1.0)
    }
}

/// Governance that never blocks anything.
#[derive(Debug, Clone, Copy, Default)]
pub struct OpenGovernance;

#[async_trait]
impl GovernanceGate for OpenGovernance {
    async fn blocked_reason(&self, _key: &HorizonKey, _action: LifecycleAction) -> Option<String> {
        None
    }
}

#[derive(Default)]
pub struct InMemoryPredictionLedger {
    records: RwLock<Vec<PredictionRecord>>,
}

impl InMemoryPredictionLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, record: PredictionRecord) -> CoreResult<()> {
        let mut guard = self
            .records
            .write()
            .map_err(|_| CoreError::Storage("prediction ledger lock poisoned".to_string()))?;
        // Idempotent on id
        if guard.iter().any(|r| r.id == record.id) {
            return Ok(());
        }
        guard.push(record);
        guard.sort_by_key(|r| r.resolved_at);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.records.read().map(|g| g.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn select<F>(&self, filter: F) -> CoreResult<Vec<PredictionRecord>>
    where
        F: Fn(&PredictionRecord) -> bool,
    {
        let guard = self
            .records
            .read()
            .map_err(|_| CoreError::Storage("prediction ledger lock poisoned".to_string()))?;
        Ok(guard.iter().filter(|r| filter(r)).cloned().collect())
    }
}

#[async_trait]
impl PredictionSource for InMemoryPredictionLedger {
    async fn predictions(
        &self,
        key: &HorizonKey,
        model_id: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> CoreResult<Vec<PredictionRecord>> {
        self.select(|r| {
            &r.key == key && r.model_id == model_id && r.resolved_at >= from && r.resolved_at < to
        })
    }

    async fn all_predictions(
        &self,
        key: &HorizonKey,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> CoreResult<Vec<PredictionRecord>> {
        self.select(|r| &r.key == key && r.resolved_at >= from && r.resolved_at < to)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Candle, Horizon};
    use chrono::{Duration, TimeZone};

    fn record(id: &str, model: &str, day: i64) -> PredictionRecord {
        let base = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        PredictionRecord {
            id: id.to_string(),
            key: HorizonKey::new("BTC", Horizon::days(7)),
            model_id: model.to_string(),
            made_at: base + Duration::days(day - 7),
            resolved_at: base + Duration::days(day),
            confidence: 0.6,
            realized_return: 1.0,
            hit: true,
        }
    }

    #[tokio::test]
    async fn test_ledger_filters_by_model_and_window() {
        let ledger = InMemoryPredictionLedger::new();
        ledger.record(record("a", "m1", 1)).unwrap();
        ledger.record(record("b", "m1", 5)).unwrap();
        ledger.record(record("c", "m2", 5)).unwrap();
        ledger.record(record("a", "m1", 1)).unwrap();
        assert_eq!(ledger.len(), 3);

        let base = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let key = HorizonKey::new("BTC", Horizon::days(7));
        let got = ledger
            .predictions(&key, "m1", base + Duration::days(2), base + Duration::days(10))
            .await
            .unwrap();
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].id, "b");
    }

    #[tokio::test]
    async fn test_series_store_missing_symbol_is_insufficient_data() {
        let store = InMemorySeriesStore::new();
        let err = store.get_all("ETH", "1d").await.unwrap_err();
        assert!(matches!(err, CoreError::InsufficientData(_)));

        let ts = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let series = Series::new(vec![Candle::point(ts, 1.0)]).unwrap();
        store.insert("eth", "1d", series).unwrap();
        assert_eq!(store.get_all("ETH", "1d").await.unwrap().len(), 1);
    }
}
