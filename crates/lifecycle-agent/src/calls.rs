//! Turns calibrated forecasts into directional calls and resolves them
//! against the series once their horizon has elapsed.

use std::collections::HashSet;
use std::sync::Mutex;

use chrono::{DateTime, Duration, Utc};

use confidence_calibrator::CalibratedForecast;
use pattern_core::{
    CoreError, CoreResult, HorizonKey, InMemoryPredictionLedger, PredictionRecord, Series,
};

#[derive(Debug, Clone, PartialEq)]
pub struct PendingCall {
    pub id: String,
    pub key: HorizonKey,
    pub model_id: String,
    pub made_at: DateTime<Utc>,
    pub entry_price: f64,
    pub long: bool,
    pub confidence: f64,
}

impl PendingCall {
    pub fn due_at(&self) -> DateTime<Utc> {
        self.made_at + Duration::days(i64::from(self.key.horizon.days))
    }
}

#[derive(Default)]
pub struct CallTracker {
    pending: Mutex<Vec<PendingCall>>,
    opened: Mutex<HashSet<String>>,
}

impl CallTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Opens a call on the last candle of `series`. A flat forecast, an
    /// empty match set or a call already opened on the same candle is
    /// skipped.
    pub fn open(
        &self,
        key: &HorizonKey,
        model_id: &str,
        series: &Series,
        forecast: &CalibratedForecast,
    ) -> CoreResult<bool> {
        let Some(last) = series.candles().last() else {
            return Ok(false);
        };
        if forecast.match_count == 0 || forecast.weighted_mean == 0.0 || last.close <= 0.0 {
            return Ok(false);
        }

        let id = format!("{}:{}:{}", key, model_id, last.timestamp.timestamp());
        let mut opened = self
            .opened
            .lock()
            .map_err(|_| CoreError::Storage("call tracker lock poisoned".to_string()))?;
        if !opened.insert(id.clone()) {
            return Ok(false);
        }

        let call = PendingCall {
            id,
            key: key.clone(),
            model_id: model_id.to_string(),
            made_at: last.timestamp,
            entry_price: last.close,
            long: forecast.weighted_mean > 0.0,
            confidence: forecast.confidence_final,
        };
        tracing::debug!(
            "Opened {} call {} for {} (confidence {:.3})",
            if call.long { "long" } else { "short" },
            call.id,
            call.key,
            call.confidence
        );
        self.pending
            .lock()
            .map_err(|_| CoreError::Storage("call tracker lock poisoned".to_string()))?
            .push(call);
        Ok(true)
    }

    /// Resolves every call whose horizon is covered by `series` into the
    /// ledger. Returns how many were resolved.
    pub fn resolve(&self, series: &Series, ledger: &InMemoryPredictionLedger) -> CoreResult<usize> {
        let mut pending = self
            .pending
            .lock()
            .map_err(|_| CoreError::Storage("call tracker lock poisoned".to_string()))?;

        let mut resolved = 0;
        let mut still_open = Vec::with_capacity(pending.len());
        for call in pending.drain(..) {
            let due = call.due_at();
            match series.candles().iter().find(|c| c.timestamp >= due) {
                Some(exit) => {
                    let change = (exit.close / call.entry_price - 1.0) * 100.0;
                    let realized = if call.long { change } else { -change };
                    ledger.record(PredictionRecord {
                        id: call.id,
                        key: call.key,
                        model_id: call.model_id,
                        made_at: call.made_at,
                        resolved_at: exit.timestamp,
                        confidence: call.confidence,
                        realized_return: realized,
                        hit: realized > 0.0,
                    })?;
                    resolved += 1;
                }
                None => still_open.push(call),
            }
        }
        *pending = still_open;

        if resolved > 0 {
            tracing::info!("Resolved {} call(s), {} still open", resolved, pending.len());
        }
        Ok(resolved)
    }

    pub fn pending(&self) -> CoreResult<usize> {
        self.pending
            .lock()
            .map(|p| p.len())
            .map_err(|_| CoreError::Storage("call tracker lock poisoned".to_string()))
    }
}
