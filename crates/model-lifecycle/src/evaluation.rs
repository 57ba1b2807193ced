//! Evaluation windows recorded by the sustained-lift check.
//!
//! Each window compares the active and shadow variants over the same
//! period. The log is append-only and keyed by `(horizon, end date)`: the
//! first check to close a window on a given day is the one kept.

use std::collections::{BTreeMap, HashMap};
use std::ops::Bound;
use std::sync::RwLock;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use pattern_core::{CoreError, CoreResult, HorizonKey, PerformanceMetrics};

/// Windows kept in memory before the oldest are evicted.
pub const DEFAULT_RETENTION: usize = 512;

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct WindowLift {
    pub win_rate: f64,
    pub sharpe_like: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluationWindow {
    pub key: HorizonKey,
    /// 0 is the most recent window of the check that recorded it.
    pub window_index: u32,
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
    /// Shadow predictions resolved inside the window.
    pub predictions: usize,
    pub active_model_id: String,
    pub shadow_model_id: String,
    pub active_metrics: PerformanceMetrics,
    pub shadow_metrics: PerformanceMetrics,
    /// Shadow minus active.
    pub lift: WindowLift,
}

impl EvaluationWindow {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        key: HorizonKey,
        window_index: u32,
        window_start: DateTime<Utc>,
        window_end: DateTime<Utc>,
        active_model_id: &str,
        shadow_model_id: &str,
        active_metrics: PerformanceMetrics,
        shadow_metrics: PerformanceMetrics,
    ) -> Self {
        let lift = WindowLift {
            win_rate: shadow_metrics.pattern_match_rate - active_metrics.pattern_match_rate,
            sharpe_like: shadow_metrics.sharpe_like - active_metrics.sharpe_like,
        };
        Self {
            key,
            window_index,
            window_start,
            window_end,
            predictions: shadow_metrics.predictions,
            active_model_id: active_model_id.to_string(),
            shadow_model_id: shadow_model_id.to_string(),
            active_metrics,
            shadow_metrics,
            lift,
        }
    }

    pub fn end_date(&self) -> NaiveDate {
        self.window_end.date_naive()
    }
}

type WindowId = (HorizonKey, NaiveDate);

struct Inner {
    next_seq: u64,
    ids: HashMap<WindowId, u64>,
    windows: BTreeMap<u64, EvaluationWindow>,
}

/// Every recorded window gets a sequence number so a persister can pick up
/// only what it has not seen yet.
pub struct EvaluationLog {
    retention: usize,
    inner: RwLock<Inner>,
}

impl Default for EvaluationLog {
    fn default() -> Self {
        Self::with_retention(DEFAULT_RETENTION)
    }
}

impl EvaluationLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_retention(retention: usize) -> Self {
        Self {
            retention: retention.max(1),
            inner: RwLock::new(Inner {
                next_seq: 1,
                ids: HashMap::new(),
                windows: BTreeMap::new(),
            }),
        }
    }

    /// Returns `false` when a window with the same horizon and end date was
    /// already recorded.
    pub fn record(&self, window: EvaluationWindow) -> CoreResult<bool> {
        let id = (window.key.clone(), window.end_date());
        let mut guard = self
            .inner
            .write()
            .map_err(|_| CoreError::Storage("evaluation log lock poisoned".to_string()))?;
        if guard.ids.contains_key(&id) {
            return Ok(false);
        }

        let seq = guard.next_seq;
        guard.next_seq += 1;
        guard.ids.insert(id, seq);
        guard.windows.insert(seq, window);

        while guard.windows.len() > self.retention {
            if let Some((_, evicted)) = guard.windows.pop_first() {
                guard.ids.remove(&(evicted.key.clone(), evicted.end_date()));
            }
        }
        Ok(true)
    }

    /// Oldest end date first.
    pub fn windows_for(&self, key: &HorizonKey) -> CoreResult<Vec<EvaluationWindow>> {
        let guard = self
            .inner
            .read()
            .map_err(|_| CoreError::Storage("evaluation log lock poisoned".to_string()))?;
        let mut out: Vec<EvaluationWindow> = guard
            .windows
            .values()
            .filter(|w| &w.key == key)
            .cloned()
            .collect();
        out.sort_by_key(|w| w.window_end);
        Ok(out)
    }

    /// Windows recorded after sequence number `seq`, in recording order.
    pub fn recorded_after(&self, seq: u64) -> CoreResult<Vec<(u64, EvaluationWindow)>> {
        let guard = self
            .inner
            .read()
            .map_err(|_| CoreError::Storage("evaluation log lock poisoned".to_string()))?;
        Ok(guard
            .windows
            .range((Bound::Excluded(seq), Bound::Unbounded))
            .map(|(s, w)| (*s, w.clone()))
            .collect())
    }

    pub fn len(&self) -> usize {
        self.inner.read().map(|g| g.windows.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use chrono::{Duration, TimeZone};
    use pattern_core::Horizon;

    fn key() -> HorizonKey {
        HorizonKey::new("SPY", Horizon::days(7))
    }

    fn window(end: DateTime<Utc>) -> EvaluationWindow {
        EvaluationWindow::new(
            key(),
            0,
            end - Duration::days(14),
            end,
            "v1",
            "v2",
            PerformanceMetrics {
                predictions: 20,
                pattern_match_rate: 0.50,
                sharpe_like: 0.40,
                ..PerformanceMetrics::default()
            },
            PerformanceMetrics {
                predictions: 18,
                pattern_match_rate: 0.62,
                sharpe_like: 0.55,
                ..PerformanceMetrics::default()
            },
        )
    }

    #[test]
    fn test_lift_is_shadow_minus_active() {
        let w = window(Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap());
        assert_relative_eq!(w.lift.win_rate, 0.12, epsilon = 1e-12);
        assert_relative_eq!(w.lift.sharpe_like, 0.15, epsilon = 1e-12);
        assert_eq!(w.predictions, 18);
    }

    #[test]
    fn test_same_end_date_recorded_once() {
        let log = EvaluationLog::new();
        let end = Utc.with_ymd_and_hms(2024, 6, 1, 9, 0, 0).unwrap();
        assert!(log.record(window(end)).unwrap());
        // a later check on the same day closes the same window
        assert!(!log.record(window(end + Duration::hours(5))).unwrap());
        assert!(log.record(window(end - Duration::days(14))).unwrap());

        let windows = log.windows_for(&key()).unwrap();
        assert_eq!(windows.len(), 2);
        assert!(windows[0].window_end < windows[1].window_end);
        assert_eq!(windows[1].window_end, end);
        assert!(log
            .windows_for(&HorizonKey::new("SPY", Horizon::days(1)))
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_recorded_after_and_retention() {
        let log = EvaluationLog::with_retention(3);
        let base = Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap();
        for day in 0..5 {
            log.record(window(base + Duration::days(day))).unwrap();
        }
        assert_eq!(log.len(), 3);

        let all = log.recorded_after(0).unwrap();
        assert_eq!(all.iter().map(|(s, _)| *s).collect::<Vec<_>>(), vec![3, 4, 5]);
        let newer = log.recorded_after(4).unwrap();
        assert_eq!(newer.len(), 1);
        assert_eq!(newer[0].1.window_end, base + Duration::days(4));
    }
}
