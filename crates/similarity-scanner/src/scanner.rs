//! Exhaustive analogue search.
//!
//! Every historical start index whose window and forward horizon both end
//! before the current window begins is scored. The scan is O(M x L) on
//! purpose: at thousands of candles it is fast enough and every ranking can
//! be reproduced by hand.

use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use pattern_core::config::ensure_range;
use pattern_core::stats::{std_dev, step_returns};
use pattern_core::{
    CoreError, CoreResult, Match, Series, SeriesStore, Validate,
};

use crate::normalize::{cosine_similarity, normalize_base100};
use crate::outcome::forward_outcome;

/// Age decay: `0.5 ^ (age_bars / half_life_bars)`, floored at `min_weight`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgeDecay {
    pub half_life_bars: f64,
    pub min_weight: f64,
}

impl Default for AgeDecay {
    fn default() -> Self {
        Self {
            half_life_bars: 365.0,
            min_weight: 0.10,
        }
    }
}

impl AgeDecay {
    /// Non-increasing in `age_bars`.
    pub fn weight(&self, age_bars: usize) -> f64 {
        let raw = 0.5_f64.powf(age_bars as f64 / self.half_life_bars);
        raw.clamp(self.min_weight, 1.0)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ScanConfig {
    #[serde(default)]
    pub age_decay: AgeDecay,
}

impl Validate for ScanConfig {
    fn validate(&self) -> CoreResult<()> {
        if !(self.age_decay.half_life_bars.is_finite() && self.age_decay.half_life_bars > 0.0) {
            return Err(CoreError::config(
                "scan.age_decay.half_life_bars",
                "must be a positive number",
            ));
        }
        ensure_range("scan.age_decay.min_weight", self.age_decay.min_weight, 0.0, 1.0)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanRequest {
    pub window_len: usize,
    pub top_k: usize,
    pub forward_horizon: usize,
    /// Soft limit: once exceeded, remaining candidates are skipped.
    #[serde(default)]
    pub budget: Option<Duration>,
}

impl ScanRequest {
    pub fn new(window_len: usize, top_k: usize, forward_horizon: usize) -> Self {
        Self {
            window_len,
            top_k,
            forward_horizon,
            budget: None,
        }
    }

    pub fn with_budget(mut self, budget: Duration) -> Self {
        self.budget = Some(budget);
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CurrentWindowStats {
    pub start_ts: DateTime<Utc>,
    pub end_ts: DateTime<Utc>,
    pub window_len: usize,
    /// Percent change across the window.
    pub return_pct: f64,
    /// Sample std of per-step returns.
    pub volatility: f64,
    pub candidates_total: usize,
    pub candidates_scanned: usize,
    /// True when the time budget cut the scan short.
    pub truncated: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanResult {
    pub matches: Vec<Match>,
    pub current_window_stats: CurrentWindowStats,
}

struct Candidate {
    start: usize,
    similarity: f64,
}

/// Stateless scanner; safe to share across threads and symbols.
#[derive(Debug, Clone, Default)]
pub struct SimilarityScanner {
    config: ScanConfig,
}

impl SimilarityScanner {
    pub fn new(config: ScanConfig) -> CoreResult<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &ScanConfig {
        &self.config
    }

    /// Load the series from the store and scan it.
    pub async fn scan_symbol(
        &self,
        store: &dyn SeriesStore,
        symbol: &str,
        timeframe: &str,
        request: &ScanRequest,
    ) -> CoreResult<ScanResult> {
        let series = store.get_all(symbol, timeframe).await?;
        self.scan(&series, request)
    }

    pub fn scan(&self, series: &Series, request: &ScanRequest) -> CoreResult<ScanResult> {
        let l = request.window_len;
        let h = request.forward_horizon;
        if l == 0 || request.top_k == 0 || h == 0 {
            return Err(CoreError::InsufficientData(format!(
                "window_len, top_k and forward_horizon must be positive (got {}, {}, {})",
                l, request.top_k, h
            )));
        }
        let n = series.len();
        if n < 2 * l {
            return Err(CoreError::InsufficientData(format!(
                "series has {} points, need at least {} for window {}",
                n,
                2 * l,
                l
            )));
        }

        let started = Instant::now();
        let closes = series.closes();
        let candles = series.candles();

        let current_start = n - l;
        let current_raw = &closes[current_start..];
        let current = normalize_base100(current_raw);
        let current_vol = std_dev(&step_returns(current_raw));

        // Window [i, i+l) plus forward (i+l-1, i+l-1+h] must end before current_start.
        let candidates_total = (current_start + 1).saturating_sub(l + h);

        let mut candidates: Vec<Candidate> = (0..candidates_total)
            .into_par_iter()
            .filter_map(|i| {
                if let Some(budget) = request.budget {
                    if started.elapsed() > budget {
                        return None;
                    }
                }
                let window = normalize_base100(&closes[i..i + l]);
                let similarity = cosine_similarity(&window, &current).max(0.0);
                Some(Candidate {
                    start: i,
                    similarity,
                })
            })
            .collect();

        let candidates_scanned = candidates.len();
        let truncated = candidates_scanned < candidates_total;
        if truncated {
            tracing::warn!(
                "Scan budget exhausted: scored {}/{} candidates",
                candidates_scanned,
                candidates_total
            );
        }

        // Most similar first; ties go to the more recent start.
        candidates.sort_by(|a, b| {
            b.similarity
                .partial_cmp(&a.similarity)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(b.start.cmp(&a.start))
        });
        candidates.truncate(request.top_k);

        let best = candidates.first().map(|c| c.similarity).unwrap_or(0.0);
        let matches: Vec<Match> = candidates
            .iter()
            .enumerate()
            .map(|(rank, c)| {
                let end = c.start + l - 1;
                let raw_window = &closes[c.start..=end];
                let candidate_vol = std_dev(&step_returns(raw_window));
                let selection_score = if best > f64::EPSILON {
                    c.similarity / best
                } else if rank == 0 {
                    1.0
                } else {
                    0.0
                };
                Match {
                    id: format!("m{}-{}", c.start, candles[c.start].timestamp.timestamp()),
                    start_index: c.start,
                    start_ts: candles[c.start].timestamp,
                    end_ts: candles[end].timestamp,
                    raw_similarity: c.similarity,
                    selection_score,
                    age_weight: self.config.age_decay.weight(n - c.start - l),
                    stability_score: volatility_ratio(candidate_vol, current_vol),
                    outcome: forward_outcome(&closes[end..=end + h]),
                }
            })
            .collect();

        tracing::debug!(
            "Scanned {} candidates (window {}, horizon {}) -> {} matches in {:?}",
            candidates_scanned,
            l,
            h,
            matches.len(),
            started.elapsed()
        );

        let first = current_raw[0];
        let last = current_raw[l - 1];
        Ok(ScanResult {
            matches,
            current_window_stats: CurrentWindowStats {
                start_ts: candles[current_start].timestamp,
                end_ts: candles[n - 1].timestamp,
                window_len: l,
                return_pct: if first.abs() > f64::EPSILON {
                    (last - first) / first * 100.0
                } else {
                    0.0
                },
                volatility: current_vol,
                candidates_total,
                candidates_scanned,
                truncated,
            },
        })
    }
}

fn volatility_ratio(a: f64, b: f64) -> Option<f64> {
    if a <= f64::EPSILON || b <= f64::EPSILON {
        return None;
    }
    Some(a.min(b) / a.max(b))
}
