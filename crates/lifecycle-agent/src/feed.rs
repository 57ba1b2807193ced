//! File-backed inputs: the price series and an optional seed ledger of
//! resolved predictions (typically produced by an external shadow
//! evaluator).

use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use serde::Deserialize;

use pattern_core::{Candle, InMemoryPredictionLedger, PredictionRecord, Series};

#[derive(Deserialize)]
#[serde(untagged)]
enum CandleRow {
    Full(Candle),
    Point { timestamp: DateTime<Utc>, close: f64 },
}

impl From<CandleRow> for Candle {
    fn from(row: CandleRow) -> Self {
        match row {
            CandleRow::Full(c) => c,
            CandleRow::Point { timestamp, close } => Candle::point(timestamp, close),
        }
    }
}

/// Accepts full OHLCV rows or `{timestamp, close}` points.
pub fn parse_series(raw: &str) -> Result<Series> {
    let rows: Vec<CandleRow> = serde_json::from_str(raw).context("series is not a JSON array of candles")?;
    let series = Series::new(rows.into_iter().map(Candle::from).collect())?;

    let gaps = series.gaps(Duration::days(4));
    if !gaps.is_empty() {
        tracing::warn!(
            "Series has {} gap(s) wider than 4 days, first after {}",
            gaps.len(),
            gaps[0].from
        );
    }
    Ok(series)
}

pub fn load_series(path: &Path) -> Result<Series> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read series {}", path.display()))?;
    parse_series(&raw).with_context(|| format!("in {}", path.display()))
}

/// Loads resolved predictions into the ledger. Returns how many were new.
pub fn seed_predictions(ledger: &InMemoryPredictionLedger, path: &Path) -> Result<usize> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read predictions {}", path.display()))?;
    let records: Vec<PredictionRecord> = serde_json::from_str(&raw)
        .with_context(|| format!("{} is not a JSON array of predictions", path.display()))?;

    let before = ledger.len();
    for record in records {
        ledger.record(record)?;
    }
    Ok(ledger.len() - before)
}
