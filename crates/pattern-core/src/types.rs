use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{CoreError, CoreResult};

/// OHLCV candle. The scanner works on `close`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub timestamp: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    #[serde(default)]
    pub volume: f64,
}

impl Candle {
    /// A flat candle for series that only carry one price per timestamp.
    pub fn point(timestamp: DateTime<Utc>, price: f64) -> Self {
        Self {
            timestamp,
            open: price,
            high: price,
            low: price,
            close: price,
            volume: 0.0,
        }
    }
}

/// A detected hole in the series.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Gap {
    pub after_index: usize,
    pub from: DateTime<Utc>,
    pub to: DateTime<Utc>,
}

/// Ordered, validated price series. Immutable once built.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Series {
    candles: Vec<Candle>,
}

impl Series {
    /// Validate ordering and price sanity.
    ///
    /// Timestamps must be strictly increasing and every close finite and
    /// non-negative. Gaps are allowed; use [`Series::gaps`] to flag them.
    pub fn new(candles: Vec<Candle>) -> CoreResult<Self> {
        for (i, c) in candles.iter().enumerate() {
            if !c.close.is_finite() || c.close < 0.0 {
                return Err(CoreError::InvalidSeries(format!(
                    "close at index {} is not a finite non-negative number ({})",
                    i, c.close
                )));
            }
            if i > 0 && candles[i - 1].timestamp >= c.timestamp {
                return Err(CoreError::InvalidSeries(format!(
                    "timestamps not strictly increasing at index {} ({} >= {})",
                    i,
                    candles[i - 1].timestamp,
                    c.timestamp
                )));
            }
        }
        Ok(Self { candles })
    }

    pub fn candles(&self) -> &[Candle] {
        &self.candles
    }

    pub fn len(&self) -> usize {
        self.candles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.candles.is_empty()
    }

    pub fn closes(&self) -> Vec<f64> {
        self.candles.iter().map(|c| c.close).collect()
    }

    pub fn first_timestamp(&self) -> Option<DateTime<Utc>> {
        self.candles.first().map(|c| c.timestamp)
    }

    pub fn last_timestamp(&self) -> Option<DateTime<Utc>> {
        self.candles.last().map(|c| c.timestamp)
    }

    /// Inclusive time slice.
    pub fn range(&self, from: Option<DateTime<Utc>>, to: Option<DateTime<Utc>>) -> Series {
        let candles = self
            .candles
            .iter()
            .filter(|c| from.map_or(true, |f| c.timestamp >= f))
            .filter(|c| to.map_or(true, |t| c.timestamp <= t))
            .cloned()
            .collect();
        Series { candles }
    }

    /// Report every step wider than `expected_interval`.
    pub fn gaps(&self, expected_interval: Duration) -> Vec<Gap> {
        self.candles
            .windows(2)
            .enumerate()
            .filter(|(_, w)| w[1].timestamp - w[0].timestamp > expected_interval)
            .map(|(i, w)| Gap {
                after_index: i,
                from: w[0].timestamp,
                to: w[1].timestamp,
            })
            .collect()
    }
}

/// Forecast horizon, expressed in days.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Horizon {
    pub days: u32,
}

impl Horizon {
    pub fn days(days: u32) -> Self {
        Self { days }
    }
}

impl fmt::Display for Horizon {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}d", self.days)
    }
}

impl FromStr for Horizon {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        let digits = trimmed.strip_suffix('d').unwrap_or(trimmed);
        let days: u32 = digits
            .parse()
            .map_err(|_| CoreError::config("horizon", format!("cannot parse '{}'", s)))?;
        if days == 0 {
            return Err(CoreError::config("horizon", "must be at least 1 day"));
        }
        Ok(Horizon { days })
    }
}

impl TryFrom<String> for Horizon {
    type Error = CoreError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Horizon> for String {
    fn from(h: Horizon) -> Self {
        h.to_string()
    }
}

/// Registry row identity: one lifecycle per (symbol, horizon).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct HorizonKey {
    pub symbol: String,
    pub horizon: Horizon,
}

impl HorizonKey {
    pub fn new(symbol: impl Into<String>, horizon: Horizon) -> Self {
        Self {
            symbol: symbol.into().trim().to_ascii_uppercase(),
            horizon,
        }
    }
}

impl fmt::Display for HorizonKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.symbol, self.horizon)
    }
}

/// Forward-horizon result of a historical window, in percent of the
/// window's last price.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Outcome {
    #[serde(rename = "return")]
    pub return_pct: f64,
    pub max_drawdown: f64,
    pub max_excursion: f64,
}

/// A historical window judged similar to the current one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Match {
    pub id: String,
    pub start_index: usize,
    pub start_ts: DateTime<Utc>,
    pub end_ts: DateTime<Utc>,
    /// Cosine similarity clamped to [0, 1].
    pub raw_similarity: f64,
    /// Similarity relative to the best returned match (rank 1 = 1.0).
    pub selection_score: f64,
    pub age_weight: f64,
    pub stability_score: Option<f64>,
    pub outcome: Outcome,
}

/// A resolved prediction made by one model variant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictionRecord {
    pub id: String,
    pub key: HorizonKey,
    pub model_id: String,
    pub made_at: DateTime<Utc>,
    pub resolved_at: DateTime<Utc>,
    /// Confidence the model attached to the call, in [0, 1].
    pub confidence: f64,
    /// Realized return of the call, in percent.
    pub realized_return: f64,
    /// Whether the predicted pattern played out.
    pub hit: bool,
}

/// Lifecycle transitions a governance lock can suppress.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LifecycleAction {
    Promote,
    Rollback,
}

impl fmt::Display for LifecycleAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LifecycleAction::Promote => write!(f, "PROMOTE"),
            LifecycleAction::Rollback => write!(f, "ROLLBACK"),
        }
    }
}
