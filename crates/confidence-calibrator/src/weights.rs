//! Match Weighting
//!
//! Each match carries four independent weights in [0, 1]; their product is
//! the only aggregation rule used downstream.

use serde::{Deserialize, Serialize};

use pattern_core::config::ensure_range;
use pattern_core::{CoreError, CoreResult, Match, Validate};

/// Maps system reliability through `min + (max - min) * r^power`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthCurve {
    pub min: f64,
    pub max: f64,
    pub power: f64,
}

impl Default for HealthCurve {
    fn default() -> Self {
        Self {
            min: 0.5,
            max: 1.0,
            power: 1.5,
        }
    }
}

impl HealthCurve {
    /// Non-decreasing in `reliability`.
    pub fn weight(&self, reliability: f64) -> f64 {
        let r = if reliability.is_finite() {
            reliability.clamp(0.0, 1.0)
        } else {
            0.0
        };
        (self.min + (self.max - self.min) * r.powf(self.power)).clamp(self.min, self.max)
    }
}

/// Linear between the `bad` and `good` stability reference points.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StabilityCurve {
    /// Weight for matches without a stability score.
    pub neutral: f64,
    pub good: f64,
    pub bad: f64,
    pub min_weight: f64,
}

impl Default for StabilityCurve {
    fn default() -> Self {
        Self {
            neutral: 0.70,
            good: 0.80,
            bad: 0.30,
            min_weight: 0.30,
        }
    }
}

impl StabilityCurve {
    pub fn weight(&self, stability: Option<f64>) -> f64 {
        match stability {
            None => self.neutral,
            Some(s) if !s.is_finite() => self.neutral,
            Some(s) => {
                let t = ((s - self.bad) / (self.good - self.bad)).clamp(0.0, 1.0);
                (self.min_weight + (1.0 - self.min_weight) * t).clamp(self.min_weight, 1.0)
            }
        }
    }
}

/// Soft floor on similarity: full weight above `knee`, `(s/knee)^power`
/// below it, never under `min_weight`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimilarityCurve {
    pub knee: f64,
    pub power: f64,
    pub min_weight: f64,
}

impl Default for SimilarityCurve {
    fn default() -> Self {
        Self {
            knee: 0.95,
            power: 8.0,
            min_weight: 0.05,
        }
    }
}

impl SimilarityCurve {
    pub fn weight(&self, similarity: f64) -> f64 {
        if !similarity.is_finite() || similarity <= 0.0 {
            return self.min_weight;
        }
        if similarity >= self.knee {
            return 1.0;
        }
        (similarity / self.knee)
            .powf(self.power)
            .clamp(self.min_weight, 1.0)
    }
}

/// `confN(n) = 1 - exp(-n / n_scale)`, scaled by the reliability modifier
/// and the caller's base confidence, then clamped.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfidenceCurve {
    pub n_scale: f64,
    /// Blend between no reliability penalty (0) and full penalty (1).
    pub reliability_weight: f64,
    pub min_confidence: f64,
    pub max_confidence: f64,
}

impl Default for ConfidenceCurve {
    fn default() -> Self {
        Self {
            n_scale: 8.0,
            reliability_weight: 0.5,
            min_confidence: 0.05,
            max_confidence: 0.95,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DecayConfig {
    #[serde(default)]
    pub health: HealthCurve,
    #[serde(default)]
    pub stability: StabilityCurve,
    #[serde(default)]
    pub similarity: SimilarityCurve,
    #[serde(default)]
    pub confidence: ConfidenceCurve,
}

impl Validate for DecayConfig {
    fn validate(&self) -> CoreResult<()> {
        ensure_range("decay.health.min", self.health.min, 0.0, 1.0)?;
        ensure_range("decay.health.max", self.health.max, self.health.min, 1.0)?;
        if !(self.health.power.is_finite() && self.health.power > 0.0) {
            return Err(CoreError::config("decay.health.power", "must be positive"));
        }

        ensure_range("decay.stability.min_weight", self.stability.min_weight, 0.0, 1.0)?;
        ensure_range("decay.stability.neutral", self.stability.neutral, 0.0, 1.0)?;
        if !(self.stability.good > self.stability.bad) {
            return Err(CoreError::config(
                "decay.stability.good",
                "must be greater than decay.stability.bad",
            ));
        }

        ensure_range("decay.similarity.knee", self.similarity.knee, f64::EPSILON, 1.0)?;
        ensure_range("decay.similarity.min_weight", self.similarity.min_weight, 0.0, 1.0)?;
        if !(self.similarity.power.is_finite() && self.similarity.power > 0.0) {
            return Err(CoreError::config("decay.similarity.power", "must be positive"));
        }

        if !(self.confidence.n_scale.is_finite() && self.confidence.n_scale > 0.0) {
            return Err(CoreError::config("decay.confidence.n_scale", "must be positive"));
        }
        ensure_range(
            "decay.confidence.reliability_weight",
            self.confidence.reliability_weight,
            0.0,
            1.0,
        )?;
        ensure_range("decay.confidence.min_confidence", self.confidence.min_confidence, 0.0, 1.0)?;
        ensure_range(
            "decay.confidence.max_confidence",
            self.confidence.max_confidence,
            self.confidence.min_confidence,
            1.0,
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MatchWeightBreakdown {
    pub age: f64,
    pub health: f64,
    pub stability: f64,
    pub similarity: f64,
    /// `age * health * stability * similarity`
    #[serde(rename = "final")]
    pub final_weight: f64,
}

impl MatchWeightBreakdown {
    /// Clamp each factor to [0, 1] and multiply.
    pub fn compose(age: f64, health: f64, stability: f64, similarity: f64) -> Self {
        let clamp = |w: f64| if w.is_finite() { w.clamp(0.0, 1.0) } else { 0.0 };
        let (age, health, stability, similarity) =
            (clamp(age), clamp(health), clamp(stability), clamp(similarity));
        Self {
            age,
            health,
            stability,
            similarity,
            final_weight: age * health * stability * similarity,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WeightedMatch {
    #[serde(flatten)]
    pub matched: Match,
    pub weights: MatchWeightBreakdown,
}

impl DecayConfig {
    pub fn weigh(&self, m: &Match, reliability: f64) -> MatchWeightBreakdown {
        MatchWeightBreakdown::compose(
            m.age_weight,
            self.health.weight(reliability),
            self.stability.weight(m.stability_score),
            self.similarity.weight(m.raw_similarity),
        )
    }
}
