//! Decay-Weighted Confidence Calibrator
//!
//! Turns raw analogue matches into a weighted forward-return distribution
//! and a confidence score that respects how many matches effectively
//! support it.

pub mod calibrator;
pub mod weights;

pub use calibrator::{
    confidence_final, effective_n, reliability_modifier, CalibratedForecast, DecayCalibrator,
};
pub use weights::{
    ConfidenceCurve, DecayConfig, HealthCurve, MatchWeightBreakdown, SimilarityCurve,
    StabilityCurve, WeightedMatch,
};
