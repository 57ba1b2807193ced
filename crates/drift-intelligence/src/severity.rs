use std::fmt;

use serde::{Deserialize, Serialize};

use pattern_core::LifecycleAction;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Severity {
    Ok,
    Watch,
    Warn,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Ok => "OK",
            Severity::Watch => "WATCH",
            Severity::Warn => "WARN",
            Severity::Critical => "CRITICAL",
        }
    }

    pub fn recommendation(&self) -> Recommendation {
        match self {
            Severity::Ok => Recommendation::NoAction,
            Severity::Watch => Recommendation::TuneAllowed,
            Severity::Warn => Recommendation::Investigate,
            Severity::Critical => Recommendation::Lockdown,
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Recommendation {
    NoAction,
    TuneAllowed,
    Investigate,
    Lockdown,
}

impl Recommendation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Recommendation::NoAction => "NO_ACTION",
            Recommendation::TuneAllowed => "TUNE_ALLOWED",
            Recommendation::Investigate => "INVESTIGATE",
            Recommendation::Lockdown => "LOCKDOWN",
        }
    }

    /// Lifecycle actions this recommendation suppresses.
    pub fn blocked_actions(&self, rollback_on_critical: bool) -> Vec<LifecycleAction> {
        match self {
            Recommendation::NoAction | Recommendation::TuneAllowed => Vec::new(),
            Recommendation::Investigate => vec![LifecycleAction::Promote],
            Recommendation::Lockdown if rollback_on_critical => vec![LifecycleAction::Promote],
            Recommendation::Lockdown => vec![LifecycleAction::Promote, LifecycleAction::Rollback],
        }
    }
}

impl fmt::Display for Recommendation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DriftFlag {
    /// Live cohort below the minimum sample size; verdict capped below CRITICAL.
    LowSample,
    /// A baseline had too few samples and was left out.
    BaselineLowSample,
    /// CUSUM confirmed an upward shift in calibration error.
    CalibrationDriftConfirmed,
    /// Hit-rate delta is not statistically significant.
    NotSignificant,
}
