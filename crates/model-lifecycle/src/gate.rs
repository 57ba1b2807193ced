use serde::{Deserialize, Serialize};

use crate::events::LifecycleEvent;

/// Float noise allowed when a value sits exactly on a threshold.
const BOUNDARY_EPSILON: f64 = 1e-9;

/// One measured gate. `passed` means healthy / eligible.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GateCheck {
    pub passed: bool,
    pub value: f64,
    pub threshold: f64,
}

impl GateCheck {
    /// Inclusive floor.
    pub fn at_least(value: f64, threshold: f64) -> Self {
        Self {
            passed: value.is_finite() && value + BOUNDARY_EPSILON >= threshold,
            value,
            threshold,
        }
    }

    /// Inclusive ceiling.
    pub fn at_most(value: f64, threshold: f64) -> Self {
        Self {
            passed: value.is_finite() && value - BOUNDARY_EPSILON <= threshold,
            value,
            threshold,
        }
    }
}

/// What an evaluator did with its verdict.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Decision {
    /// A transition was applied.
    Executed { event: LifecycleEvent },
    /// Criteria not met; nothing to do.
    Held { reasons: Vec<String> },
    /// Criteria met but suppressed by governance.
    GovernanceLocked { reason: String },
    /// Criteria met but the transition had no effect.
    NoOp { reason: String },
}

impl Decision {
    pub fn executed(&self) -> bool {
        matches!(self, Decision::Executed { .. })
    }
}
