//! Drift Intelligence
//!
//! Compares a live performance cohort against historical baseline cohorts,
//! classifies the degradation and turns the verdict into a governance gate
//! for the lifecycle engines.

pub mod cohort;
pub mod config;
pub mod cusum;
pub mod engine;
pub mod governance;
pub mod severity;
pub mod snapshot_store;

pub use cohort::{two_proportion_p_value, CohortMetrics};
pub use config::{BaselineSpec, DriftConfig, DriftThresholds};
pub use cusum::{ChangeDirection, ChangePoint, CusumDetector, CusumResult};
pub use engine::{
    CalibrationDrift, CohortComparison, DriftEngine, DriftPayload, HorizonBreakdown, MetricDeltas,
};
pub use governance::DriftGovernance;
pub use severity::{DriftFlag, Recommendation, Severity};
pub use snapshot_store::DriftSnapshotStore;
