//! Model Lifecycle
//!
//! Per-horizon registry of model variants (ACTIVE / SHADOW / ARCHIVED), the
//! auto-promotion and auto-rollback engines that drive it, and the append-only
//! lifecycle event stream.

pub mod config;
pub mod evaluation;
pub mod events;
pub mod gate;
pub mod promotion;
pub mod registry;
pub mod rollback;
pub mod sql_store;

pub use config::{HorizonThresholds, LifecycleConfig, RollbackConfig, SustainedLiftConfig};
pub use evaluation::{EvaluationLog, EvaluationWindow, WindowLift};
pub use events::{EventLog, LifecycleEvent, LifecycleEventType};
pub use gate::{Decision, GateCheck};
pub use promotion::{PromotionChecks, PromotionDecision, PromotionEngine, PromotionReport, SustainedWindowCheck};
pub use registry::{HorizonSnapshot, ModelRegistry, ModelStatus, ModelVariant, RollbackResult};
pub use rollback::{RollbackChecks, RollbackDecision, RollbackEngine, RollbackReport};
pub use sql_store::SqlEventStore;
