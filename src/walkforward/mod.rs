//! Walk-forward evaluation with leakage controls
//!
//! - `windows`: rolling/anchored train/test planning
//! - `purge`: label purging and purged k-fold
//! - `metrics`: out-of-sample metrics and the promotion gate
//! - `orchestrator`: runs the plan and feeds results back into the bandit

pub mod metrics;
pub mod orchestrator;
pub mod purge;
pub mod windows;

pub use metrics::StrategyMetrics;
pub use orchestrator::{CancelFlag, WalkForwardOrchestrator};
pub use purge::{purge_training, purged_kfold, Fold, LabeledSample, TrainingSet};
pub use windows::{plan_windows, validate_plan, WindowPair};
