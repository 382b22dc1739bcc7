//! Contextual multi-armed bandit over strategies
//!
//! - `BanditSelector`: Thompson sampling (or UCB1) with per-bucket Beta beliefs
//! - `RewardShaper`: realized P&L to bounded reward
//! - `ContextBucketer`: context discretization for per-bucket beliefs
//! - `DriftDetector`: reward drift signal that triggers reinitialize or decay

pub mod belief;
pub mod bucket;
pub mod drift;
pub mod reward;
pub mod selector;

pub use belief::BetaBelief;
pub use bucket::{ConfiguredBucketer, ContextBucketer, GLOBAL_BUCKET};
pub use drift::{DriftDetector, PageHinkley};
pub use reward::{ConfiguredReward, RewardShaper};
pub use selector::{ArmSpec, ArmState, BanditSelector, BanditSnapshot};
