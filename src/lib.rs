pub mod bandit;
pub mod config;
pub mod domain;
pub mod engine;
pub mod error;
pub mod persistence;
pub mod risk;
pub mod strategy;
pub mod walkforward;

pub use bandit::{BanditSelector, BanditSnapshot, ConfiguredReward, RewardShaper};
pub use config::AppConfig;
pub use domain::{Arm, ArmId, Context, HistoricalSeries, Regime, Trade, WalkForwardRun};
pub use engine::{DecisionEngine, EpochOutcome, Executor};
pub use error::{AutotraderError, Result};
pub use persistence::{
    BackgroundRecorder, InMemoryGateway, PersistenceGateway, PostgresGateway, Record, WriteIntent,
};
pub use risk::{Decision, RejectReason, RiskGuard};
pub use strategy::Strategy;
pub use walkforward::{CancelFlag, WalkForwardOrchestrator};
