use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::{AutotraderError, Result};

/// Main configuration structure
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct AppConfig {
    #[serde(default)]
    pub risk: RiskConfig,
    #[serde(default)]
    pub bandit: BanditConfig,
    #[serde(default)]
    pub reward: RewardConfig,
    #[serde(default)]
    pub bucketing: BucketingConfig,
    #[serde(default)]
    pub walk_forward: WalkForwardConfig,
    #[serde(default)]
    pub persistence: PersistenceConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

// =============================================================================
// Risk
// =============================================================================

/// Balance band with a fixed lot cap
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct LotTier {
    #[serde(default)]
    pub balance_min: f64,
    #[serde(default = "default_balance_max")]
    pub balance_max: f64,
    pub lot: f64,
}

fn default_balance_max() -> f64 {
    f64::INFINITY
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RiskConfig {
    /// Events strictly above this confidence (and not flagged uncertain) trigger a blackout
    #[serde(default = "default_news_confidence")]
    pub news_confidence_threshold: f64,
    /// Half-width of the blackout window around an event, minutes
    #[serde(default = "default_blackout_minutes")]
    pub news_blackout_minutes: i64,
    /// Restrict blackouts to these event labels (empty = any event)
    #[serde(default)]
    pub important_events: Vec<String>,
    /// Reject when spread > ratio * stop distance
    #[serde(default = "default_spread_stop_ratio")]
    pub spread_stop_ratio: f64,
    /// Optional absolute spread cap, price units
    #[serde(default)]
    pub spread_max_points: Option<f64>,
    /// Fraction of equity risked per trade (e.g., 0.01 = 1%)
    #[serde(default = "default_risk_per_trade")]
    pub risk_per_trade: f64,
    /// Account-currency value of a 1.0 price move for one lot
    #[serde(default = "default_point_value")]
    pub point_value: f64,
    #[serde(default = "default_lot_min")]
    pub lot_min: f64,
    #[serde(default = "default_lot_step")]
    pub lot_step: f64,
    /// Optional balance-tier lot caps
    #[serde(default)]
    pub lot_tiers: Vec<LotTier>,
    /// Drawdown ceiling in percent; above this new entries are rejected
    #[serde(default = "default_max_drawdown")]
    pub max_drawdown_pct: f64,
    /// Entries resume only once drawdown falls below this
    #[serde(default = "default_drawdown_recovery")]
    pub drawdown_recovery_pct: f64,
    /// Maximum concurrent open positions (0 = unlimited)
    #[serde(default = "default_max_positions")]
    pub max_positions: u32,
}

fn default_news_confidence() -> f64 {
    0.8
}
fn default_blackout_minutes() -> i64 {
    20
}
fn default_spread_stop_ratio() -> f64 {
    0.25
}
fn default_risk_per_trade() -> f64 {
    0.01
}
fn default_point_value() -> f64 {
    100.0
}
fn default_lot_min() -> f64 {
    0.01
}
fn default_lot_step() -> f64 {
    0.01
}
fn default_max_drawdown() -> f64 {
    10.0
}
fn default_drawdown_recovery() -> f64 {
    8.0
}
fn default_max_positions() -> u32 {
    1
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            news_confidence_threshold: default_news_confidence(),
            news_blackout_minutes: default_blackout_minutes(),
            important_events: Vec::new(),
            spread_stop_ratio: default_spread_stop_ratio(),
            spread_max_points: None,
            risk_per_trade: default_risk_per_trade(),
            point_value: default_point_value(),
            lot_min: default_lot_min(),
            lot_step: default_lot_step(),
            lot_tiers: Vec::new(),
            max_drawdown_pct: default_max_drawdown(),
            drawdown_recovery_pct: default_drawdown_recovery(),
            max_positions: default_max_positions(),
        }
    }
}

// =============================================================================
// Bandit
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BanditAlgorithm {
    Thompson,
    Ucb1,
}

/// What to do with an arm when the drift detector fires
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DriftResponse {
    Reinitialize,
    Decay,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BanditConfig {
    #[serde(default = "default_algorithm")]
    pub algorithm: BanditAlgorithm,
    #[serde(default = "default_prior")]
    pub prior_alpha: f64,
    #[serde(default = "default_prior")]
    pub prior_beta: f64,
    /// Increment k applied per unit of |reward - midpoint|
    #[serde(default = "default_increment")]
    pub increment: f64,
    #[serde(default = "default_reward_midpoint")]
    pub reward_midpoint: f64,
    #[serde(default)]
    pub reward_min: f64,
    #[serde(default = "default_reward_max")]
    pub reward_max: f64,
    /// Fixed RNG seed; random when unset
    #[serde(default)]
    pub seed: Option<u64>,
    #[serde(default = "default_drift_response")]
    pub drift_response: DriftResponse,
    /// Half-life in updates for decay toward the prior
    #[serde(default = "default_half_life")]
    pub decay_half_life: u32,
    /// Page-Hinkley tolerance
    #[serde(default = "default_drift_delta")]
    pub drift_delta: f64,
    /// Page-Hinkley alarm threshold
    #[serde(default = "default_drift_threshold")]
    pub drift_threshold: f64,
}

fn default_algorithm() -> BanditAlgorithm {
    BanditAlgorithm::Thompson
}
fn default_prior() -> f64 {
    1.0
}
fn default_increment() -> f64 {
    2.0
}
fn default_reward_midpoint() -> f64 {
    0.5
}
fn default_reward_max() -> f64 {
    1.0
}
fn default_drift_response() -> DriftResponse {
    DriftResponse::Reinitialize
}
fn default_half_life() -> u32 {
    200
}
fn default_drift_delta() -> f64 {
    0.005
}
fn default_drift_threshold() -> f64 {
    5.0
}

impl Default for BanditConfig {
    fn default() -> Self {
        Self {
            algorithm: default_algorithm(),
            prior_alpha: default_prior(),
            prior_beta: default_prior(),
            increment: default_increment(),
            reward_midpoint: default_reward_midpoint(),
            reward_min: 0.0,
            reward_max: default_reward_max(),
            seed: None,
            drift_response: default_drift_response(),
            decay_half_life: default_half_life(),
            drift_delta: default_drift_delta(),
            drift_threshold: default_drift_threshold(),
        }
    }
}

// =============================================================================
// Reward shaping
// =============================================================================

/// Mapping from ATR-normalized P&L to a bounded bandit reward
#[derive(Debug, Clone, Copy, PartialEq, Deserialize, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RewardMapping {
    /// Clamp `pnl_atr * scale` into range, centred on the midpoint
    Linear { scale: f64 },
    /// `tanh(pnl_atr / scale)` rescaled into range
    Tanh { scale: f64 },
    /// Win = max, loss = min, flat = midpoint
    Sign,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RewardConfig {
    #[serde(default = "default_mapping")]
    pub mapping: RewardMapping,
}

fn default_mapping() -> RewardMapping {
    RewardMapping::Tanh { scale: 1.0 }
}

impl Default for RewardConfig {
    fn default() -> Self {
        Self {
            mapping: default_mapping(),
        }
    }
}

// =============================================================================
// Context bucketing
// =============================================================================

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BucketingConfig {
    /// When false every context shares one belief per arm
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_true")]
    pub by_regime: bool,
    #[serde(default)]
    pub by_session: bool,
    /// Ascending cut points on trend_score
    #[serde(default)]
    pub trend_cuts: Vec<f64>,
}

fn default_true() -> bool {
    true
}

impl Default for BucketingConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            by_regime: true,
            by_session: false,
            trend_cuts: Vec::new(),
        }
    }
}

// =============================================================================
// Walk-forward
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum GateAction {
    /// Exclude the arm from selection until it passes again
    Disable,
    /// Pull the arm's belief toward the prior
    Shrink,
}

/// Out-of-sample promotion criteria
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct GateConfig {
    #[serde(default = "default_min_trades")]
    pub min_trades: u32,
    #[serde(default)]
    pub min_sharpe: f64,
    #[serde(default = "default_gate_mdd")]
    pub max_drawdown_pct: f64,
    #[serde(default = "default_gate_action")]
    pub action: GateAction,
    /// Fraction of evidence kept when shrinking
    #[serde(default = "default_shrink_factor")]
    pub shrink_factor: f64,
}

fn default_min_trades() -> u32 {
    5
}
fn default_gate_mdd() -> f64 {
    20.0
}
fn default_gate_action() -> GateAction {
    GateAction::Disable
}
fn default_shrink_factor() -> f64 {
    0.5
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            min_trades: default_min_trades(),
            min_sharpe: 0.0,
            max_drawdown_pct: default_gate_mdd(),
            action: default_gate_action(),
            shrink_factor: default_shrink_factor(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WalkForwardConfig {
    #[serde(default = "default_train_hours")]
    pub train_hours: i64,
    #[serde(default = "default_test_hours")]
    pub test_hours: i64,
    #[serde(default = "default_step_hours")]
    pub step_hours: i64,
    /// Anchored windows keep the train start fixed at the series start
    #[serde(default)]
    pub anchored: bool,
    /// Bars a training label looks ahead
    #[serde(default = "default_label_horizon")]
    pub label_horizon_bars: usize,
    /// Bars dropped around each CV test fold
    #[serde(default = "default_embargo")]
    pub embargo_bars: usize,
    #[serde(default = "default_cv_folds")]
    pub cv_folds: usize,
    #[serde(default)]
    pub gate: GateConfig,
}

fn default_train_hours() -> i64 {
    24 * 60
}
fn default_test_hours() -> i64 {
    24 * 14
}
fn default_step_hours() -> i64 {
    24 * 14
}
fn default_label_horizon() -> usize {
    12
}
fn default_embargo() -> usize {
    1
}
fn default_cv_folds() -> usize {
    5
}

impl Default for WalkForwardConfig {
    fn default() -> Self {
        Self {
            train_hours: default_train_hours(),
            test_hours: default_test_hours(),
            step_hours: default_step_hours(),
            anchored: false,
            label_horizon_bars: default_label_horizon(),
            embargo_bars: default_embargo(),
            cv_folds: default_cv_folds(),
            gate: GateConfig::default(),
        }
    }
}

// =============================================================================
// Persistence
// =============================================================================

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DatabaseConfig {
    /// PostgreSQL connection URL
    pub url: String,
    /// Maximum connections in pool
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

fn default_max_connections() -> u32 {
    5
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_backoff")]
    pub base_backoff_ms: u64,
    #[serde(default = "default_max_backoff")]
    pub max_backoff_ms: u64,
    /// Bounded queue between the live path and the writer task
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
}

fn default_max_attempts() -> u32 {
    5
}
fn default_base_backoff() -> u64 {
    200
}
fn default_max_backoff() -> u64 {
    30_000
}
fn default_queue_capacity() -> usize {
    1024
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_backoff_ms: default_base_backoff(),
            max_backoff_ms: default_max_backoff(),
            queue_capacity: default_queue_capacity(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct PersistenceConfig {
    /// In-memory store when unset
    #[serde(default)]
    pub database: Option<DatabaseConfig>,
    #[serde(default)]
    pub retry: RetryConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Enable JSON formatted logs
    #[serde(default)]
    pub json: bool,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

impl AppConfig {
    /// Load configuration from files and environment
    pub fn load() -> std::result::Result<Self, ConfigError> {
        Self::load_from("config")
    }

    /// Load configuration from a specific directory
    pub fn load_from<P: AsRef<Path>>(config_dir: P) -> std::result::Result<Self, ConfigError> {
        let config_dir = config_dir.as_ref();

        let builder = Config::builder()
            .set_default("logging.level", "info")?
            .set_default("logging.json", false)?
            // Load default config file
            .add_source(File::from(config_dir.join("default.toml")).required(false))
            // Load environment-specific config (e.g., config/production.toml)
            .add_source(
                File::from(config_dir.join(
                    std::env::var("AUTOTRADER_ENV").unwrap_or_else(|_| "development".to_string()),
                ))
                .required(false),
            )
            // Override with environment variables (AUTOTRADER_RISK__MAX_DRAWDOWN_PCT, etc.)
            .add_source(
                Environment::with_prefix("AUTOTRADER")
                    .separator("__")
                    .try_parsing(true),
            );

        builder.build()?.try_deserialize()
    }

    /// Load and validate, mapping every problem to a `Configuration` error
    pub fn load_validated<P: AsRef<Path>>(config_dir: P) -> Result<Self> {
        Self::load_from(config_dir)?.validated()
    }

    pub fn validated(self) -> Result<Self> {
        match self.validate() {
            Ok(()) => Ok(self),
            Err(errors) => Err(AutotraderError::Configuration(errors.join("; "))),
        }
    }

    /// Validate configuration values
    pub fn validate(&self) -> std::result::Result<(), Vec<String>> {
        let mut errors = Vec::new();
        let risk = &self.risk;

        if !(0.0..=1.0).contains(&risk.news_confidence_threshold) {
            errors.push("news_confidence_threshold must be between 0 and 1".to_string());
        }
        if risk.news_blackout_minutes < 0 {
            errors.push("news_blackout_minutes must be non-negative".to_string());
        }
        if risk.spread_stop_ratio <= 0.0 {
            errors.push("spread_stop_ratio must be positive".to_string());
        }
        if risk.risk_per_trade <= 0.0 || risk.risk_per_trade >= 1.0 {
            errors.push("risk_per_trade must be between 0 and 1".to_string());
        }
        if risk.point_value <= 0.0 {
            errors.push("point_value must be positive".to_string());
        }
        if risk.lot_step <= 0.0 || risk.lot_min <= 0.0 {
            errors.push("lot_step and lot_min must be positive".to_string());
        }
        if risk.drawdown_recovery_pct >= risk.max_drawdown_pct {
            errors.push(format!(
                "drawdown_recovery_pct ({}) must be below max_drawdown_pct ({})",
                risk.drawdown_recovery_pct, risk.max_drawdown_pct
            ));
        }
        if risk.drawdown_recovery_pct < 0.0 {
            errors.push("drawdown_recovery_pct must be non-negative".to_string());
        }
        for tier in &risk.lot_tiers {
            if tier.balance_max <= tier.balance_min || tier.lot <= 0.0 {
                errors.push(format!("invalid lot tier: {:?}", tier));
            }
        }

        let bandit = &self.bandit;
        if bandit.prior_alpha <= 0.0 || bandit.prior_beta <= 0.0 {
            errors.push("bandit priors must be positive".to_string());
        }
        if bandit.increment <= 0.0 {
            errors.push("bandit increment must be positive".to_string());
        }
        if !(bandit.reward_min < bandit.reward_midpoint && bandit.reward_midpoint < bandit.reward_max) {
            errors.push("reward range must satisfy min < midpoint < max".to_string());
        }
        if bandit.decay_half_life == 0 {
            errors.push("decay_half_life must be positive".to_string());
        }

        match self.reward.mapping {
            RewardMapping::Linear { scale } | RewardMapping::Tanh { scale } if scale <= 0.0 => {
                errors.push("reward mapping scale must be positive".to_string());
            }
            _ => {}
        }

        if self.bucketing.trend_cuts.windows(2).any(|w| w[1] <= w[0]) {
            errors.push("bucketing.trend_cuts must be strictly ascending".to_string());
        }

        let wf = &self.walk_forward;
        if wf.train_hours <= 0 || wf.test_hours <= 0 || wf.step_hours <= 0 {
            errors.push("walk-forward window lengths and step must be positive".to_string());
        }
        if wf.cv_folds < 2 {
            errors.push("cv_folds must be at least 2".to_string());
        }
        if !(0.0..=1.0).contains(&wf.gate.shrink_factor) {
            errors.push("gate.shrink_factor must be between 0 and 1".to_string());
        }

        let retry = &self.persistence.retry;
        if retry.max_attempts == 0 || retry.queue_capacity == 0 {
            errors.push("retry.max_attempts and retry.queue_capacity must be positive".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}
