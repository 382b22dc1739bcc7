//! Live decision loop.
//!
//! One `run_epoch` per bar close: build context, select an arm, let its
//! strategy propose, gate through the risk guard, and submit. `settle` closes
//! the trade when the executor reports the exit and feeds the realized reward
//! back into the bandit. Records go through the background recorder so
//! storage latency never holds up a decision.

use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use super::context::{BarContextBuilder, ContextBuilder, MarketSnapshot};
use super::executor::{ExecutionResult, Executor};
use crate::bandit::{
    BanditSelector, BanditSnapshot, ConfiguredBucketer, ConfiguredReward, DriftDetector,
    PageHinkley, RewardShaper,
};
use crate::config::{AppConfig, DriftResponse};
use crate::domain::{ArmId, BanditStatRecord, Context, EquityPoint, Exit, NewsEvent, Trade};
use crate::error::{AutotraderError, Result};
use crate::persistence::{BackgroundRecorder, Record, WriteIntent};
use crate::risk::{Decision, PortfolioState, RejectReason, ResizeReason, RiskGuard};
use crate::strategy::Strategy;

/// Why an epoch ended without a submission
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlatReason {
    NoEligibleArm,
    NoSignal,
}

/// What one decision epoch did
#[derive(Debug, Clone, PartialEq)]
pub enum EpochOutcome {
    Flat { arm: Option<ArmId>, reason: FlatReason },
    Rejected { arm: ArmId, reason: RejectReason },
    ExecutorRejected { arm: ArmId, reason: String },
    Opened { trade: Trade, resized: Option<ResizeReason> },
}

/// Result of settling one trade
#[derive(Debug, Clone, PartialEq)]
pub struct Settlement {
    pub trade: Trade,
    pub reward: f64,
    pub stat: BanditStatRecord,
    pub equity: EquityPoint,
    pub drift_detected: bool,
}

pub struct DecisionEngine {
    selector: BanditSelector,
    guard: RiskGuard,
    strategies: BTreeMap<ArmId, Box<dyn Strategy>>,
    context_builder: Box<dyn ContextBuilder>,
    executor: Arc<dyn Executor>,
    reward: Box<dyn RewardShaper>,
    drift: Box<dyn DriftDetector>,
    recorder: BackgroundRecorder,
    portfolio: PortfolioState,
    open: HashMap<Uuid, Trade>,
    drift_response: DriftResponse,
    decay_half_life: u32,
}

impl DecisionEngine {
    /// Wire an engine from configuration, registering one arm per strategy.
    pub fn new(
        config: &AppConfig,
        strategies: Vec<Box<dyn Strategy>>,
        executor: Arc<dyn Executor>,
        recorder: BackgroundRecorder,
        balance: f64,
    ) -> Result<Self> {
        let mut selector = BanditSelector::new(
            config.bandit.clone(),
            Box::new(ConfiguredBucketer::new(config.bucketing.clone())),
        )?;

        let mut by_id = BTreeMap::new();
        for strategy in strategies {
            let id = strategy.id().clone();
            if by_id.contains_key(&id) {
                return Err(AutotraderError::Configuration(format!(
                    "duplicate strategy id {}",
                    id
                )));
            }
            selector.register_arm(strategy.arm_spec());
            by_id.insert(id, strategy);
        }

        Ok(Self {
            selector,
            guard: RiskGuard::new(config.risk.clone()),
            strategies: by_id,
            context_builder: Box::new(BarContextBuilder::for_risk(&config.risk)),
            executor,
            reward: Box::new(ConfiguredReward::new(config.reward.mapping, &config.bandit)),
            drift: Box::new(PageHinkley::new(
                config.bandit.drift_delta,
                config.bandit.drift_threshold,
            )),
            recorder,
            portfolio: PortfolioState::new(balance),
            open: HashMap::new(),
            drift_response: config.bandit.drift_response,
            decay_half_life: config.bandit.decay_half_life,
        })
    }

    pub fn with_context_builder(mut self, builder: Box<dyn ContextBuilder>) -> Self {
        self.context_builder = builder;
        self
    }

    pub fn with_reward_shaper(mut self, reward: Box<dyn RewardShaper>) -> Self {
        self.reward = reward;
        self
    }

    pub fn with_drift_detector(mut self, drift: Box<dyn DriftDetector>) -> Self {
        self.drift = drift;
        self
    }

    pub fn selector(&self) -> &BanditSelector {
        &self.selector
    }

    /// Mutable access for offline work such as walk-forward feedback.
    pub fn selector_mut(&mut self) -> &mut BanditSelector {
        &mut self.selector
    }

    pub fn portfolio(&self) -> &PortfolioState {
        &self.portfolio
    }

    pub fn open_trades(&self) -> impl Iterator<Item = &Trade> {
        self.open.values()
    }

    pub fn snapshot_bandit(&self) -> BanditSnapshot {
        self.selector.snapshot()
    }

    pub fn restore_bandit(&mut self, snapshot: &BanditSnapshot) -> Result<()> {
        self.selector.restore(snapshot)
    }

    /// Queue news events for the `news_events` table.
    pub fn record_news(&self, events: &[NewsEvent]) {
        for event in events {
            self.persist(event.clone().into(), WriteIntent::Insert);
        }
    }

    /// Run one decision epoch.
    ///
    /// `NoEligibleArm` and guard rejections are ordinary outcomes. Errors are
    /// reserved for malformed market data and executor failures.
    #[instrument(skip_all, fields(symbol = snapshot.symbol, ts = %snapshot.ts))]
    pub async fn run_epoch(&mut self, snapshot: &MarketSnapshot<'_>) -> Result<EpochOutcome> {
        let context = self.context_builder.build(snapshot)?;

        let arm = match self.selector.select(&context) {
            Ok(arm) => arm,
            Err(AutotraderError::NoEligibleArm) => {
                debug!(regime = %context.regime, "no eligible arm, staying flat");
                return Ok(EpochOutcome::Flat {
                    arm: None,
                    reason: FlatReason::NoEligibleArm,
                });
            }
            Err(e) => return Err(e),
        };

        let strategy = self
            .strategies
            .get(&arm.id)
            .ok_or_else(|| AutotraderError::UnknownArm(arm.id.to_string()))?;
        let mut proposed = match strategy.propose(&context, snapshot.bars) {
            Some(p) => p,
            None => {
                debug!(arm = %arm.id, "no signal");
                return Ok(EpochOutcome::Flat {
                    arm: Some(arm.id),
                    reason: FlatReason::NoSignal,
                });
            }
        };
        proposed.params.extend(arm.params.clone());

        let (approved, resized) =
            match self.guard.evaluate(&proposed, &context, &self.portfolio, snapshot.ts) {
                Decision::Approve(trade) => (trade, None),
                Decision::Resize(trade, reason) => (trade, Some(reason)),
                Decision::Reject(reason) => {
                    info!(arm = %arm.id, code = reason.code(), "trade rejected by risk guard");
                    return Ok(EpochOutcome::Rejected { arm: arm.id, reason });
                }
            };

        // Approved trades run to a terminal executor answer.
        match self.executor.submit(&approved).await? {
            ExecutionResult::Filled(fill) => {
                let mut approved = approved;
                approved.entry = fill.price;
                approved.lot = fill.lot;
                let mut trade = Trade::open(approved, &context, context.ts);
                trade.slippage = fill.slippage;

                info!(
                    trade_id = %trade.id,
                    arm = %trade.strategy,
                    direction = %trade.direction,
                    lot = trade.lot,
                    entry = trade.entry,
                    "trade opened"
                );
                self.portfolio.open_positions += 1;
                self.open.insert(trade.id, trade.clone());
                self.persist(trade.clone().into(), WriteIntent::Insert);
                Ok(EpochOutcome::Opened { trade, resized })
            }
            ExecutionResult::Rejected { reason } => {
                warn!(arm = %arm.id, %reason, "executor rejected trade");
                Ok(EpochOutcome::ExecutorRejected { arm: arm.id, reason })
            }
        }
    }

    /// Close an open trade and learn from it.
    ///
    /// The belief update lands in the bucket of the entry context, so the
    /// arm is credited where it was chosen.
    #[instrument(skip(self, exit), fields(exit_ts = %exit.ts))]
    pub fn settle(
        &mut self,
        trade_id: Uuid,
        exit: Exit,
        balance: f64,
        equity: f64,
    ) -> Result<Settlement> {
        let mut trade = self
            .open
            .remove(&trade_id)
            .ok_or_else(|| AutotraderError::UnknownTrade(trade_id.to_string()))?;
        if let Err(e) = trade.close(exit, self.guard.config().point_value) {
            self.open.insert(trade_id, trade);
            return Err(e);
        }
        self.portfolio.open_positions = self.portfolio.open_positions.saturating_sub(1);

        let entry_context: Context = serde_json::from_value(trade.context.clone())?;
        let pnl_atr = trade.pnl_atr.unwrap_or(0.0);
        let reward = self.reward.shape(pnl_atr);
        let mut stat = self.selector.update(&trade.strategy, reward, &entry_context)?;
        // Audit rows are keyed by settlement time
        stat.ts = exit.ts;

        let drift_detected = self.drift.check(&trade.strategy, reward);
        if drift_detected {
            self.respond_to_drift(&trade.strategy)?;
        }

        let point = self.portfolio.settle(exit.ts, balance, equity, &self.guard);
        info!(
            trade_id = %trade.id,
            arm = %trade.strategy,
            pnl = trade.pnl.unwrap_or(0.0),
            pnl_atr,
            reward,
            dd_pct = point.dd_pct,
            "trade settled"
        );

        self.persist(trade.clone().into(), WriteIntent::Update);
        self.persist(stat.clone().into(), WriteIntent::Insert);
        self.persist(point.clone().into(), WriteIntent::Insert);

        Ok(Settlement {
            trade,
            reward,
            stat,
            equity: point,
            drift_detected,
        })
    }

    /// Mark-to-market update without a trade closing.
    pub fn mark(&mut self, ts: DateTime<Utc>, balance: f64, equity: f64) -> EquityPoint {
        let point = self.portfolio.settle(ts, balance, equity, &self.guard);
        self.persist(point.clone().into(), WriteIntent::Insert);
        point
    }

    fn respond_to_drift(&mut self, arm: &ArmId) -> Result<()> {
        warn!(arm = %arm, response = ?self.drift_response, "reward drift detected");
        match self.drift_response {
            DriftResponse::Reinitialize => self.selector.reinitialize(arm)?,
            DriftResponse::Decay => self.selector.decay_arm(arm, self.decay_half_life)?,
        }
        self.drift.reset(arm);
        Ok(())
    }

    fn persist(&self, record: Record, intent: WriteIntent) {
        if let Err(e) = self.recorder.submit(record, intent) {
            warn!(error = %e, "record not queued");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bandit::ArmSpec;
    use crate::config::RetryConfig;
    use crate::domain::context::fixtures::{now, quiet_context};
    use crate::domain::{Bar, Direction, ProposedTrade, Regime, TimeWindow};
    use crate::engine::executor::{Fill, MockExecutor};
    use crate::persistence::{InMemoryGateway, PersistenceGateway};
    use crate::walkforward::{StrategyMetrics, TrainingSet};
    use crate::strategy::FitReport;
    use chrono::Duration;
    use serde_json::{Map, Value as JsonValue};

    struct FixedContext(Context);

    impl ContextBuilder for FixedContext {
        fn build(&self, snapshot: &MarketSnapshot<'_>) -> Result<Context> {
            Ok(Context {
                ts: snapshot.ts,
                news: snapshot.news.to_vec(),
                ..self.0.clone()
            })
        }
    }

    /// Always long at 2000 with a 3.0 stop and 4.0 target.
    struct AlwaysLong {
        id: ArmId,
        regimes: Vec<Regime>,
    }

    impl AlwaysLong {
        fn boxed(regimes: &[Regime]) -> Box<dyn Strategy> {
            Box::new(Self {
                id: ArmId::new("long_M5"),
                regimes: regimes.to_vec(),
            })
        }
    }

    impl Strategy for AlwaysLong {
        fn id(&self) -> &ArmId {
            &self.id
        }

        fn timeframe(&self) -> &str {
            "M5"
        }

        fn params(&self) -> Map<String, JsonValue> {
            let mut params = Map::new();
            params.insert("atr_stop".to_string(), 1.5.into());
            params
        }

        fn valid_for_regime(&self, regime: Regime) -> bool {
            self.regimes.contains(&regime)
        }

        fn propose(&self, context: &Context, _bars: &[Bar]) -> Option<ProposedTrade> {
            Some(ProposedTrade {
                symbol: context.symbol.clone(),
                timeframe: context.timeframe.clone(),
                strategy: self.id.clone(),
                direction: Direction::Long,
                lot: 0.1,
                entry: 2000.0,
                stop_loss: 1997.0,
                take_profit: 2004.0,
                params: Map::new(),
            })
        }

        fn fit(&mut self, _train: &TrainingSet<'_>) -> Result<FitReport> {
            Ok(FitReport::default())
        }

        fn evaluate(&self, _bars: &[Bar], _window: &TimeWindow, _risk: f64) -> Result<StrategyMetrics> {
            Ok(StrategyMetrics::default())
        }

        fn arm_spec(&self) -> ArmSpec {
            ArmSpec::new(self.id.as_str())
                .with_params(self.params())
                .with_regimes(self.regimes.iter().copied())
        }
    }

    fn config() -> AppConfig {
        let mut config = AppConfig::default();
        config.bandit.seed = Some(11);
        config
    }

    fn engine(
        executor: MockExecutor,
        regimes: &[Regime],
    ) -> (DecisionEngine, Arc<InMemoryGateway>, tokio::task::JoinHandle<crate::persistence::RecorderStats>) {
        let gateway = Arc::new(InMemoryGateway::new());
        let (recorder, handle) = BackgroundRecorder::spawn(
            gateway.clone() as Arc<dyn PersistenceGateway>,
            RetryConfig::default(),
        );
        let engine = DecisionEngine::new(
            &config(),
            vec![AlwaysLong::boxed(regimes)],
            Arc::new(executor),
            recorder,
            10_000.0,
        )
        .unwrap()
        .with_context_builder(Box::new(FixedContext(quiet_context())));
        (engine, gateway, handle)
    }

    fn snapshot<'a>(news: &'a [NewsEvent]) -> MarketSnapshot<'a> {
        MarketSnapshot {
            ts: now(),
            symbol: "XAUUSD",
            timeframe: "M5",
            bars: &[],
            spread: None,
            news,
        }
    }

    fn filled_at(price: f64) -> MockExecutor {
        let mut executor = MockExecutor::new();
        executor.expect_submit().times(1).returning(move |trade| {
            Ok(ExecutionResult::Filled(Fill {
                ts: now(),
                price,
                lot: trade.lot,
                slippage: 0.05,
            }))
        });
        executor
    }

    #[tokio::test]
    async fn test_epoch_opens_and_settle_rewards_arm() {
        let (mut engine, gateway, handle) = engine(filled_at(2000.1), &Regime::ALL);

        let outcome = engine.run_epoch(&snapshot(&[])).await.unwrap();
        let trade = match outcome {
            EpochOutcome::Opened { trade, resized } => {
                assert!(resized.is_none());
                trade
            }
            other => panic!("expected open, got {:?}", other),
        };
        assert_eq!(trade.entry, 2000.1);
        assert_eq!(trade.params["atr_stop"], 1.5);
        assert_eq!(engine.portfolio().open_positions, 1);

        let exit = Exit {
            ts: now() + Duration::minutes(30),
            price: 2004.1,
            slippage: 0.0,
        };
        let settled = engine.settle(trade.id, exit, 10_040.0, 10_040.0).unwrap();
        assert!(settled.reward > 0.5);
        assert!(settled.stat.alpha > 1.0);
        assert_eq!(settled.stat.beta, 1.0);
        assert_eq!(engine.portfolio().open_positions, 0);

        let belief = engine
            .selector()
            .belief(&ArmId::new("long_M5"), &quiet_context())
            .unwrap();
        assert_eq!(belief.alpha(), settled.stat.alpha);

        drop(engine);
        let stats = handle.await.unwrap();
        assert_eq!(stats.written, 4);
        assert_eq!(gateway.rows("trades").await.len(), 1);
        assert_eq!(gateway.rows("bandit_stats").await.len(), 1);
        assert_eq!(gateway.rows("equity_curve").await.len(), 1);
        match gateway.get("trades", &trade.id.to_string()).await {
            Some(Record::Trade(stored)) => assert!(stored.is_closed()),
            other => panic!("trade row missing: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_no_eligible_arm_stays_flat() {
        // Ranging-only strategy in a trending context; submit must not be called
        let (mut engine, _gateway, _handle) = engine(MockExecutor::new(), &[Regime::Ranging]);

        let outcome = engine.run_epoch(&snapshot(&[])).await.unwrap();
        assert_eq!(
            outcome,
            EpochOutcome::Flat {
                arm: None,
                reason: FlatReason::NoEligibleArm
            }
        );
    }

    #[tokio::test]
    async fn test_news_blackout_never_reaches_executor() {
        let (mut engine, _gateway, _handle) = engine(MockExecutor::new(), &Regime::ALL);
        let news = vec![NewsEvent {
            ts: now() + Duration::minutes(10),
            source: "calendar".to_string(),
            event: "US_NFP".to_string(),
            sentiment: 0.0,
            confidence: 0.9,
            uncertainty: false,
        }];

        let outcome = engine.run_epoch(&snapshot(&news)).await.unwrap();
        match outcome {
            EpochOutcome::Rejected { reason, .. } => assert_eq!(reason.code(), "news_blackout"),
            other => panic!("expected rejection, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_executor_rejection_opens_nothing() {
        let mut executor = MockExecutor::new();
        executor.expect_submit().times(1).returning(|_| {
            Ok(ExecutionResult::Rejected {
                reason: "market closed".to_string(),
            })
        });
        let (mut engine, _gateway, _handle) = engine(executor, &Regime::ALL);

        let outcome = engine.run_epoch(&snapshot(&[])).await.unwrap();
        assert!(matches!(outcome, EpochOutcome::ExecutorRejected { .. }));
        assert_eq!(engine.open_trades().count(), 0);
        assert_eq!(engine.portfolio().open_positions, 0);
    }

    #[tokio::test]
    async fn test_second_epoch_hits_position_limit() {
        let (mut engine, _gateway, _handle) = engine(filled_at(2000.0), &Regime::ALL);

        assert!(matches!(
            engine.run_epoch(&snapshot(&[])).await.unwrap(),
            EpochOutcome::Opened { .. }
        ));
        match engine.run_epoch(&snapshot(&[])).await.unwrap() {
            EpochOutcome::Rejected { reason, .. } => assert_eq!(reason.code(), "max_positions"),
            other => panic!("expected rejection, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_settle_unknown_trade() {
        let (mut engine, _gateway, _handle) = engine(MockExecutor::new(), &Regime::ALL);
        let exit = Exit {
            ts: now(),
            price: 2000.0,
            slippage: 0.0,
        };
        let err = engine.settle(Uuid::new_v4(), exit, 10_000.0, 10_000.0).unwrap_err();
        assert!(matches!(err, AutotraderError::UnknownTrade(_)));
    }
}
