//! Walk-forward runner: fit on train, score on test, feed results back into the bandit.

use chrono::{Duration, Utc};
use serde_json::{json, Map, Value as JsonValue};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

use super::metrics::StrategyMetrics;
use super::purge::TrainingSet;
use super::windows::{plan_windows, WindowPair};
use crate::bandit::{BanditSelector, RewardShaper};
use crate::config::{GateAction, WalkForwardConfig};
use crate::domain::{timeframe_duration, ArmId, HistoricalSeries, WalkForwardRun};
use crate::engine::context::{BarContextBuilder, ContextBuilder, MarketSnapshot};
use crate::error::{AutotraderError, Result};
use crate::persistence::{PersistenceGateway, WriteIntent};
use crate::strategy::{FitReport, Strategy};

/// Cooperative cancellation, checked between windows.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Fit reports and test metrics of every strategy for one window
#[derive(Debug, Default)]
struct WindowResult {
    fits: BTreeMap<ArmId, FitReport>,
    metrics: BTreeMap<ArmId, StrategyMetrics>,
}

pub struct WalkForwardOrchestrator {
    gateway: Arc<dyn PersistenceGateway>,
    context_builder: Box<dyn ContextBuilder>,
    reward: Box<dyn RewardShaper>,
    risk_per_trade: f64,
    cancel: CancelFlag,
}

impl WalkForwardOrchestrator {
    pub fn new(
        gateway: Arc<dyn PersistenceGateway>,
        reward: Box<dyn RewardShaper>,
        risk_per_trade: f64,
    ) -> Self {
        Self {
            gateway,
            context_builder: Box::new(BarContextBuilder::default()),
            reward,
            risk_per_trade,
            cancel: CancelFlag::new(),
        }
    }

    pub fn with_context_builder(mut self, builder: Box<dyn ContextBuilder>) -> Self {
        self.context_builder = builder;
        self
    }

    /// Handle that stops the run before the next window starts.
    pub fn cancel_flag(&self) -> CancelFlag {
        self.cancel.clone()
    }

    /// Run every planned window in order.
    ///
    /// A strategy or feedback error fails only its window; the registry entry
    /// records the error and the run moves on. Leakage errors and failed
    /// registry writes abort the run. Cancellation returns the windows
    /// completed so far.
    #[instrument(skip_all, fields(symbol = %series.symbol, timeframe = %series.timeframe))]
    pub async fn run(
        &self,
        series: &HistoricalSeries,
        strategies: &mut [Box<dyn Strategy>],
        config: &WalkForwardConfig,
        selector: &mut BanditSelector,
    ) -> Result<Vec<WalkForwardRun>> {
        let bar_duration = timeframe_duration(&series.timeframe).ok_or_else(|| {
            AutotraderError::Configuration(format!("unknown timeframe {}", series.timeframe))
        })?;
        let (start, last) = match (series.first_ts(), series.last_ts()) {
            (Some(first), Some(last)) => (first, last),
            _ => {
                return Err(AutotraderError::InvalidMarketData(format!(
                    "empty series {}",
                    series.symbol
                )))
            }
        };

        let plan = plan_windows(start, last + bar_duration, config)?;
        if plan.is_empty() {
            warn!(bars = series.len(), "series too short for a single window");
            return Ok(Vec::new());
        }

        for strategy in strategies.iter() {
            if !selector.arm_ids().any(|id| id == strategy.id()) {
                selector.register_arm(strategy.arm_spec());
            }
        }

        info!(windows = plan.len(), strategies = strategies.len(), "walk-forward started");
        let config_json = serde_json::to_value(config)?;
        let mut runs = Vec::with_capacity(plan.len());

        for (index, pair) in plan.iter().enumerate() {
            if self.cancel.is_cancelled() {
                info!(completed = runs.len(), "walk-forward cancelled");
                break;
            }

            let mut run =
                WalkForwardRun::pending(Utc::now(), pair.train, pair.test, config_json.clone())?;
            run.start()?;
            self.gateway.record(run.clone().into(), WriteIntent::Insert).await?;

            match self.run_window(series, strategies, config, pair, bar_duration) {
                Ok(result) => {
                    let before = selector.snapshot();
                    match self.feedback(series, config, pair, &run, &result, selector).await {
                        Ok(gate) => {
                            run.succeed(json!({
                                "strategies": result.metrics,
                                "fit": result.fits,
                                "gate": gate,
                            }))?;
                            info!(window = index, test = %pair.test, "window succeeded");
                        }
                        Err(e) => {
                            warn!(window = index, test = %pair.test, error = %e, "bandit feedback failed");
                            selector.restore(&before)?;
                            run.fail(&format!("feedback: {}", e))?;
                        }
                    }
                }
                Err(e @ AutotraderError::LeakageViolation(_)) => {
                    run.fail(&e.to_string())?;
                    self.gateway.record(run.into(), WriteIntent::Update).await?;
                    return Err(e);
                }
                Err(e) => {
                    warn!(window = index, test = %pair.test, error = %e, "window failed");
                    run.fail(&e.to_string())?;
                }
            }

            self.gateway.record(run.clone().into(), WriteIntent::Update).await?;
            runs.push(run);
        }

        info!(
            windows = runs.len(),
            failed = runs.iter().filter(|r| r.error().is_some()).count(),
            "walk-forward finished"
        );
        Ok(runs)
    }

    fn run_window(
        &self,
        series: &HistoricalSeries,
        strategies: &mut [Box<dyn Strategy>],
        config: &WalkForwardConfig,
        pair: &WindowPair,
        bar_duration: Duration,
    ) -> Result<WindowResult> {
        let train = TrainingSet {
            bars: series.slice(&pair.train),
            window: pair.train,
            bar_duration,
            label_horizon: config.label_horizon_bars,
            cv_folds: config.cv_folds,
            embargo: config.embargo_bars,
        };
        let visible = series.up_to(pair.test.end);

        let mut result = WindowResult::default();
        for strategy in strategies.iter_mut() {
            let id = strategy.id().clone();
            let fit = strategy.fit(&train).map_err(|e| attribute(&id, e))?;
            debug!(arm = %id, samples = fit.samples, purged = fit.purged, "fitted");

            let metrics = strategy
                .evaluate(visible, &pair.test, self.risk_per_trade)
                .map_err(|e| attribute(&id, e))?;
            debug!(arm = %id, trades = metrics.trades, sharpe = metrics.sharpe, "evaluated");

            result.fits.insert(id.clone(), fit);
            result.metrics.insert(id, metrics);
        }
        Ok(result)
    }

    /// One belief update per strategy that traded, then the promotion gate.
    ///
    /// Audit rows carry the run's timestamp and id, so a rerun over the same
    /// history writes new rows. The caller restores the selector on error.
    async fn feedback(
        &self,
        series: &HistoricalSeries,
        config: &WalkForwardConfig,
        pair: &WindowPair,
        run: &WalkForwardRun,
        result: &WindowResult,
        selector: &mut BanditSelector,
    ) -> Result<Map<String, JsonValue>> {
        let snapshot = MarketSnapshot {
            ts: pair.test.end,
            symbol: &series.symbol,
            timeframe: &series.timeframe,
            bars: series.up_to(pair.test.end),
            spread: None,
            news: &[],
        };
        let context = match self.context_builder.build(&snapshot) {
            Ok(context) => Some(context),
            Err(e) => {
                warn!(test = %pair.test, error = %e, "no context for bandit feedback");
                None
            }
        };

        let mut gate = Map::new();
        let mut stats = Vec::new();
        for (id, metrics) in &result.metrics {
            if let (Some(context), true) = (&context, metrics.trades > 0) {
                let reward = self.reward.shape(metrics.avg_pnl_atr);
                let mut stat = selector.update(id, reward, context)?;
                stat.ts = run.ts;
                if let Some(fields) = stat.context.as_object_mut() {
                    fields.insert("wf_run_id".to_string(), json!(run.id));
                }
                stats.push(stat);
            }

            let failures = metrics.gate_failures(&config.gate);
            if failures.is_empty() {
                selector.enable_arm(id)?;
                gate.insert(id.to_string(), json!({ "passed": true }));
            } else {
                match config.gate.action {
                    GateAction::Disable => selector.disable_arm(id)?,
                    GateAction::Shrink => selector.shrink_prior(id, config.gate.shrink_factor)?,
                }
                gate.insert(
                    id.to_string(),
                    json!({
                        "passed": false,
                        "failures": failures,
                        "action": config.gate.action,
                    }),
                );
            }
        }

        for stat in stats {
            self.gateway.record(stat.into(), WriteIntent::Insert).await?;
        }
        Ok(gate)
    }
}

fn attribute(id: &ArmId, err: AutotraderError) -> AutotraderError {
    match err {
        AutotraderError::Evaluation { .. } | AutotraderError::LeakageViolation(_) => err,
        other => AutotraderError::Evaluation {
            strategy: id.to_string(),
            reason: other.to_string(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bandit::{ConfiguredBucketer, ConfiguredReward};
    use crate::config::{BanditConfig, RewardMapping};
    use crate::domain::{Bar, Context, ProposedTrade, Regime, RunStatus, TimeWindow};
    use crate::persistence::{InMemoryGateway, Record};
    use crate::strategy::indicators::fixtures::bars_from_closes;
    use chrono::{DateTime, TimeZone};

    /// Fixed metrics, failing on the test window that starts at `fail_at`.
    struct Scripted {
        id: ArmId,
        fail_at: Option<DateTime<Utc>>,
        metrics: StrategyMetrics,
    }

    impl Scripted {
        fn new(fail_at: Option<DateTime<Utc>>) -> Self {
            Self {
                id: ArmId::new("scripted_H1"),
                fail_at,
                metrics: StrategyMetrics {
                    trades: 6,
                    total_return_pct: 3.0,
                    max_drawdown_pct: 1.0,
                    hit_rate: 0.6,
                    avg_pnl_atr: 0.8,
                    sharpe: 0.9,
                },
            }
        }
    }

    impl Strategy for Scripted {
        fn id(&self) -> &ArmId {
            &self.id
        }

        fn timeframe(&self) -> &str {
            "H1"
        }

        fn params(&self) -> Map<String, JsonValue> {
            Map::new()
        }

        fn valid_for_regime(&self, _regime: Regime) -> bool {
            true
        }

        fn propose(&self, _context: &Context, _bars: &[Bar]) -> Option<ProposedTrade> {
            None
        }

        fn fit(&mut self, train: &TrainingSet<'_>) -> Result<FitReport> {
            Ok(FitReport {
                samples: train.bars.len(),
                ..FitReport::default()
            })
        }

        fn evaluate(&self, bars: &[Bar], window: &TimeWindow, _risk: f64) -> Result<StrategyMetrics> {
            assert!(bars.iter().all(|b| b.ts < window.end));
            if Some(window.start) == self.fail_at {
                return Err(AutotraderError::Evaluation {
                    strategy: self.id.to_string(),
                    reason: "scripted failure".to_string(),
                });
            }
            Ok(self.metrics.clone())
        }
    }

    fn start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
    }

    fn series() -> HistoricalSeries {
        let closes: Vec<f64> = (0..60).map(|i| 2000.0 + (i as f64 * 0.7).sin() * 3.0).collect();
        HistoricalSeries::new("XAUUSD", "H1", bars_from_closes(&closes)).unwrap()
    }

    fn wf_config() -> WalkForwardConfig {
        WalkForwardConfig {
            train_hours: 24,
            test_hours: 12,
            step_hours: 12,
            ..WalkForwardConfig::default()
        }
    }

    fn selector() -> BanditSelector {
        BanditSelector::new(
            BanditConfig {
                seed: Some(7),
                ..BanditConfig::default()
            },
            Box::new(ConfiguredBucketer::default()),
        )
        .unwrap()
    }

    fn orchestrator(gateway: Arc<InMemoryGateway>) -> WalkForwardOrchestrator {
        let reward = ConfiguredReward::new(RewardMapping::Linear { scale: 2.0 }, &BanditConfig::default());
        WalkForwardOrchestrator::new(gateway, Box::new(reward), 0.01)
    }

    #[tokio::test]
    async fn test_failed_window_does_not_stop_the_run() {
        let gateway = Arc::new(InMemoryGateway::new());
        let orchestrator = orchestrator(gateway.clone());
        let mut strategies: Vec<Box<dyn Strategy>> =
            vec![Box::new(Scripted::new(Some(start() + Duration::hours(36))))];
        let mut selector = selector();

        let runs = orchestrator
            .run(&series(), &mut strategies, &wf_config(), &mut selector)
            .await
            .unwrap();

        let statuses: Vec<RunStatus> = runs.iter().map(|r| r.status).collect();
        assert_eq!(
            statuses,
            vec![RunStatus::Succeeded, RunStatus::Failed, RunStatus::Succeeded]
        );
        assert!(runs[1].error().unwrap().contains("scripted failure"));
        assert_eq!(runs[0].metrics["strategies"]["scripted_H1"]["trades"], 6);

        for run in &runs {
            match gateway.get("wf_registry", &run.id.to_string()).await {
                Some(Record::WalkForward(stored)) => assert_eq!(&stored, run),
                other => panic!("registry entry missing: {:?}", other),
            }
        }
        // One audit row per successful window
        assert_eq!(gateway.rows("bandit_stats").await.len(), 2);
    }

    #[tokio::test]
    async fn test_feedback_moves_belief_and_gate_disables() {
        let gateway = Arc::new(InMemoryGateway::new());
        let orchestrator = orchestrator(gateway.clone());
        let mut losing = Scripted::new(None);
        losing.metrics.sharpe = -0.5;
        losing.metrics.avg_pnl_atr = -1.0;
        let id = losing.id.clone();
        let mut strategies: Vec<Box<dyn Strategy>> = vec![Box::new(losing)];
        let mut selector = selector();

        let runs = orchestrator
            .run(&series(), &mut strategies, &wf_config(), &mut selector)
            .await
            .unwrap();

        assert!(runs.iter().all(|r| r.status == RunStatus::Succeeded));
        assert!(selector.is_disabled(&id));
        assert_eq!(runs[0].metrics["gate"]["scripted_H1"]["passed"], false);
    }

    #[tokio::test]
    async fn test_cancel_stops_before_next_window() {
        let gateway = Arc::new(InMemoryGateway::new());
        let orchestrator = orchestrator(gateway.clone());
        orchestrator.cancel_flag().cancel();
        let mut strategies: Vec<Box<dyn Strategy>> = vec![Box::new(Scripted::new(None))];
        let mut selector = selector();

        let runs = orchestrator
            .run(&series(), &mut strategies, &wf_config(), &mut selector)
            .await
            .unwrap();

        assert!(runs.is_empty());
        assert!(gateway.is_empty().await);
    }

    #[tokio::test]
    async fn test_rerun_over_same_history_writes_fresh_rows() {
        let gateway = Arc::new(InMemoryGateway::new());
        let orchestrator = orchestrator(gateway.clone());
        let mut strategies: Vec<Box<dyn Strategy>> = vec![Box::new(Scripted::new(None))];
        let mut selector = selector();

        for _ in 0..2 {
            let runs = orchestrator
                .run(&series(), &mut strategies, &wf_config(), &mut selector)
                .await
                .unwrap();
            assert_eq!(runs.len(), 3);
            assert!(runs.iter().all(|r| r.status == RunStatus::Succeeded));
        }

        let registry = gateway.rows("wf_registry").await;
        assert_eq!(registry.len(), 6);
        for row in &registry {
            match row {
                Record::WalkForward(run) => assert!(run.status.is_terminal()),
                other => panic!("unexpected row {:?}", other),
            }
        }
        assert_eq!(gateway.rows("bandit_stats").await.len(), 6);
    }

    /// Refuses every bandit audit row, accepts everything else.
    struct NoStats(InMemoryGateway);

    #[async_trait::async_trait]
    impl PersistenceGateway for NoStats {
        async fn record(&self, record: Record, intent: WriteIntent) -> Result<()> {
            if let Record::BanditStat(_) = record {
                return Err(AutotraderError::PersistenceFailure("stats table offline".to_string()));
            }
            self.0.record(record, intent).await
        }
    }

    #[tokio::test]
    async fn test_feedback_failure_fails_window_and_rolls_back_beliefs() {
        let gateway = Arc::new(NoStats(InMemoryGateway::new()));
        let reward = ConfiguredReward::new(RewardMapping::Linear { scale: 2.0 }, &BanditConfig::default());
        let orchestrator = WalkForwardOrchestrator::new(gateway.clone(), Box::new(reward), 0.01);
        let mut strategies: Vec<Box<dyn Strategy>> = vec![Box::new(Scripted::new(None))];
        let mut selector = selector();
        selector.register_arm(strategies[0].arm_spec());
        let before = selector.snapshot();

        let runs = orchestrator
            .run(&series(), &mut strategies, &wf_config(), &mut selector)
            .await
            .unwrap();

        assert_eq!(runs.len(), 3);
        assert!(runs.iter().all(|r| r.status == RunStatus::Failed));
        assert!(runs[0].error().unwrap().contains("stats table offline"));
        assert_eq!(selector.snapshot(), before);
        for row in gateway.0.rows("wf_registry").await {
            match row {
                Record::WalkForward(run) => assert_eq!(run.status, RunStatus::Failed),
                other => panic!("unexpected row {:?}", other),
            }
        }
    }

    #[tokio::test]
    async fn test_persistence_failure_aborts() {
        let gateway = Arc::new(InMemoryGateway::new());
        gateway.fail_next(1);
        let orchestrator = orchestrator(gateway.clone());
        let mut strategies: Vec<Box<dyn Strategy>> = vec![Box::new(Scripted::new(None))];
        let mut selector = selector();

        let err = orchestrator
            .run(&series(), &mut strategies, &wf_config(), &mut selector)
            .await
            .unwrap_err();
        assert!(matches!(err, AutotraderError::PersistenceFailure(_)));
    }
}
