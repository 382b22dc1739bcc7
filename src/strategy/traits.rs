//! Core strategy trait and the shared ATR-bracket implementation.

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value as JsonValue};
use tracing::debug;

use super::backtest::{label_outcome, simulate, AtrLevels};
use super::indicators::atr;
use crate::bandit::ArmSpec;
use crate::domain::{ArmId, Bar, Context, Direction, ProposedTrade, Regime, TimeWindow};
use crate::error::{AutotraderError, Result};
use crate::walkforward::metrics::StrategyMetrics;
use crate::walkforward::purge::TrainingSet;

// ============================================================================
// Strategy Trait
// ============================================================================

/// Capability set every selectable strategy implements.
pub trait Strategy: Send + Sync {
    /// Arm identifier, unique per strategy instance
    fn id(&self) -> &ArmId;

    /// Bar timeframe the strategy runs on, e.g. "M15"
    fn timeframe(&self) -> &str;

    /// Currently active parameters
    fn params(&self) -> Map<String, JsonValue>;

    /// Whether the strategy has valid parameters for `regime`
    fn valid_for_regime(&self, regime: Regime) -> bool;

    /// Trade to open on the last of `bars`, if the strategy signals.
    ///
    /// `bars` end at the context timestamp; nothing later is visible.
    fn propose(&self, context: &Context, bars: &[Bar]) -> Option<ProposedTrade>;

    /// Re-parametrize from training data only.
    fn fit(&mut self, train: &TrainingSet<'_>) -> Result<FitReport>;

    /// Score the strategy on `window`.
    ///
    /// `bars` end before `window.end`; earlier bars are warm-up only.
    fn evaluate(&self, bars: &[Bar], window: &TimeWindow, risk_per_trade: f64) -> Result<StrategyMetrics>;

    /// Arm registration derived from the regime filter and parameters.
    fn arm_spec(&self) -> ArmSpec {
        ArmSpec::new(self.id().as_str())
            .with_params(self.params())
            .with_regimes(Regime::ALL.into_iter().filter(|r| self.valid_for_regime(*r)))
    }
}

/// What `fit` did with the training window
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct FitReport {
    pub samples: usize,
    pub purged: usize,
    /// Mean out-of-fold pnl_atr of the chosen parameters; `None` if CV was skipped
    pub cv_score: Option<f64>,
    pub params: Map<String, JsonValue>,
}

// ============================================================================
// Signal rules
// ============================================================================

/// Entry rule of a reference strategy.
pub trait SignalRule: Send + Sync {
    /// Default arm name, e.g. "trend_M5"
    fn name(&self) -> &'static str;

    fn timeframe(&self) -> &'static str;

    /// Bars needed before the first signal
    fn warmup(&self) -> usize;

    /// Signal per bar; index `i` may only use `bars[..=i]`.
    fn signals(&self, bars: &[Bar]) -> Vec<Option<Direction>>;

    fn regimes(&self) -> &'static [Regime] {
        &Regime::ALL
    }

    fn params(&self) -> Map<String, JsonValue> {
        Map::new()
    }
}

/// Candidate (stop, take) ATR multiples searched by `fit`.
pub const LEVEL_GRID: [(f64, f64); 4] = [(1.0, 1.5), (1.5, 2.0), (1.5, 3.0), (2.0, 3.0)];

const ATR_PERIOD: usize = 14;

/// A `SignalRule` bracketed by ATR stop and take-profit levels.
pub struct AtrStrategy<R: SignalRule> {
    id: ArmId,
    rule: R,
    levels: AtrLevels,
    lot: f64,
}

impl<R: SignalRule> AtrStrategy<R> {
    pub fn new(rule: R) -> Self {
        Self {
            id: ArmId::new(rule.name()),
            rule,
            levels: AtrLevels::new(1.5, 2.0),
            lot: 0.1,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = ArmId::new(id);
        self
    }

    pub fn with_levels(mut self, levels: AtrLevels) -> Self {
        self.levels = levels;
        self
    }

    pub fn with_lot(mut self, lot: f64) -> Self {
        self.lot = lot;
        self
    }

    pub fn levels(&self) -> AtrLevels {
        self.levels
    }

    fn signal_indices(signals: &[Option<Direction>]) -> Vec<usize> {
        signals
            .iter()
            .enumerate()
            .filter_map(|(i, s)| s.map(|_| i))
            .collect()
    }
}

impl<R: SignalRule> Strategy for AtrStrategy<R> {
    fn id(&self) -> &ArmId {
        &self.id
    }

    fn timeframe(&self) -> &str {
        self.rule.timeframe()
    }

    fn params(&self) -> Map<String, JsonValue> {
        let mut params = self.rule.params();
        params.insert("atr_stop".to_string(), json!(self.levels.stop_mult));
        params.insert("atr_take".to_string(), json!(self.levels.take_mult));
        params.insert("lot".to_string(), json!(self.lot));
        params
    }

    fn valid_for_regime(&self, regime: Regime) -> bool {
        self.rule.regimes().contains(&regime)
    }

    fn propose(&self, context: &Context, bars: &[Bar]) -> Option<ProposedTrade> {
        if bars.len() < self.rule.warmup() || !context.atr.is_finite() || context.atr <= 0.0 {
            return None;
        }
        let last = bars.last()?;
        if last.ts > context.ts {
            return None;
        }
        let direction = self.rule.signals(bars).last().copied().flatten()?;
        let entry = last.close;
        let (stop_loss, take_profit) = self.levels.prices(direction, entry, context.atr);
        Some(ProposedTrade {
            symbol: context.symbol.clone(),
            timeframe: self.rule.timeframe().to_string(),
            strategy: self.id.clone(),
            direction,
            lot: self.lot,
            entry,
            stop_loss,
            take_profit,
            params: self.params(),
        })
    }

    fn fit(&mut self, train: &TrainingSet<'_>) -> Result<FitReport> {
        let signals = self.rule.signals(train.bars);
        let atr = atr(train.bars, ATR_PERIOD);
        let indices = Self::signal_indices(&signals);

        // Label every grid candidate on the same purged sample set.
        let mut labeled = Vec::with_capacity(LEVEL_GRID.len());
        let mut purged = 0;
        for (stop_mult, take_mult) in LEVEL_GRID {
            let levels = AtrLevels::new(stop_mult, take_mult);
            let (samples, dropped) = train.label(indices.iter().copied(), |i| {
                let direction = signals[i]?;
                label_outcome(train.bars, &atr, i, direction, levels, train.label_horizon)
            });
            purged = dropped;
            labeled.push((levels, samples));
        }

        let n = labeled.first().map(|(_, s)| s.len()).unwrap_or(0);
        if n < train.cv_folds.max(2) * 2 || labeled.iter().any(|(_, s)| s.len() != n) {
            debug!(strategy = %self.id, samples = n, "too few samples to fit, keeping parameters");
            return Ok(FitReport {
                samples: n,
                purged,
                cv_score: None,
                params: self.params(),
            });
        }

        // Nested selection: each fold picks the best candidate on its
        // training indices and is scored on its test fold.
        let pnl: Vec<Vec<f64>> = labeled
            .iter()
            .map(|(_, s)| s.iter().map(|x| x.pnl_atr).collect())
            .collect();

        let mut votes = vec![0usize; LEVEL_GRID.len()];
        let mut oos = Vec::new();
        for fold in train.folds(n) {
            let mut best = 0;
            let mut best_score = f64::NEG_INFINITY;
            for (c, values) in pnl.iter().enumerate() {
                let score = mean_at(values, fold.train.iter().copied());
                if score > best_score {
                    best = c;
                    best_score = score;
                }
            }
            votes[best] += 1;
            oos.push(mean_at(&pnl[best], fold.test.clone()));
        }

        let mut chosen = 0;
        for (c, v) in votes.iter().enumerate() {
            if *v > votes[chosen] {
                chosen = c;
            }
        }
        self.levels = labeled[chosen].0;
        let finite: Vec<f64> = oos.into_iter().filter(|x| x.is_finite()).collect();
        let cv_score = if finite.is_empty() {
            None
        } else {
            Some(finite.iter().sum::<f64>() / finite.len() as f64)
        };

        debug!(
            strategy = %self.id,
            samples = n,
            purged,
            stop = self.levels.stop_mult,
            take = self.levels.take_mult,
            ?cv_score,
            "fitted strategy"
        );
        Ok(FitReport {
            samples: n,
            purged,
            cv_score,
            params: self.params(),
        })
    }

    fn evaluate(&self, bars: &[Bar], window: &TimeWindow, risk_per_trade: f64) -> Result<StrategyMetrics> {
        if bars.iter().any(|b| b.ts >= window.end) {
            return Err(AutotraderError::LeakageViolation(format!(
                "{} evaluation given bars at or past {}",
                self.id, window.end
            )));
        }
        if !bars.iter().any(|b| window.contains(b.ts)) {
            return Err(AutotraderError::Evaluation {
                strategy: self.id.to_string(),
                reason: format!("no bars in test window {}", window),
            });
        }
        let signals = self.rule.signals(bars);
        let atr = atr(bars, ATR_PERIOD);
        let outcomes = simulate(bars, &signals, &atr, window, self.levels);
        Ok(StrategyMetrics::from_outcomes(&outcomes, risk_per_trade))
    }
}

fn mean_at(values: &[f64], idx: impl Iterator<Item = usize>) -> f64 {
    let (sum, count) = idx.fold((0.0, 0usize), |(s, c), i| (s + values[i], c + 1));
    if count == 0 {
        f64::NEG_INFINITY
    } else {
        sum / count as f64
    }
}
