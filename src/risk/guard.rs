//! Pre-trade risk gate.
//!
//! Checks run in fixed priority order; the first rejection wins:
//! 1. news blackout
//! 2. spread vs. stop distance (and optional absolute cap)
//! 3. position sizing (resize down, or reject below the minimum lot)
//! 4. drawdown ceiling with recovery hysteresis
//! 5. max concurrent positions
//!
//! A resize from step 3 is carried forward, so a later rejection still wins.
//! Malformed input always rejects.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::debug;

use super::portfolio::PortfolioState;
use crate::config::RiskConfig;
use crate::domain::{Context, NewsEvent, ProposedTrade};

/// Why a trade was rejected
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "code", rename_all = "snake_case")]
pub enum RejectReason {
    NewsBlackout {
        event: String,
        event_ts: DateTime<Utc>,
    },
    SpreadTooWide {
        spread: f64,
        limit: f64,
    },
    LotBelowMinimum {
        max_lot: f64,
        lot_min: f64,
    },
    DrawdownLockout {
        dd_pct: f64,
        recovery_pct: f64,
    },
    MaxPositions {
        open: u32,
        limit: u32,
    },
    MalformedInput {
        problems: Vec<String>,
    },
}

impl RejectReason {
    /// Stable machine-readable code
    pub fn code(&self) -> &'static str {
        match self {
            RejectReason::NewsBlackout { .. } => "news_blackout",
            RejectReason::SpreadTooWide { .. } => "spread_too_wide",
            RejectReason::LotBelowMinimum { .. } => "lot_below_minimum",
            RejectReason::DrawdownLockout { .. } => "drawdown_lockout",
            RejectReason::MaxPositions { .. } => "max_positions",
            RejectReason::MalformedInput { .. } => "malformed_input",
        }
    }
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RejectReason::NewsBlackout { event, event_ts } => {
                write!(f, "News blackout: {} at {}", event, event_ts)
            }
            RejectReason::SpreadTooWide { spread, limit } => {
                write!(f, "Spread {:.5} exceeds limit {:.5}", spread, limit)
            }
            RejectReason::LotBelowMinimum { max_lot, lot_min } => {
                write!(f, "Allowed lot {} below minimum {}", max_lot, lot_min)
            }
            RejectReason::DrawdownLockout { dd_pct, recovery_pct } => {
                write!(
                    f,
                    "Drawdown {:.2}% locked out until below {:.2}%",
                    dd_pct, recovery_pct
                )
            }
            RejectReason::MaxPositions { open, limit } => {
                write!(f, "Open positions {} at limit {}", open, limit)
            }
            RejectReason::MalformedInput { problems } => {
                write!(f, "Malformed input: {}", problems.join(", "))
            }
        }
    }
}

/// Why a trade was resized
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResizeReason {
    pub requested_lot: f64,
    pub allowed_lot: f64,
}

impl fmt::Display for ResizeReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Lot {} exceeds risk budget, resized to {}",
            self.requested_lot, self.allowed_lot
        )
    }
}

/// Outcome of gating one proposed trade
#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    Approve(ProposedTrade),
    Resize(ProposedTrade, ResizeReason),
    Reject(RejectReason),
}

impl Decision {
    pub fn is_rejected(&self) -> bool {
        matches!(self, Decision::Reject(_))
    }

    /// The trade to forward to execution, if any
    pub fn trade(&self) -> Option<&ProposedTrade> {
        match self {
            Decision::Approve(t) | Decision::Resize(t, _) => Some(t),
            Decision::Reject(_) => None,
        }
    }

    pub fn into_trade(self) -> Option<ProposedTrade> {
        match self {
            Decision::Approve(t) | Decision::Resize(t, _) => Some(t),
            Decision::Reject(_) => None,
        }
    }
}

/// Stateless risk guard: a pure function of its inputs and configuration.
#[derive(Debug, Clone)]
pub struct RiskGuard {
    config: RiskConfig,
}

impl RiskGuard {
    pub fn new(config: RiskConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &RiskConfig {
        &self.config
    }

    /// Gate a proposed trade.
    pub fn evaluate(
        &self,
        proposed: &ProposedTrade,
        context: &Context,
        portfolio: &PortfolioState,
        now: DateTime<Utc>,
    ) -> Decision {
        let problems = self.input_problems(proposed, context, portfolio);
        if !problems.is_empty() {
            debug!(strategy = %proposed.strategy, ?problems, "risk guard: failing closed");
            return Decision::Reject(RejectReason::MalformedInput { problems });
        }

        // 1. News blackout
        if let Some(event) = self.blackout_event(&context.news, now) {
            debug!(event = %event.event, "risk guard: news blackout");
            return Decision::Reject(RejectReason::NewsBlackout {
                event: event.event.clone(),
                event_ts: event.ts,
            });
        }

        // 2. Spread
        let stop_distance = proposed.stop_distance();
        let mut spread_limit = self.config.spread_stop_ratio * stop_distance;
        if let Some(cap) = self.config.spread_max_points {
            spread_limit = spread_limit.min(cap);
        }
        if context.spread > spread_limit {
            return Decision::Reject(RejectReason::SpreadTooWide {
                spread: context.spread,
                limit: spread_limit,
            });
        }

        // 3. Position sizing
        let max_lot = self.max_lot(portfolio.equity, portfolio.balance, stop_distance);
        if max_lot < self.config.lot_min {
            return Decision::Reject(RejectReason::LotBelowMinimum {
                max_lot,
                lot_min: self.config.lot_min,
            });
        }
        let resize = if proposed.lot > max_lot {
            Some(ResizeReason {
                requested_lot: proposed.lot,
                allowed_lot: max_lot,
            })
        } else {
            None
        };

        // 4. Drawdown with hysteresis
        if self.drawdown_latched(portfolio.drawdown_latched, portfolio.dd_pct) {
            return Decision::Reject(RejectReason::DrawdownLockout {
                dd_pct: portfolio.dd_pct,
                recovery_pct: self.config.drawdown_recovery_pct,
            });
        }

        // 5. Concurrent positions
        if self.config.max_positions > 0 && portfolio.open_positions >= self.config.max_positions {
            return Decision::Reject(RejectReason::MaxPositions {
                open: portfolio.open_positions,
                limit: self.config.max_positions,
            });
        }

        match resize {
            Some(reason) => {
                debug!(
                    strategy = %proposed.strategy,
                    requested = reason.requested_lot,
                    allowed = reason.allowed_lot,
                    "risk guard: resizing"
                );
                Decision::Resize(proposed.clone().with_lot(reason.allowed_lot), reason)
            }
            None => Decision::Approve(proposed.clone()),
        }
    }

    /// Drawdown latch transition.
    ///
    /// Engages strictly above the ceiling and releases only below the recovery level.
    pub fn drawdown_latched(&self, was_latched: bool, dd_pct: f64) -> bool {
        if was_latched {
            dd_pct >= self.config.drawdown_recovery_pct
        } else {
            dd_pct > self.config.max_drawdown_pct
        }
    }

    /// Largest lot allowed by the risk budget and tier caps, floored to the lot step.
    pub fn max_lot(&self, equity: f64, balance: f64, stop_distance: f64) -> f64 {
        let budget = equity * self.config.risk_per_trade;
        let mut lot = budget / (stop_distance * self.config.point_value);
        if let Some(tier_lot) = self.tier_lot(balance) {
            lot = lot.min(tier_lot);
        }
        floor_to_step(lot, self.config.lot_step)
    }

    fn tier_lot(&self, balance: f64) -> Option<f64> {
        self.config
            .lot_tiers
            .iter()
            .find(|tier| tier.balance_min <= balance && balance < tier.balance_max)
            .map(|tier| tier.lot)
    }

    fn blackout_event<'a>(&self, news: &'a [NewsEvent], now: DateTime<Utc>) -> Option<&'a NewsEvent> {
        let window = Duration::minutes(self.config.news_blackout_minutes);
        news.iter().find(|event| {
            let important = self.config.important_events.is_empty()
                || self.config.important_events.iter().any(|e| e == &event.event);
            important
                && !event.uncertainty
                && event.confidence > self.config.news_confidence_threshold
                && (event.ts - now).abs() <= window
        })
    }

    fn input_problems(
        &self,
        proposed: &ProposedTrade,
        context: &Context,
        portfolio: &PortfolioState,
    ) -> Vec<String> {
        let mut problems = context.problems();

        let prices = [proposed.entry, proposed.stop_loss, proposed.take_profit, proposed.lot];
        if prices.iter().any(|v| !v.is_finite()) {
            problems.push("trade has non-finite price or lot".to_string());
        } else {
            if proposed.lot <= 0.0 {
                problems.push(format!("lot must be positive, got {}", proposed.lot));
            }
            if proposed.stop_distance() <= 0.0 {
                problems.push("stop distance is zero".to_string());
            }
            if !proposed.levels_consistent() {
                problems.push("stop/take-profit on wrong side of entry".to_string());
            }
        }
        if proposed.symbol != context.symbol {
            problems.push(format!(
                "trade symbol {} does not match context {}",
                proposed.symbol, context.symbol
            ));
        }

        if !portfolio.equity.is_finite() || portfolio.equity <= 0.0 {
            problems.push(format!("equity must be positive, got {}", portfolio.equity));
        }
        if !portfolio.balance.is_finite() {
            problems.push("balance is not finite".to_string());
        }
        if !portfolio.dd_pct.is_finite() || portfolio.dd_pct < 0.0 {
            problems.push(format!("invalid drawdown {}", portfolio.dd_pct));
        }

        problems
    }
}

fn floor_to_step(value: f64, step: f64) -> f64 {
    if !value.is_finite() || value <= 0.0 {
        return 0.0;
    }
    let steps = (value / step + 1e-9).floor();
    // Strip float noise such as 0.30000000000000004
    (steps * step * 1e8).round() / 1e8
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LotTier;
    use crate::domain::context::fixtures::{now, quiet_context};
    use crate::domain::{ArmId, Direction};
    use serde_json::Map;

    fn guard() -> RiskGuard {
        RiskGuard::new(RiskConfig::default())
    }

    fn proposal(lot: f64) -> ProposedTrade {
        ProposedTrade {
            symbol: "XAUUSD".to_string(),
            timeframe: "M5".to_string(),
            strategy: ArmId::new("trend_M5"),
            direction: Direction::Long,
            lot,
            entry: 2000.0,
            stop_loss: 1996.0,
            take_profit: 2006.0,
            params: Map::new(),
        }
    }

    fn portfolio(dd_pct: f64) -> PortfolioState {
        PortfolioState {
            balance: 10_000.0,
            equity: 10_000.0,
            peak_equity: 10_000.0,
            dd_pct,
            open_positions: 0,
            drawdown_latched: false,
        }
    }

    fn high_impact_event(minutes_from_now: i64) -> NewsEvent {
        NewsEvent {
            ts: now() + Duration::minutes(minutes_from_now),
            source: "calendar".to_string(),
            event: "US_NFP".to_string(),
            sentiment: 0.3,
            confidence: 0.95,
            uncertainty: false,
        }
    }

    #[test]
    fn test_quiet_market_approves_full_size() {
        let decision = guard().evaluate(&proposal(0.1), &quiet_context(), &portfolio(2.0), now());
        assert_eq!(decision, Decision::Approve(proposal(0.1)));
    }

    #[test]
    fn test_blackout_rejects_regardless_of_other_inputs() {
        let mut ctx = quiet_context();
        ctx.news.push(high_impact_event(5));
        // Wide spread and deep drawdown would also reject; blackout wins.
        ctx.spread = 50.0;

        let decision = guard().evaluate(&proposal(5.0), &ctx, &portfolio(15.0), now());
        match decision {
            Decision::Reject(reason) => assert_eq!(reason.code(), "news_blackout"),
            other => panic!("expected blackout, got {other:?}"),
        }
    }

    #[test]
    fn test_blackout_ignores_uncertain_low_confidence_and_distant_events() {
        let mut ctx = quiet_context();
        let mut uncertain = high_impact_event(5);
        uncertain.uncertainty = true;
        let mut weak = high_impact_event(5);
        weak.confidence = 0.5;
        ctx.news = vec![uncertain, weak, high_impact_event(-45)];

        let decision = guard().evaluate(&proposal(0.1), &ctx, &portfolio(0.0), now());
        assert!(matches!(decision, Decision::Approve(_)));
    }

    #[test]
    fn test_important_event_filter() {
        let mut cfg = RiskConfig::default();
        cfg.important_events = vec!["FOMC".to_string()];
        let guard = RiskGuard::new(cfg);
        let mut ctx = quiet_context();
        ctx.news.push(high_impact_event(0));

        let decision = guard.evaluate(&proposal(0.1), &ctx, &portfolio(0.0), now());
        assert!(matches!(decision, Decision::Approve(_)));
    }

    #[test]
    fn test_spread_relative_to_stop() {
        let mut ctx = quiet_context();
        // stop distance 4.0 * ratio 0.25 = 1.0
        ctx.spread = 1.5;
        let decision = guard().evaluate(&proposal(0.1), &ctx, &portfolio(0.0), now());
        match decision {
            Decision::Reject(RejectReason::SpreadTooWide { limit, .. }) => {
                assert!((limit - 1.0).abs() < 1e-9)
            }
            other => panic!("expected spread reject, got {other:?}"),
        }
    }

    #[test]
    fn test_oversized_lot_is_resized_down() {
        // 10_000 * 1% / (4.0 * 100) = 0.25
        let decision = guard().evaluate(&proposal(1.0), &quiet_context(), &portfolio(0.0), now());
        match decision {
            Decision::Resize(trade, reason) => {
                assert!((trade.lot - 0.25).abs() < 1e-9);
                assert_eq!(reason.requested_lot, 1.0);
            }
            other => panic!("expected resize, got {other:?}"),
        }
    }

    #[test]
    fn test_lot_tier_caps_and_minimum() {
        let mut cfg = RiskConfig::default();
        cfg.lot_tiers = vec![LotTier {
            balance_min: 0.0,
            balance_max: 50_000.0,
            lot: 0.1,
        }];
        let guard = RiskGuard::new(cfg);
        assert!((guard.max_lot(10_000.0, 10_000.0, 4.0) - 0.1).abs() < 1e-9);

        let mut tiny = portfolio(0.0);
        tiny.equity = 10.0;
        let decision = guard.evaluate(&proposal(0.1), &quiet_context(), &tiny, now());
        assert!(matches!(
            decision,
            Decision::Reject(RejectReason::LotBelowMinimum { .. })
        ));
    }

    #[test]
    fn test_resize_does_not_bypass_drawdown() {
        let decision = guard().evaluate(&proposal(1.0), &quiet_context(), &portfolio(11.0), now());
        assert!(matches!(
            decision,
            Decision::Reject(RejectReason::DrawdownLockout { .. })
        ));
    }

    #[test]
    fn test_drawdown_hysteresis() {
        let guard = guard();
        let ctx = quiet_context();
        let mut state = portfolio(0.0);

        let decide = |dd: f64, state: &mut PortfolioState| {
            state.observe_drawdown(dd, &guard);
            guard.evaluate(&proposal(0.1), &ctx, state, now())
        };

        assert!(!decide(9.5, &mut state).is_rejected());
        assert!(decide(10.5, &mut state).is_rejected());
        // Below the ceiling but above recovery: still locked out
        assert!(decide(9.0, &mut state).is_rejected());
        assert!(decide(8.0, &mut state).is_rejected());
        // Recovered
        assert!(!decide(7.9, &mut state).is_rejected());
        assert!(!decide(9.9, &mut state).is_rejected());
    }

    #[test]
    fn test_max_positions() {
        let mut state = portfolio(0.0);
        state.open_positions = 1;
        let decision = guard().evaluate(&proposal(0.1), &quiet_context(), &state, now());
        assert!(matches!(
            decision,
            Decision::Reject(RejectReason::MaxPositions { open: 1, limit: 1 })
        ));
    }

    #[test]
    fn test_malformed_inputs_fail_closed() {
        let guard = guard();

        let mut ctx = quiet_context();
        ctx.atr = f64::NAN;
        let decision = guard.evaluate(&proposal(0.1), &ctx, &portfolio(0.0), now());
        assert_eq!(decision.trade(), None);

        let mut flat_stop = proposal(0.1);
        flat_stop.stop_loss = flat_stop.entry;
        let decision = guard.evaluate(&flat_stop, &quiet_context(), &portfolio(0.0), now());
        assert!(matches!(
            decision,
            Decision::Reject(RejectReason::MalformedInput { .. })
        ));

        let mut broke = portfolio(0.0);
        broke.equity = 0.0;
        let decision = guard.evaluate(&proposal(0.1), &quiet_context(), &broke, now());
        assert!(decision.is_rejected());
    }

    #[test]
    fn test_floor_to_step() {
        assert_eq!(floor_to_step(0.2599, 0.01), 0.25);
        assert_eq!(floor_to_step(0.3, 0.1), 0.3);
        assert_eq!(floor_to_step(f64::NAN, 0.01), 0.0);
    }
}
