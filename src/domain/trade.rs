use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use uuid::Uuid;

use super::arm::ArmId;
use super::context::Context;
use super::market::Direction;
use crate::error::{AutotraderError, Result};

/// A trade a strategy wants to open, before risk gating.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProposedTrade {
    pub symbol: String,
    pub timeframe: String,
    pub strategy: ArmId,
    pub direction: Direction,
    pub lot: f64,
    pub entry: f64,
    pub stop_loss: f64,
    pub take_profit: f64,
    #[serde(default)]
    pub params: Map<String, JsonValue>,
}

impl ProposedTrade {
    /// Absolute distance between entry and stop, price units.
    pub fn stop_distance(&self) -> f64 {
        (self.entry - self.stop_loss).abs()
    }

    /// Stop on the losing side of entry and take-profit on the winning side.
    pub fn levels_consistent(&self) -> bool {
        match self.direction {
            Direction::Long => self.stop_loss < self.entry && self.take_profit > self.entry,
            Direction::Short => self.stop_loss > self.entry && self.take_profit < self.entry,
        }
    }

    pub fn with_lot(mut self, lot: f64) -> Self {
        self.lot = lot;
        self
    }
}

/// Realized exit reported by the executor or the backtester.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Exit {
    pub ts: DateTime<Utc>,
    pub price: f64,
    /// Adverse slippage, price units
    pub slippage: f64,
}

/// An approved trade. Opened once, closed once, immutable afterward.
///
/// Maps onto the `trades` table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trade {
    pub id: Uuid,
    pub ts_open: DateTime<Utc>,
    pub ts_close: Option<DateTime<Utc>>,
    pub symbol: String,
    pub timeframe: String,
    pub strategy: ArmId,
    pub context: JsonValue,
    pub params: JsonValue,
    pub direction: Direction,
    pub lot: f64,
    pub entry: f64,
    pub sl: f64,
    pub tp: f64,
    pub exit: Option<f64>,
    pub pnl: Option<f64>,
    pub pnl_atr: Option<f64>,
    pub slippage: f64,
    /// ATR at entry, used to normalize P&L
    #[serde(default)]
    pub atr_at_entry: f64,
}

impl Trade {
    /// Open a trade from an approved proposal.
    pub fn open(proposed: ProposedTrade, context: &Context, ts_open: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            ts_open,
            ts_close: None,
            symbol: proposed.symbol,
            timeframe: proposed.timeframe,
            strategy: proposed.strategy,
            context: context.to_json(),
            params: JsonValue::Object(proposed.params),
            direction: proposed.direction,
            lot: proposed.lot,
            entry: proposed.entry,
            sl: proposed.stop_loss,
            tp: proposed.take_profit,
            exit: None,
            pnl: None,
            pnl_atr: None,
            slippage: 0.0,
            atr_at_entry: context.atr,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.ts_close.is_some()
    }

    /// Close the trade and compute realized P&L.
    ///
    /// `point_value` is the account-currency value of a 1.0 price move for one lot.
    pub fn close(&mut self, exit: Exit, point_value: f64) -> Result<()> {
        if self.is_closed() {
            return Err(AutotraderError::InvalidStateTransition {
                from: "closed".to_string(),
                to: "closed".to_string(),
            });
        }
        if exit.ts < self.ts_open {
            return Err(AutotraderError::InvalidMarketData(format!(
                "exit at {} precedes open at {}",
                exit.ts, self.ts_open
            )));
        }

        let move_points = self.direction.sign() * (exit.price - self.entry);
        self.ts_close = Some(exit.ts);
        self.exit = Some(exit.price);
        self.slippage = exit.slippage;
        self.pnl = Some(move_points * self.lot * point_value);
        self.pnl_atr = Some(if self.atr_at_entry > 0.0 {
            move_points / self.atr_at_entry
        } else {
            0.0
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::context::fixtures::{now, quiet_context};
    use chrono::Duration;

    fn proposal(direction: Direction) -> ProposedTrade {
        ProposedTrade {
            symbol: "XAUUSD".to_string(),
            timeframe: "M5".to_string(),
            strategy: ArmId::new("trend_M5"),
            direction,
            lot: 0.1,
            entry: 2000.0,
            stop_loss: if direction == Direction::Long { 1996.0 } else { 2004.0 },
            take_profit: if direction == Direction::Long { 2006.0 } else { 1994.0 },
            params: Map::new(),
        }
    }

    #[test]
    fn test_close_long_computes_pnl() {
        let ctx = quiet_context();
        let mut trade = Trade::open(proposal(Direction::Long), &ctx, now());
        trade
            .close(
                Exit {
                    ts: now() + Duration::minutes(30),
                    price: 2004.0,
                    slippage: 0.05,
                },
                100.0,
            )
            .unwrap();

        assert!((trade.pnl.unwrap() - 40.0).abs() < 1e-9);
        assert!((trade.pnl_atr.unwrap() - 2.0).abs() < 1e-9);
        assert_eq!(trade.slippage, 0.05);
    }

    #[test]
    fn test_close_twice_fails() {
        let ctx = quiet_context();
        let mut trade = Trade::open(proposal(Direction::Short), &ctx, now());
        let exit = Exit {
            ts: now() + Duration::minutes(5),
            price: 1998.0,
            slippage: 0.0,
        };
        trade.close(exit, 100.0).unwrap();
        assert!(trade.pnl.unwrap() > 0.0);

        let err = trade.close(exit, 100.0).unwrap_err();
        assert!(matches!(err, AutotraderError::InvalidStateTransition { .. }));
        assert_eq!(trade.exit, Some(1998.0));
    }

    #[test]
    fn test_levels_consistent() {
        assert!(proposal(Direction::Long).levels_consistent());
        assert!(proposal(Direction::Short).levels_consistent());
        let mut bad = proposal(Direction::Long);
        bad.stop_loss = 2001.0;
        assert!(!bad.levels_consistent());
    }
}
