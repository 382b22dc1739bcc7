//! Out-of-sample performance metrics and the promotion gate.

use serde::{Deserialize, Serialize};

use crate::config::GateConfig;
use crate::strategy::backtest::TradeOutcome;

/// Metrics for one strategy over one test window.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct StrategyMetrics {
    pub trades: u32,
    /// Compounded return over the window, percent
    pub total_return_pct: f64,
    /// Peak-to-trough equity drawdown, percent
    pub max_drawdown_pct: f64,
    /// Fraction of trades with positive P&L
    pub hit_rate: f64,
    pub avg_pnl_atr: f64,
    /// Per-trade mean / std of R multiples
    pub sharpe: f64,
}

impl StrategyMetrics {
    /// Compound `outcomes` risking `risk_per_trade` of equity per 1R.
    pub fn from_outcomes(outcomes: &[TradeOutcome], risk_per_trade: f64) -> Self {
        if outcomes.is_empty() {
            return Self::default();
        }

        let n = outcomes.len() as f64;
        let mut equity = 1.0;
        let mut peak = 1.0;
        let mut max_dd = 0.0f64;
        for o in outcomes {
            equity *= (1.0 + risk_per_trade * o.r_multiple).max(0.0);
            peak = f64::max(peak, equity);
            if peak > 0.0 {
                max_dd = max_dd.max((peak - equity) / peak * 100.0);
            }
        }

        let wins = outcomes.iter().filter(|o| o.pnl_atr > 0.0).count() as f64;
        let avg_pnl_atr = outcomes.iter().map(|o| o.pnl_atr).sum::<f64>() / n;

        let mean_r = outcomes.iter().map(|o| o.r_multiple).sum::<f64>() / n;
        let sharpe = if outcomes.len() < 2 {
            0.0
        } else {
            let var = outcomes
                .iter()
                .map(|o| (o.r_multiple - mean_r).powi(2))
                .sum::<f64>()
                / (n - 1.0);
            if var > 0.0 {
                mean_r / var.sqrt()
            } else {
                0.0
            }
        };

        Self {
            trades: outcomes.len() as u32,
            total_return_pct: (equity - 1.0) * 100.0,
            max_drawdown_pct: max_dd,
            hit_rate: wins / n,
            avg_pnl_atr,
            sharpe,
        }
    }

    /// Gate failures; empty when the metrics pass promotion.
    pub fn gate_failures(&self, gate: &GateConfig) -> Vec<String> {
        let mut failures = Vec::new();
        if self.trades < gate.min_trades {
            failures.push(format!("trades {} < {}", self.trades, gate.min_trades));
        }
        if self.sharpe < gate.min_sharpe {
            failures.push(format!("sharpe {:.3} < {:.3}", self.sharpe, gate.min_sharpe));
        }
        if self.max_drawdown_pct > gate.max_drawdown_pct {
            failures.push(format!(
                "drawdown {:.2}% > {:.2}%",
                self.max_drawdown_pct, gate.max_drawdown_pct
            ));
        }
        failures
    }

    pub fn passes(&self, gate: &GateConfig) -> bool {
        self.gate_failures(gate).is_empty()
    }
}
