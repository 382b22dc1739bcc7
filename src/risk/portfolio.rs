use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::guard::RiskGuard;
use crate::domain::EquityPoint;

/// Account state the guard reads, owned by the caller.
///
/// `drawdown_latched` carries the drawdown hysteresis between calls so that
/// the guard itself stays stateless.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PortfolioState {
    pub balance: f64,
    pub equity: f64,
    pub peak_equity: f64,
    pub dd_pct: f64,
    pub open_positions: u32,
    pub drawdown_latched: bool,
}

impl PortfolioState {
    pub fn new(balance: f64) -> Self {
        Self {
            balance,
            equity: balance,
            peak_equity: balance,
            dd_pct: 0.0,
            open_positions: 0,
            drawdown_latched: false,
        }
    }

    /// Advance the drawdown latch for a new drawdown reading.
    pub fn observe_drawdown(&mut self, dd_pct: f64, guard: &RiskGuard) {
        let latched = guard.drawdown_latched(self.drawdown_latched, dd_pct);
        if latched && !self.drawdown_latched {
            warn!(dd_pct, "drawdown ceiling breached, new entries locked out");
        } else if !latched && self.drawdown_latched {
            info!(dd_pct, "drawdown recovered, new entries allowed");
        }
        self.dd_pct = dd_pct;
        self.drawdown_latched = latched;
    }

    /// Apply a settlement and return the equity point to persist.
    pub fn settle(
        &mut self,
        ts: chrono::DateTime<chrono::Utc>,
        balance: f64,
        equity: f64,
        guard: &RiskGuard,
    ) -> EquityPoint {
        self.balance = balance;
        self.equity = equity;
        if equity > self.peak_equity {
            self.peak_equity = equity;
        }
        let point = EquityPoint::from_peak(ts, balance, equity, self.peak_equity);
        self.observe_drawdown(point.dd_pct, guard);
        point
    }
}
