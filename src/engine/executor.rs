//! Order execution port.
//!
//! Broker connectivity lives outside the core. The engine hands an approved
//! trade to an `Executor` and records whatever terminal answer comes back.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::ProposedTrade;
use crate::error::Result;

/// Entry fill reported by the executor
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Fill {
    pub ts: DateTime<Utc>,
    pub price: f64,
    pub lot: f64,
    /// Adverse slippage against the requested entry, price units
    pub slippage: f64,
}

/// Terminal answer to a submitted trade
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ExecutionResult {
    Filled(Fill),
    /// Broker-side refusal; nothing was opened
    Rejected { reason: String },
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Executor: Send + Sync {
    /// Submit an approved trade. Must resolve to a fill or a rejection.
    async fn submit(&self, trade: &ProposedTrade) -> Result<ExecutionResult>;
}

/// Fills every trade at its requested entry, for paper runs.
#[derive(Debug, Clone, Copy, Default)]
pub struct PaperExecutor;

#[async_trait]
impl Executor for PaperExecutor {
    async fn submit(&self, trade: &ProposedTrade) -> Result<ExecutionResult> {
        Ok(ExecutionResult::Filled(Fill {
            ts: Utc::now(),
            price: trade.entry,
            lot: trade.lot,
            slippage: 0.0,
        }))
    }
}
