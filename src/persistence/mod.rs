//! Persistence gateway for the five durable record shapes
//!
//! - `PersistenceGateway`: async write interface, idempotent on primary key
//! - `InMemoryGateway`: map-backed store for tests and offline runs
//! - `PostgresGateway`: sqlx-backed store over the core tables
//! - `BackgroundRecorder`: queued writer with retry/backoff for the live path

pub mod memory;
pub mod postgres;
pub mod recorder;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::domain::{BanditStatRecord, EquityPoint, NewsEvent, Trade, WalkForwardRun};
use crate::error::Result;

pub use memory::InMemoryGateway;
pub use postgres::PostgresGateway;
pub use recorder::{BackgroundRecorder, RecorderStats};

/// Any of the persisted record shapes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "table", content = "row", rename_all = "snake_case")]
pub enum Record {
    Trade(Trade),
    Equity(EquityPoint),
    BanditStat(BanditStatRecord),
    WalkForward(WalkForwardRun),
    News(NewsEvent),
}

impl Record {
    /// Backing table name
    pub fn table(&self) -> &'static str {
        match self {
            Record::Trade(_) => "trades",
            Record::Equity(_) => "equity_curve",
            Record::BanditStat(_) => "bandit_stats",
            Record::WalkForward(_) => "wf_registry",
            Record::News(_) => "news_events",
        }
    }

    /// Closed trades and terminal walk-forward runs never change again
    pub fn is_final(&self) -> bool {
        match self {
            Record::Trade(t) => t.is_closed(),
            Record::WalkForward(w) => w.status.is_terminal(),
            _ => false,
        }
    }

    /// Primary key rendered as text
    pub fn key(&self) -> String {
        match self {
            Record::Trade(t) => t.id.to_string(),
            Record::Equity(e) => e.ts.to_rfc3339(),
            Record::BanditStat(b) => format!("{}|{}", b.ts.to_rfc3339(), b.arm),
            Record::WalkForward(w) => w.id.to_string(),
            Record::News(n) => format!("{}|{}|{}", n.ts.to_rfc3339(), n.source, n.event),
        }
    }
}

impl From<Trade> for Record {
    fn from(t: Trade) -> Self {
        Record::Trade(t)
    }
}

impl From<EquityPoint> for Record {
    fn from(e: EquityPoint) -> Self {
        Record::Equity(e)
    }
}

impl From<BanditStatRecord> for Record {
    fn from(b: BanditStatRecord) -> Self {
        Record::BanditStat(b)
    }
}

impl From<WalkForwardRun> for Record {
    fn from(w: WalkForwardRun) -> Self {
        Record::WalkForward(w)
    }
}

impl From<NewsEvent> for Record {
    fn from(n: NewsEvent) -> Self {
        Record::News(n)
    }
}

/// Whether a write may replace an existing row
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WriteIntent {
    /// Fails with `DuplicateKey` if the key exists; the stored row is left unchanged
    Insert,
    /// Insert or replace; fails with `FinalRow` if the stored row is final
    Update,
}

/// Durable storage for records. Implementations must be idempotent on the
/// primary key: a repeated `Insert` fails with `DuplicateKey`.
#[async_trait]
pub trait PersistenceGateway: Send + Sync {
    async fn record(&self, record: Record, intent: WriteIntent) -> Result<()>;
}
