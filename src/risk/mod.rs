//! Pre-trade risk gating
//!
//! - `RiskGuard`: approves, resizes or rejects a proposed trade
//! - `PortfolioState`: caller-owned account state, including the drawdown latch

pub mod guard;
pub mod portfolio;

pub use guard::{Decision, RejectReason, ResizeReason, RiskGuard};
pub use portfolio::PortfolioState;
