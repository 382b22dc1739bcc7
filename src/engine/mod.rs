//! Live decision path
//!
//! - `context`: `ContextBuilder` and the bar-indicator implementation
//! - `executor`: order execution port
//! - `decision`: `DecisionEngine`, one epoch per bar close

pub mod context;
pub mod decision;
pub mod executor;

pub use context::{BarContextBuilder, ContextBuilder, MarketSnapshot};
pub use decision::{DecisionEngine, EpochOutcome, FlatReason, Settlement};
pub use executor::{ExecutionResult, Executor, Fill, PaperExecutor};
