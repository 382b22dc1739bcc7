//! Strategies selectable by the bandit
//!
//! - `Strategy`: propose / fit / evaluate / regime filter
//! - `AtrStrategy`: shared ATR-bracketed implementation over a `SignalRule`
//! - reference rules: EMA cross, band fade, channel breakout, EMA flip

pub mod backtest;
pub mod breakout;
pub mod indicators;
pub mod meanrev;
pub mod sar;
pub mod traits;
pub mod trend;

pub use backtest::{AtrLevels, TradeOutcome};
pub use breakout::breakout_m30;
pub use meanrev::meanrev_m15;
pub use sar::sar_m15;
pub use traits::{AtrStrategy, FitReport, SignalRule, Strategy};
pub use trend::trend_m5;

/// The four reference strategies with default parameters.
pub fn reference_strategies() -> Vec<Box<dyn Strategy>> {
    vec![
        Box::new(trend_m5()),
        Box::new(meanrev_m15()),
        Box::new(breakout_m30()),
        Box::new(sar_m15()),
    ]
}
