//! Bar-by-bar ATR stop/take simulation.
//!
//! Entries fill at the signal bar's close plus half the quoted spread. When a
//! bar touches both stop and take, the stop is assumed to fill first.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::{Bar, Direction, TimeWindow};

/// Stop and take-profit distances in ATR multiples
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AtrLevels {
    pub stop_mult: f64,
    pub take_mult: f64,
}

impl AtrLevels {
    pub fn new(stop_mult: f64, take_mult: f64) -> Self {
        Self {
            stop_mult,
            take_mult,
        }
    }

    /// (stop, take) prices for an entry
    pub fn prices(&self, direction: Direction, entry: f64, atr: f64) -> (f64, f64) {
        let s = direction.sign();
        (
            entry - s * self.stop_mult * atr,
            entry + s * self.take_mult * atr,
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitKind {
    Stop,
    Take,
    /// Horizon or data ran out with the position still open
    Timeout,
}

/// Exit found by scanning bars after entry.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ExitScan {
    pub index: usize,
    pub price: f64,
    pub kind: ExitKind,
}

/// Walk `bars[entry_idx + 1..]` for up to `max_bars` bars looking for stop or take.
///
/// Returns `None` when there is no bar after the entry.
pub fn scan_exit(
    bars: &[Bar],
    entry_idx: usize,
    direction: Direction,
    stop: f64,
    take: f64,
    max_bars: Option<usize>,
) -> Option<ExitScan> {
    let last = match max_bars {
        Some(n) => (entry_idx + n).min(bars.len().checked_sub(1)?),
        None => bars.len().checked_sub(1)?,
    };
    if last <= entry_idx {
        return None;
    }

    for (i, bar) in bars.iter().enumerate().take(last + 1).skip(entry_idx + 1) {
        let (stop_hit, take_hit) = match direction {
            Direction::Long => (bar.low <= stop, bar.high >= take),
            Direction::Short => (bar.high >= stop, bar.low <= take),
        };
        if stop_hit {
            return Some(ExitScan {
                index: i,
                price: stop,
                kind: ExitKind::Stop,
            });
        }
        if take_hit {
            return Some(ExitScan {
                index: i,
                price: take,
                kind: ExitKind::Take,
            });
        }
    }

    Some(ExitScan {
        index: last,
        price: bars[last].close,
        kind: ExitKind::Timeout,
    })
}

/// One simulated round trip
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TradeOutcome {
    pub ts_open: DateTime<Utc>,
    pub ts_close: DateTime<Utc>,
    pub direction: Direction,
    pub exit: ExitKind,
    /// Net move over ATR at entry, spread cost included
    pub pnl_atr: f64,
    /// Net move over the stop distance
    pub r_multiple: f64,
}

/// Outcome of entering on bar `i`, in ATR units, looking at most `horizon` bars ahead.
pub fn label_outcome(
    bars: &[Bar],
    atr: &[Option<f64>],
    i: usize,
    direction: Direction,
    levels: AtrLevels,
    horizon: usize,
) -> Option<f64> {
    let a = atr.get(i).copied().flatten().filter(|a| *a > 0.0)?;
    let entry = bars[i].close + direction.sign() * bars[i].spread / 2.0;
    let (stop, take) = levels.prices(direction, entry, a);
    let exit = scan_exit(bars, i, direction, stop, take, Some(horizon))?;
    Some(direction.sign() * (exit.price - entry) / a)
}

/// Simulate one position at a time on `signals`, opening only on bars
/// inside `window`.
///
/// `bars` may start before the window for indicator warm-up but must end
/// before `window.end`; positions still open at the last bar close there.
pub fn simulate(
    bars: &[Bar],
    signals: &[Option<Direction>],
    atr: &[Option<f64>],
    window: &TimeWindow,
    levels: AtrLevels,
) -> Vec<TradeOutcome> {
    let mut outcomes = Vec::new();
    let mut i = 0;
    while i < bars.len() {
        let direction = match signals.get(i).copied().flatten() {
            Some(d) if window.contains(bars[i].ts) => d,
            _ => {
                i += 1;
                continue;
            }
        };
        let a = match atr.get(i).copied().flatten() {
            Some(a) if a > 0.0 => a,
            _ => {
                i += 1;
                continue;
            }
        };

        let entry = bars[i].close + direction.sign() * bars[i].spread / 2.0;
        let (stop, take) = levels.prices(direction, entry, a);
        let exit = match scan_exit(bars, i, direction, stop, take, None) {
            Some(exit) => exit,
            None => break,
        };

        let pnl = direction.sign() * (exit.price - entry);
        outcomes.push(TradeOutcome {
            ts_open: bars[i].ts,
            ts_close: bars[exit.index].ts,
            direction,
            exit: exit.kind,
            pnl_atr: pnl / a,
            r_multiple: pnl / (levels.stop_mult * a),
        });
        i = exit.index + 1;
    }
    outcomes
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::strategy::indicators::fixtures::bars_from_closes;
    use chrono::Duration;

    #[test]
    fn test_scan_exit_take_and_stop() {
        let bars = bars_from_closes(&[100.0, 101.0, 103.0, 99.0]);
        // long from 100, stop 98, take 102.5: bar 2 high 103.5 hits take
        let exit = scan_exit(&bars, 0, Direction::Long, 98.0, 102.5, None).unwrap();
        assert_eq!(exit.kind, ExitKind::Take);
        assert_eq!(exit.index, 2);

        // short from 100, stop 101.2: bar 1 high 101.5 hits the stop
        let exit = scan_exit(&bars, 0, Direction::Short, 101.2, 95.0, None).unwrap();
        assert_eq!(exit.kind, ExitKind::Stop);
        assert_eq!(exit.price, 101.2);
    }

    #[test]
    fn test_scan_exit_horizon_timeout() {
        let bars = bars_from_closes(&[100.0, 100.2, 100.4, 100.6]);
        let exit = scan_exit(&bars, 0, Direction::Long, 90.0, 110.0, Some(2)).unwrap();
        assert_eq!(exit.kind, ExitKind::Timeout);
        assert_eq!(exit.index, 2);
        assert!(scan_exit(&bars, 3, Direction::Long, 90.0, 110.0, None).is_none());
    }

    #[test]
    fn test_simulate_one_position_at_a_time() {
        let closes: Vec<f64> = (0..10).map(|i| 100.0 + i as f64).collect();
        let mut bars = bars_from_closes(&closes);
        for b in &mut bars {
            b.spread = 0.0;
        }
        let atr = vec![Some(1.0); bars.len()];
        let mut signals = vec![None; bars.len()];
        signals[1] = Some(Direction::Long);
        signals[2] = Some(Direction::Long);
        signals[6] = Some(Direction::Long);

        let window = TimeWindow::new(bars[0].ts, bars[9].ts + Duration::hours(1)).unwrap();
        let outcomes = simulate(&bars, &signals, &atr, &window, AtrLevels::new(1.0, 2.0));

        // entry at 101, take at 103 on bar 3; signal on bar 2 is skipped
        assert_eq!(outcomes.len(), 2);
        assert_eq!(outcomes[0].exit, ExitKind::Take);
        assert!((outcomes[0].pnl_atr - 2.0).abs() < 1e-12);
        assert!((outcomes[0].r_multiple - 2.0).abs() < 1e-12);
        assert_eq!(outcomes[1].ts_open, bars[6].ts);
    }

    #[test]
    fn test_simulate_ignores_signals_outside_window() {
        let bars = bars_from_closes(&[100.0; 6]);
        let atr = vec![Some(1.0); 6];
        let signals = vec![Some(Direction::Long); 6];
        let window = TimeWindow::new(bars[4].ts, bars[5].ts + Duration::hours(1)).unwrap();
        let outcomes = simulate(&bars, &signals, &atr, &window, AtrLevels::new(1.0, 1.0));
        assert_eq!(outcomes.len(), 1);
        assert_eq!(outcomes[0].ts_open, bars[4].ts);
        assert_eq!(outcomes[0].exit, ExitKind::Timeout);
    }
}
