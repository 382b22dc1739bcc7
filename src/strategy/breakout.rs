//! Channel breakout (M30): close beyond the previous N-bar high/low.

use serde_json::{json, Map, Value as JsonValue};

use super::traits::{AtrStrategy, SignalRule};
use crate::domain::{Bar, Direction, Regime};
use super::indicators::{rolling_max, rolling_min};

#[derive(Debug, Clone)]
pub struct ChannelBreak {
    pub lookback: usize,
}

impl Default for ChannelBreak {
    fn default() -> Self {
        Self { lookback: 24 }
    }
}

impl SignalRule for ChannelBreak {
    fn name(&self) -> &'static str {
        "breakout_M30"
    }

    fn timeframe(&self) -> &'static str {
        "M30"
    }

    fn warmup(&self) -> usize {
        30
    }

    fn signals(&self, bars: &[Bar]) -> Vec<Option<Direction>> {
        let highs: Vec<f64> = bars.iter().map(|b| b.high).collect();
        let lows: Vec<f64> = bars.iter().map(|b| b.low).collect();
        let upper = rolling_max(&highs, self.lookback);
        let lower = rolling_min(&lows, self.lookback);
        (0..bars.len())
            .map(|i| {
                if i + 1 < self.warmup() || i == 0 {
                    return None;
                }
                // Channel as of the previous bar
                let (hi, lo) = (upper[i - 1]?, lower[i - 1]?);
                let close = bars[i].close;
                if close > hi {
                    Some(Direction::Long)
                } else if close < lo {
                    Some(Direction::Short)
                } else {
                    None
                }
            })
            .collect()
    }

    fn regimes(&self) -> &'static [Regime] {
        &[Regime::HighVol, Regime::Trending]
    }

    fn params(&self) -> Map<String, JsonValue> {
        let mut p = Map::new();
        p.insert("lookback".to_string(), json!(self.lookback));
        p
    }
}

pub fn breakout_m30() -> AtrStrategy<ChannelBreak> {
    AtrStrategy::new(ChannelBreak::default())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::strategy::indicators::fixtures::bars_from_closes;

    #[test]
    fn test_breaks_previous_channel() {
        let mut c = vec![100.0; 35];
        c.push(102.0);
        c.push(100.0);
        c.push(97.0);
        let signals = ChannelBreak::default().signals(&bars_from_closes(&c));
        assert_eq!(signals[35], Some(Direction::Long));
        assert_eq!(signals[36], None);
        assert_eq!(signals[37], Some(Direction::Short));
        assert!(signals[..35].iter().all(|s| s.is_none()));
    }
}
