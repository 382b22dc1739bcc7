//! EMA crossover trend follower (M5).

use serde_json::{json, Map, Value as JsonValue};

use super::indicators::{closes, ema};
use super::traits::{AtrStrategy, SignalRule};
use crate::domain::{Bar, Direction, Regime};

#[derive(Debug, Clone)]
pub struct EmaCross {
    pub fast: usize,
    pub slow: usize,
}

impl Default for EmaCross {
    fn default() -> Self {
        Self { fast: 12, slow: 26 }
    }
}

impl SignalRule for EmaCross {
    fn name(&self) -> &'static str {
        "trend_M5"
    }

    fn timeframe(&self) -> &'static str {
        "M5"
    }

    fn warmup(&self) -> usize {
        30
    }

    fn signals(&self, bars: &[Bar]) -> Vec<Option<Direction>> {
        let c = closes(bars);
        let fast = ema(&c, self.fast);
        let slow = ema(&c, self.slow);
        (0..bars.len())
            .map(|i| {
                if i + 1 < self.warmup() || i == 0 {
                    return None;
                }
                if fast[i] > slow[i] && fast[i - 1] <= slow[i - 1] {
                    Some(Direction::Long)
                } else if fast[i] < slow[i] && fast[i - 1] >= slow[i - 1] {
                    Some(Direction::Short)
                } else {
                    None
                }
            })
            .collect()
    }

    fn regimes(&self) -> &'static [Regime] {
        &[Regime::Trending, Regime::HighVol, Regime::LowVol]
    }

    fn params(&self) -> Map<String, JsonValue> {
        let mut p = Map::new();
        p.insert("ema_fast".to_string(), json!(self.fast));
        p.insert("ema_slow".to_string(), json!(self.slow));
        p
    }
}

pub fn trend_m5() -> AtrStrategy<EmaCross> {
    AtrStrategy::new(EmaCross::default())
}
