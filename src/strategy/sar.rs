//! Trailing-average flip (M15): trade when close crosses a fast EMA,
//! used as a parabolic-SAR proxy.

use serde_json::{json, Map, Value as JsonValue};

use super::indicators::{closes, ema};
use super::traits::{AtrStrategy, SignalRule};
use crate::domain::{Bar, Direction};

#[derive(Debug, Clone)]
pub struct SarFlip {
    pub span: usize,
}

impl Default for SarFlip {
    fn default() -> Self {
        Self { span: 5 }
    }
}

impl SignalRule for SarFlip {
    fn name(&self) -> &'static str {
        "sar_M15"
    }

    fn timeframe(&self) -> &'static str {
        "M15"
    }

    fn warmup(&self) -> usize {
        10
    }

    fn signals(&self, bars: &[Bar]) -> Vec<Option<Direction>> {
        let c = closes(bars);
        let trail = ema(&c, self.span);
        let above: Vec<bool> = c.iter().zip(&trail).map(|(x, t)| x > t).collect();
        (0..bars.len())
            .map(|i| {
                if i + 1 < self.warmup() || i == 0 {
                    return None;
                }
                match (above[i - 1], above[i]) {
                    (false, true) => Some(Direction::Long),
                    (true, false) => Some(Direction::Short),
                    _ => None,
                }
            })
            .collect()
    }

    fn params(&self) -> Map<String, JsonValue> {
        let mut p = Map::new();
        p.insert("ema_span".to_string(), json!(self.span));
        p
    }
}

pub fn sar_m15() -> AtrStrategy<SarFlip> {
    AtrStrategy::new(SarFlip::default())
}
