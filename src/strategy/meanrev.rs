//! Bollinger-style mean reversion (M15): fade closes beyond SMA ± k·σ.

use serde_json::{json, Map, Value as JsonValue};

use super::indicators::{closes, rolling_std, sma};
use super::traits::{AtrStrategy, SignalRule};
use crate::domain::{Bar, Direction, Regime};

#[derive(Debug, Clone)]
pub struct BandFade {
    pub period: usize,
    pub width: f64,
}

impl Default for BandFade {
    fn default() -> Self {
        Self {
            period: 20,
            width: 1.0,
        }
    }
}

impl SignalRule for BandFade {
    fn name(&self) -> &'static str {
        "meanrev_M15"
    }

    fn timeframe(&self) -> &'static str {
        "M15"
    }

    fn warmup(&self) -> usize {
        25
    }

    fn signals(&self, bars: &[Bar]) -> Vec<Option<Direction>> {
        let c = closes(bars);
        let mean = sma(&c, self.period);
        let std = rolling_std(&c, self.period);
        (0..bars.len())
            .map(|i| {
                if i + 1 < self.warmup() {
                    return None;
                }
                let (m, s) = (mean[i]?, std[i]?);
                if c[i] < m - self.width * s {
                    Some(Direction::Long)
                } else if c[i] > m + self.width * s {
                    Some(Direction::Short)
                } else {
                    None
                }
            })
            .collect()
    }

    fn regimes(&self) -> &'static [Regime] {
        &[Regime::Ranging, Regime::LowVol]
    }

    fn params(&self) -> Map<String, JsonValue> {
        let mut p = Map::new();
        p.insert("sma_period".to_string(), json!(self.period));
        p.insert("band_width".to_string(), json!(self.width));
        p
    }
}

pub fn meanrev_m15() -> AtrStrategy<BandFade> {
    AtrStrategy::new(BandFade::default())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::strategy::indicators::fixtures::bars_from_closes;

    #[test]
    fn test_fades_spikes() {
        let mut c: Vec<f64> = (0..30).map(|i| 100.0 + if i % 2 == 0 { 0.5 } else { -0.5 }).collect();
        c.push(106.0);
        c.push(100.0);
        c.push(94.0);
        let signals = BandFade::default().signals(&bars_from_closes(&c));
        assert_eq!(signals[30], Some(Direction::Short));
        assert_eq!(signals[32], Some(Direction::Long));
        assert!(signals[..30].iter().all(|s| s.is_none()));
    }
}
