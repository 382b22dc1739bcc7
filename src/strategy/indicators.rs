//! Causal bar indicators.
//!
//! Every output at index `i` depends only on inputs `0..=i`, so signals
//! computed over a slice never look ahead.

use crate::domain::Bar;

pub fn closes(bars: &[Bar]) -> Vec<f64> {
    bars.iter().map(|b| b.close).collect()
}

/// Exponential moving average with `alpha = 2 / (span + 1)`, seeded with the first value.
pub fn ema(values: &[f64], span: usize) -> Vec<f64> {
    let alpha = 2.0 / (span.max(1) as f64 + 1.0);
    let mut out = Vec::with_capacity(values.len());
    let mut prev: Option<f64> = None;
    for &v in values {
        let next = match prev {
            Some(p) => alpha * v + (1.0 - alpha) * p,
            None => v,
        };
        out.push(next);
        prev = Some(next);
    }
    out
}

/// Simple moving average; `None` until `period` values are available.
pub fn sma(values: &[f64], period: usize) -> Vec<Option<f64>> {
    rolling(values, period, |w| w.iter().sum::<f64>() / w.len() as f64)
}

/// Rolling sample standard deviation (n - 1 denominator).
pub fn rolling_std(values: &[f64], period: usize) -> Vec<Option<f64>> {
    if period < 2 {
        return vec![None; values.len()];
    }
    rolling(values, period, |w| {
        let mean = w.iter().sum::<f64>() / w.len() as f64;
        let var = w.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / (w.len() - 1) as f64;
        var.sqrt()
    })
}

pub fn rolling_max(values: &[f64], period: usize) -> Vec<Option<f64>> {
    rolling(values, period, |w| w.iter().cloned().fold(f64::NEG_INFINITY, f64::max))
}

pub fn rolling_min(values: &[f64], period: usize) -> Vec<Option<f64>> {
    rolling(values, period, |w| w.iter().cloned().fold(f64::INFINITY, f64::min))
}

fn rolling(values: &[f64], period: usize, f: impl Fn(&[f64]) -> f64) -> Vec<Option<f64>> {
    if period == 0 {
        return vec![None; values.len()];
    }
    (0..values.len())
        .map(|i| {
            if i + 1 < period {
                None
            } else {
                Some(f(&values[i + 1 - period..=i]))
            }
        })
        .collect()
}

/// True range of each bar; the first bar uses high - low.
pub fn true_range(bars: &[Bar]) -> Vec<f64> {
    bars.iter()
        .enumerate()
        .map(|(i, b)| {
            let hl = b.high - b.low;
            match i.checked_sub(1).map(|p| bars[p].close) {
                Some(prev_close) => hl
                    .max((b.high - prev_close).abs())
                    .max((b.low - prev_close).abs()),
                None => hl,
            }
        })
        .collect()
}

/// Average true range as a simple mean of true range.
pub fn atr(bars: &[Bar], period: usize) -> Vec<Option<f64>> {
    sma(&true_range(bars), period)
}

/// `(EMA12 - EMA26) / std26` of closes; 0.0 where std is unavailable or zero.
pub fn trend_score(values: &[f64]) -> Vec<f64> {
    let fast = ema(values, 12);
    let slow = ema(values, 26);
    let std = rolling_std(values, 26);
    (0..values.len())
        .map(|i| match std[i] {
            Some(s) if s > 0.0 => (fast[i] - slow[i]) / s,
            _ => 0.0,
        })
        .collect()
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;
    use chrono::{Duration, TimeZone, Utc};

    /// Hourly bars around the given closes, 1.0 high/low range, 0.1 spread.
    pub fn bars_from_closes(closes: &[f64]) -> Vec<Bar> {
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        closes
            .iter()
            .enumerate()
            .map(|(i, &c)| Bar {
                ts: start + Duration::hours(i as i64),
                open: c,
                high: c + 0.5,
                low: c - 0.5,
                close: c,
                spread: 0.1,
            })
            .collect()
    }
}
