use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use super::records::TimeWindow;
use crate::error::{AutotraderError, Result};

/// Trade direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Long,
    Short,
}

impl Direction {
    /// Get the opposite direction
    pub fn opposite(&self) -> Self {
        match self {
            Direction::Long => Direction::Short,
            Direction::Short => Direction::Long,
        }
    }

    /// +1 for long, -1 for short
    pub fn sign(&self) -> f64 {
        match self {
            Direction::Long => 1.0,
            Direction::Short => -1.0,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Long => "long",
            Direction::Short => "short",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "long" => Some(Direction::Long),
            "short" => Some(Direction::Short),
            _ => None,
        }
    }
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Bar timeframe label (e.g. "M5") converted to its duration.
pub fn timeframe_duration(timeframe: &str) -> Option<Duration> {
    let mut chars = timeframe.chars();
    let unit = chars.next()?;
    let count: i64 = chars.as_str().parse().ok()?;
    if count <= 0 {
        return None;
    }
    match unit {
        'M' => Some(Duration::minutes(count)),
        'H' => Some(Duration::hours(count)),
        'D' => Some(Duration::days(count)),
        _ => None,
    }
}

/// One OHLC bar
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Bar {
    pub ts: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    /// Quoted spread at bar close, in price units
    #[serde(default)]
    pub spread: f64,
}

impl Bar {
    fn is_well_formed(&self) -> bool {
        [self.open, self.high, self.low, self.close, self.spread]
            .iter()
            .all(|v| v.is_finite())
            && self.high >= self.low
    }
}

/// A strictly time-ordered bar series for one symbol/timeframe.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoricalSeries {
    pub symbol: String,
    pub timeframe: String,
    bars: Vec<Bar>,
}

impl HistoricalSeries {
    /// Build a series, rejecting unordered, duplicated or malformed bars.
    pub fn new(symbol: impl Into<String>, timeframe: impl Into<String>, bars: Vec<Bar>) -> Result<Self> {
        for pair in bars.windows(2) {
            if pair[1].ts <= pair[0].ts {
                return Err(AutotraderError::InvalidMarketData(format!(
                    "bars not strictly increasing at {}",
                    pair[1].ts
                )));
            }
        }
        if let Some(bad) = bars.iter().find(|b| !b.is_well_formed()) {
            return Err(AutotraderError::InvalidMarketData(format!(
                "malformed bar at {}",
                bad.ts
            )));
        }
        Ok(Self {
            symbol: symbol.into(),
            timeframe: timeframe.into(),
            bars,
        })
    }

    pub fn bars(&self) -> &[Bar] {
        &self.bars
    }

    pub fn len(&self) -> usize {
        self.bars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bars.is_empty()
    }

    pub fn first_ts(&self) -> Option<DateTime<Utc>> {
        self.bars.first().map(|b| b.ts)
    }

    pub fn last_ts(&self) -> Option<DateTime<Utc>> {
        self.bars.last().map(|b| b.ts)
    }

    /// Bars with `window.start <= ts < window.end`.
    pub fn slice(&self, window: &TimeWindow) -> &[Bar] {
        let lo = self.bars.partition_point(|b| b.ts < window.start);
        let hi = self.bars.partition_point(|b| b.ts < window.end);
        &self.bars[lo..hi.max(lo)]
    }

    /// Bars with `ts < end`; nothing at or beyond `end` is visible.
    pub fn up_to(&self, end: DateTime<Utc>) -> &[Bar] {
        let hi = self.bars.partition_point(|b| b.ts < end);
        &self.bars[..hi]
    }
}
