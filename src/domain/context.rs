//! Market context snapshot and news events.
//!
//! Both are produced by external feed collaborators; the core only reads them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Market regime classification carried in the context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Regime {
    /// Elevated volatility
    HighVol,
    /// Suppressed volatility
    LowVol,
    /// Strong directional move
    Trending,
    /// Range-bound, mean-reverting
    Ranging,
}

impl Regime {
    pub const ALL: [Regime; 4] = [Regime::HighVol, Regime::LowVol, Regime::Trending, Regime::Ranging];

    pub fn as_str(&self) -> &'static str {
        match self {
            Regime::HighVol => "high_vol",
            Regime::LowVol => "low_vol",
            Regime::Trending => "trending",
            Regime::Ranging => "ranging",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "high_vol" => Some(Regime::HighVol),
            "low_vol" => Some(Regime::LowVol),
            "trending" => Some(Regime::Trending),
            "ranging" => Some(Regime::Ranging),
            _ => None,
        }
    }
}

impl std::fmt::Display for Regime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A calendar or headline event.
///
/// Maps onto the `news_events` table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewsEvent {
    pub ts: DateTime<Utc>,
    pub source: String,
    /// Event label, e.g. "US_NFP"
    pub event: String,
    /// Sentiment in [-1, 1]
    pub sentiment: f64,
    /// Confidence in [0, 1]
    pub confidence: f64,
    /// Set when the source itself flags the reading as uncertain
    pub uncertainty: bool,
}

/// Fixed-schema feature snapshot used to select an arm and gate a trade.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Context {
    pub ts: DateTime<Utc>,
    pub symbol: String,
    pub timeframe: String,
    /// ATR(14) of the primary timeframe, price units
    pub atr: f64,
    /// (EMA12 - EMA26) / rolling std(26)
    pub trend_score: f64,
    /// Current quoted spread, price units
    pub spread: f64,
    /// 0 = Asia, 1 = Europe, 2 = US
    pub session_code: u8,
    pub regime: Regime,
    /// Aggregated news sentiment in [-1, 1]
    pub news_bias: f64,
    /// Confidence of the aggregated sentiment in [0, 1]
    pub news_confidence: f64,
    pub news_uncertainty: bool,
    #[serde(default)]
    pub calendar_surprise_z: f64,
    /// Recent and upcoming events relevant to this symbol
    #[serde(default)]
    pub news: Vec<NewsEvent>,
}

impl Context {
    /// List every field that is missing or out of range.
    ///
    /// An empty list means the context is usable for gating.
    pub fn problems(&self) -> Vec<String> {
        let mut problems = Vec::new();

        if self.symbol.trim().is_empty() {
            problems.push("symbol is empty".to_string());
        }
        if self.timeframe.trim().is_empty() {
            problems.push("timeframe is empty".to_string());
        }
        if !self.atr.is_finite() || self.atr <= 0.0 {
            problems.push(format!("atr must be positive, got {}", self.atr));
        }
        if !self.trend_score.is_finite() {
            problems.push("trend_score is not finite".to_string());
        }
        if !self.spread.is_finite() || self.spread < 0.0 {
            problems.push(format!("spread must be non-negative, got {}", self.spread));
        }
        if self.session_code > 2 {
            problems.push(format!("session_code out of range: {}", self.session_code));
        }
        if !self.news_bias.is_finite() || !(-1.0..=1.0).contains(&self.news_bias) {
            problems.push(format!("news_bias out of range: {}", self.news_bias));
        }
        if !self.news_confidence.is_finite() || !(0.0..=1.0).contains(&self.news_confidence) {
            problems.push(format!(
                "news_confidence out of range: {}",
                self.news_confidence
            ));
        }
        if !self.calendar_surprise_z.is_finite() {
            problems.push("calendar_surprise_z is not finite".to_string());
        }
        for event in &self.news {
            if !event.confidence.is_finite() || !(0.0..=1.0).contains(&event.confidence) {
                problems.push(format!(
                    "news event {} has invalid confidence {}",
                    event.event, event.confidence
                ));
            }
        }

        problems
    }

    /// JSON form stored in `context_json` columns.
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}

/// Session code from the UTC hour: 0 = Asia, 1 = Europe, 2 = US.
pub fn session_code(ts: DateTime<Utc>) -> u8 {
    use chrono::Timelike;
    match ts.hour() {
        0..=7 => 0,
        8..=15 => 1,
        _ => 2,
    }
}
