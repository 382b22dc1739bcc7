//! Context construction from raw bars and news.

use chrono::{DateTime, Duration, Utc};
use tracing::debug;

use crate::config::RiskConfig;
use crate::domain::{session_code, Bar, Context, NewsEvent, Regime};
use crate::error::{AutotraderError, Result};
use crate::strategy::indicators::{atr, closes, trend_score};

/// Raw feed inputs for one decision point
#[derive(Debug, Clone, Copy)]
pub struct MarketSnapshot<'a> {
    pub ts: DateTime<Utc>,
    pub symbol: &'a str,
    pub timeframe: &'a str,
    /// Closed bars up to `ts`
    pub bars: &'a [Bar],
    /// Live quoted spread; falls back to the last bar's spread when `None`
    pub spread: Option<f64>,
    pub news: &'a [NewsEvent],
}

/// Builds the immutable `Context` for a decision epoch.
pub trait ContextBuilder: Send + Sync {
    fn build(&self, snapshot: &MarketSnapshot<'_>) -> Result<Context>;
}

/// Regime and news aggregation from bar indicators.
#[derive(Debug, Clone)]
pub struct BarContextBuilder {
    pub atr_period: usize,
    /// Bars of ATR history the volatility ratio is measured against
    pub vol_lookback: usize,
    pub high_vol_ratio: f64,
    pub low_vol_ratio: f64,
    /// |trend_score| at or above this is trending
    pub trend_threshold: f64,
    /// News within this many minutes of `ts` is attached to the context
    pub news_window_minutes: i64,
}

impl Default for BarContextBuilder {
    fn default() -> Self {
        Self {
            atr_period: 14,
            vol_lookback: 100,
            high_vol_ratio: 1.3,
            low_vol_ratio: 0.7,
            trend_threshold: 0.5,
            news_window_minutes: 120,
        }
    }
}

impl BarContextBuilder {
    /// Defaults, with the news window widened to cover the risk blackout so
    /// no event the guard would act on is dropped from the context.
    pub fn for_risk(risk: &RiskConfig) -> Self {
        let defaults = Self::default();
        Self {
            news_window_minutes: defaults.news_window_minutes.max(risk.news_blackout_minutes),
            ..defaults
        }
    }

    fn classify(&self, atr_now: f64, atr_history: &[f64], trend: f64) -> Regime {
        let baseline = if atr_history.is_empty() {
            atr_now
        } else {
            atr_history.iter().sum::<f64>() / atr_history.len() as f64
        };
        let ratio = if baseline > 0.0 { atr_now / baseline } else { 1.0 };

        if ratio >= self.high_vol_ratio {
            Regime::HighVol
        } else if ratio <= self.low_vol_ratio {
            Regime::LowVol
        } else if trend.abs() >= self.trend_threshold {
            Regime::Trending
        } else {
            Regime::Ranging
        }
    }
}

impl ContextBuilder for BarContextBuilder {
    fn build(&self, snapshot: &MarketSnapshot<'_>) -> Result<Context> {
        let bars = snapshot.bars;
        let last = bars.last().ok_or_else(|| {
            AutotraderError::InvalidMarketData(format!("no bars for {}", snapshot.symbol))
        })?;
        if last.ts > snapshot.ts {
            return Err(AutotraderError::InvalidMarketData(format!(
                "bar at {} is after context time {}",
                last.ts, snapshot.ts
            )));
        }

        let atr_series = atr(bars, self.atr_period);
        let atr_now = atr_series.last().copied().flatten().ok_or_else(|| {
            AutotraderError::InvalidMarketData(format!(
                "need {} bars for ATR, have {}",
                self.atr_period,
                bars.len()
            ))
        })?;
        let history: Vec<f64> = atr_series
            .iter()
            .rev()
            .take(self.vol_lookback)
            .filter_map(|a| *a)
            .collect();
        let trend = trend_score(&closes(bars)).last().copied().unwrap_or(0.0);
        let regime = self.classify(atr_now, &history, trend);

        let window = Duration::minutes(self.news_window_minutes);
        let news: Vec<NewsEvent> = snapshot
            .news
            .iter()
            .filter(|n| (n.ts - snapshot.ts).abs() <= window)
            .cloned()
            .collect();
        let weight: f64 = news.iter().map(|n| n.confidence).sum();
        let news_bias = if weight > 0.0 {
            (news.iter().map(|n| n.sentiment * n.confidence).sum::<f64>() / weight).clamp(-1.0, 1.0)
        } else {
            0.0
        };
        let news_confidence = news.iter().map(|n| n.confidence).fold(0.0, f64::max);

        debug!(
            symbol = snapshot.symbol,
            atr = atr_now,
            trend,
            %regime,
            news = news.len(),
            "built context"
        );

        Ok(Context {
            ts: snapshot.ts,
            symbol: snapshot.symbol.to_string(),
            timeframe: snapshot.timeframe.to_string(),
            atr: atr_now,
            trend_score: trend,
            spread: snapshot.spread.unwrap_or(last.spread),
            session_code: session_code(snapshot.ts),
            regime,
            news_bias,
            news_confidence,
            news_uncertainty: news.iter().any(|n| n.uncertainty),
            calendar_surprise_z: 0.0,
            news,
        })
    }
}
