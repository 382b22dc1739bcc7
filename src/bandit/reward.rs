//! Mapping realized P&L onto the bounded bandit reward.

use crate::config::{BanditConfig, RewardMapping};

/// Pure mapping from ATR-normalized P&L to a reward in `[min, max]`.
pub trait RewardShaper: Send + Sync {
    fn shape(&self, pnl_atr: f64) -> f64;
}

/// `RewardShaper` driven by `RewardMapping` and the bandit's reward range.
///
/// Positive P&L lands in `[mid, max]`, negative in `[min, mid]`, so the
/// midpoint always corresponds to a flat trade.
#[derive(Debug, Clone)]
pub struct ConfiguredReward {
    mapping: RewardMapping,
    min: f64,
    mid: f64,
    max: f64,
}

impl ConfiguredReward {
    pub fn new(mapping: RewardMapping, bandit: &BanditConfig) -> Self {
        Self {
            mapping,
            min: bandit.reward_min,
            mid: bandit.reward_midpoint,
            max: bandit.reward_max,
        }
    }

    /// Spread a signed unit value `u` in [-1, 1] over the range around the midpoint.
    fn spread(&self, u: f64) -> f64 {
        let u = u.clamp(-1.0, 1.0);
        if u >= 0.0 {
            self.mid + u * (self.max - self.mid)
        } else {
            self.mid + u * (self.mid - self.min)
        }
    }
}

impl RewardShaper for ConfiguredReward {
    fn shape(&self, pnl_atr: f64) -> f64 {
        if !pnl_atr.is_finite() {
            return self.mid;
        }
        match self.mapping {
            RewardMapping::Linear { scale } => self.spread(pnl_atr * scale),
            RewardMapping::Tanh { scale } => self.spread((pnl_atr / scale).tanh()),
            RewardMapping::Sign => {
                if pnl_atr > 0.0 {
                    self.max
                } else if pnl_atr < 0.0 {
                    self.min
                } else {
                    self.mid
                }
            }
        }
    }
}
