//! Reward drift detection.

use std::collections::HashMap;

use crate::domain::ArmId;

/// Signals that an arm's reward distribution has shifted.
pub trait DriftDetector: Send {
    /// Feed the latest reward for `arm`; true when drift is detected.
    fn check(&mut self, arm: &ArmId, reward: f64) -> bool;

    /// Forget accumulated statistics for `arm`.
    fn reset(&mut self, arm: &ArmId);
}

#[derive(Debug, Clone, Default)]
struct PhState {
    n: u64,
    mean: f64,
    cum: f64,
    min_cum: f64,
}

/// Two-sided Page-Hinkley test per arm.
///
/// Fires when the cumulative deviation from the running mean moves more than
/// `threshold` away from its extreme, either direction.
#[derive(Debug, Clone)]
pub struct PageHinkley {
    delta: f64,
    threshold: f64,
    /// Minimum observations before an alarm may fire
    warmup: u64,
    up: HashMap<ArmId, PhState>,
    down: HashMap<ArmId, PhState>,
}

impl PageHinkley {
    pub fn new(delta: f64, threshold: f64) -> Self {
        Self {
            delta,
            threshold,
            warmup: 30,
            up: HashMap::new(),
            down: HashMap::new(),
        }
    }

    pub fn with_warmup(mut self, warmup: u64) -> Self {
        self.warmup = warmup;
        self
    }

    fn step(state: &mut PhState, x: f64, delta: f64) -> f64 {
        state.n += 1;
        state.mean += (x - state.mean) / state.n as f64;
        state.cum += x - state.mean - delta;
        state.min_cum = state.min_cum.min(state.cum);
        state.cum - state.min_cum
    }
}

impl DriftDetector for PageHinkley {
    fn check(&mut self, arm: &ArmId, reward: f64) -> bool {
        if !reward.is_finite() {
            return false;
        }
        let up = self.up.entry(arm.clone()).or_default();
        let up_stat = Self::step(up, reward, self.delta);
        let n = up.n;
        let down = self.down.entry(arm.clone()).or_default();
        let down_stat = Self::step(down, -reward, self.delta);

        n >= self.warmup && (up_stat > self.threshold || down_stat > self.threshold)
    }

    fn reset(&mut self, arm: &ArmId) {
        self.up.remove(arm);
        self.down.remove(arm);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stable_stream_does_not_fire() {
        let mut ph = PageHinkley::new(0.005, 5.0);
        let arm = ArmId::new("a");
        for i in 0..500 {
            let r = if i % 2 == 0 { 0.6 } else { 0.4 };
            assert!(!ph.check(&arm, r), "fired at {i}");
        }
    }

    #[test]
    fn test_level_shift_fires_and_reset_clears() {
        let mut ph = PageHinkley::new(0.005, 5.0);
        let arm = ArmId::new("a");
        for _ in 0..100 {
            assert!(!ph.check(&arm, 0.9));
        }
        let fired = (0..100).any(|_| ph.check(&arm, 0.1));
        assert!(fired);

        ph.reset(&arm);
        assert!(!ph.check(&arm, 0.1));
    }
}
