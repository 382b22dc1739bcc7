//! Beta posterior over an arm's success probability.

use serde::{Deserialize, Serialize};

use crate::error::{AutotraderError, Result};

/// Smallest value alpha or beta may take after decay or shrink.
const MIN_PARAM: f64 = 1e-6;

/// Beta(alpha, beta) belief. Both parameters stay strictly positive.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BetaBelief {
    alpha: f64,
    beta: f64,
}

impl BetaBelief {
    pub fn new(alpha: f64, beta: f64) -> Result<Self> {
        if !(alpha.is_finite() && beta.is_finite() && alpha > 0.0 && beta > 0.0) {
            return Err(AutotraderError::Configuration(format!(
                "beta belief parameters must be positive, got alpha={} beta={}",
                alpha, beta
            )));
        }
        Ok(Self { alpha, beta })
    }

    pub fn alpha(&self) -> f64 {
        self.alpha
    }

    pub fn beta(&self) -> f64 {
        self.beta
    }

    /// Posterior mean alpha / (alpha + beta)
    pub fn mean(&self) -> f64 {
        self.alpha / (self.alpha + self.beta)
    }

    /// Pseudo-observations accumulated, prior included
    pub fn strength(&self) -> f64 {
        self.alpha + self.beta
    }

    /// Add weighted evidence to alpha (success) or beta (failure).
    ///
    /// Non-finite or negative weights are ignored.
    pub fn observe(&mut self, success: bool, weight: f64) {
        if !weight.is_finite() || weight <= 0.0 {
            return;
        }
        if success {
            self.alpha += weight;
        } else {
            self.beta += weight;
        }
    }

    /// Move toward `prior`, keeping `keep` (in [0, 1]) of the evidence gathered since.
    pub fn pull_toward(&mut self, prior: &BetaBelief, keep: f64) {
        let keep = keep.clamp(0.0, 1.0);
        self.alpha = (prior.alpha + (self.alpha - prior.alpha) * keep).max(MIN_PARAM);
        self.beta = (prior.beta + (self.beta - prior.beta) * keep).max(MIN_PARAM);
    }
}

/// Per-update retention factor for a half-life measured in updates.
pub fn decay_factor(half_life: u32) -> f64 {
    if half_life == 0 {
        return 1.0;
    }
    (0.5f64.ln() / half_life as f64).exp()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejects_non_positive_parameters() {
        assert!(BetaBelief::new(0.0, 1.0).is_err());
        assert!(BetaBelief::new(1.0, f64::NAN).is_err());
        assert!(BetaBelief::new(0.5, 0.5).is_ok());
    }

    #[test]
    fn test_observe_ignores_bad_weights() {
        let mut b = BetaBelief::new(1.0, 1.0).unwrap();
        b.observe(true, -3.0);
        b.observe(false, f64::INFINITY);
        assert_eq!(b, BetaBelief::new(1.0, 1.0).unwrap());
        b.observe(true, 1.0);
        assert!((b.mean() - 2.0 / 3.0).abs() < 1e-12);
    }

    #[test]
    fn test_pull_toward_prior() {
        let prior = BetaBelief::new(1.0, 1.0).unwrap();
        let mut b = BetaBelief::new(5.0, 3.0).unwrap();
        b.pull_toward(&prior, 0.5);
        assert!((b.alpha() - 3.0).abs() < 1e-12);
        assert!((b.beta() - 2.0).abs() < 1e-12);
        b.pull_toward(&prior, 0.0);
        assert_eq!(b, prior);
    }

    #[test]
    fn test_decay_factor_half_life() {
        let f = decay_factor(10);
        assert!((f.powi(10) - 0.5).abs() < 1e-12);
        assert_eq!(decay_factor(0), 1.0);
    }
}
