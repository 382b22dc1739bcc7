//! Contextual Thompson-sampling arm selector.
//!
//! Beliefs are kept per (context bucket, arm) and created lazily from the
//! configured prior. All mutation goes through `&mut self`, so one selector
//! instance serializes its own select/update cycle. Independent instances
//! share nothing.

use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::{Beta, Distribution};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, info, warn};

use super::belief::{decay_factor, BetaBelief};
use super::bucket::ContextBucketer;
use crate::config::{BanditAlgorithm, BanditConfig};
use crate::domain::{Arm, ArmId, BanditStatRecord, Context, Regime};
use crate::error::{AutotraderError, Result};

// =============================================================================
// Arm registration
// =============================================================================

/// Static description of a selectable arm.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ArmSpec {
    pub id: ArmId,
    /// Parameters used in every regime unless overridden
    #[serde(default)]
    pub params: Map<String, JsonValue>,
    /// Regimes the arm may trade in; empty means all
    #[serde(default)]
    pub regimes: BTreeSet<Regime>,
    /// Per-regime parameter overrides, merged over `params`
    #[serde(default)]
    pub regime_params: BTreeMap<Regime, Map<String, JsonValue>>,
}

impl ArmSpec {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: ArmId::new(id),
            ..Default::default()
        }
    }

    pub fn with_params(mut self, params: Map<String, JsonValue>) -> Self {
        self.params = params;
        self
    }

    pub fn with_regimes(mut self, regimes: impl IntoIterator<Item = Regime>) -> Self {
        self.regimes = regimes.into_iter().collect();
        self
    }

    /// Active parameters for `regime`, or `None` when the arm has none there.
    pub fn params_for(&self, regime: Regime) -> Option<Map<String, JsonValue>> {
        if !self.regimes.is_empty() && !self.regimes.contains(&regime) {
            return None;
        }
        let mut params = self.params.clone();
        if let Some(overrides) = self.regime_params.get(&regime) {
            for (k, v) in overrides {
                params.insert(k.clone(), v.clone());
            }
        }
        Some(params)
    }
}

#[derive(Debug, Clone)]
struct ArmEntry {
    spec: ArmSpec,
    disabled: bool,
}

/// Belief plus running reward statistics for one (bucket, arm) cell.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ArmState {
    pub belief: BetaBelief,
    pub pulls: u64,
    pub reward_sum: f64,
}

impl ArmState {
    fn fresh(prior: BetaBelief) -> Self {
        Self {
            belief: prior,
            pulls: 0,
            reward_sum: 0.0,
        }
    }

    fn mean_reward(&self) -> f64 {
        if self.pulls == 0 {
            0.0
        } else {
            self.reward_sum / self.pulls as f64
        }
    }
}

// =============================================================================
// Snapshot
// =============================================================================

/// Serialized state of one (bucket, arm) cell.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArmCellSnapshot {
    pub bucket: String,
    pub arm: ArmId,
    pub alpha: f64,
    pub beta: f64,
    #[serde(default)]
    pub pulls: u64,
    #[serde(default)]
    pub reward_sum: f64,
}

/// Serializable selector state, for restart persistence.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BanditSnapshot {
    #[serde(default)]
    pub cells: Vec<ArmCellSnapshot>,
    #[serde(default)]
    pub disabled: Vec<ArmId>,
}

impl BanditSnapshot {
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn from_json(s: &str) -> Result<Self> {
        Ok(serde_json::from_str(s)?)
    }
}

// =============================================================================
// BanditSelector
// =============================================================================

pub struct BanditSelector {
    config: BanditConfig,
    prior: BetaBelief,
    bucketer: Box<dyn ContextBucketer>,
    arms: BTreeMap<ArmId, ArmEntry>,
    /// bucket -> arm -> state
    beliefs: BTreeMap<String, BTreeMap<ArmId, ArmState>>,
    rng: StdRng,
}

impl std::fmt::Debug for BanditSelector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BanditSelector")
            .field("algorithm", &self.config.algorithm)
            .field("prior", &self.prior)
            .field("arms", &self.arms.keys().collect::<Vec<_>>())
            .field("buckets", &self.beliefs.len())
            .finish()
    }
}

impl BanditSelector {
    /// Build a selector. Seeds the RNG from `config.seed` when set.
    pub fn new(config: BanditConfig, bucketer: Box<dyn ContextBucketer>) -> Result<Self> {
        let prior = BetaBelief::new(config.prior_alpha, config.prior_beta)?;
        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Ok(Self {
            config,
            prior,
            bucketer,
            arms: BTreeMap::new(),
            beliefs: BTreeMap::new(),
            rng,
        })
    }

    pub fn config(&self) -> &BanditConfig {
        &self.config
    }

    pub fn prior(&self) -> BetaBelief {
        self.prior
    }

    /// Register (or replace the spec of) an arm. Existing beliefs are kept.
    pub fn register_arm(&mut self, spec: ArmSpec) {
        let id = spec.id.clone();
        match self.arms.get_mut(&id) {
            Some(entry) => entry.spec = spec,
            None => {
                debug!(arm = %id, "registered arm");
                self.arms.insert(
                    id,
                    ArmEntry {
                        spec,
                        disabled: false,
                    },
                );
            }
        }
    }

    pub fn arm_ids(&self) -> impl Iterator<Item = &ArmId> {
        self.arms.keys()
    }

    pub fn is_disabled(&self, arm: &ArmId) -> bool {
        self.arms.get(arm).map(|e| e.disabled).unwrap_or(false)
    }

    /// Belief for `arm` in the bucket of `context`; the prior if never updated there.
    pub fn belief(&self, arm: &ArmId, context: &Context) -> Option<BetaBelief> {
        self.state(arm, context).map(|s| s.belief)
    }

    pub fn state(&self, arm: &ArmId, context: &Context) -> Option<ArmState> {
        if !self.arms.contains_key(arm) {
            return None;
        }
        let bucket = self.bucketer.bucket(context);
        Some(
            self.beliefs
                .get(&bucket)
                .and_then(|cells| cells.get(arm))
                .copied()
                .unwrap_or_else(|| ArmState::fresh(self.prior)),
        )
    }

    // =========================================================================
    // Selection
    // =========================================================================

    /// Choose an arm for `context`.
    ///
    /// Only enabled arms with parameters for the context's regime compete.
    /// Fails with `NoEligibleArm` when none do; callers stay flat.
    pub fn select(&mut self, context: &Context) -> Result<Arm> {
        let bucket = self.bucketer.bucket(context);
        let prior = self.prior;
        let cells = self.beliefs.get(&bucket);

        let eligible: Vec<(&ArmId, Map<String, JsonValue>, ArmState)> = self
            .arms
            .iter()
            .filter(|(_, entry)| !entry.disabled)
            .filter_map(|(id, entry)| {
                let params = entry.spec.params_for(context.regime)?;
                let state = cells
                    .and_then(|c| c.get(id))
                    .copied()
                    .unwrap_or_else(|| ArmState::fresh(prior));
                Some((id, params, state))
            })
            .collect();

        if eligible.is_empty() {
            debug!(regime = %context.regime, bucket = %bucket, "no eligible arm");
            return Err(AutotraderError::NoEligibleArm);
        }

        let scores: Vec<f64> = match self.config.algorithm {
            BanditAlgorithm::Thompson => {
                let mut scores = Vec::with_capacity(eligible.len());
                for (id, _, state) in &eligible {
                    let dist = Beta::new(state.belief.alpha(), state.belief.beta()).map_err(|e| {
                        AutotraderError::Internal(format!("beta distribution for {}: {}", id, e))
                    })?;
                    scores.push(dist.sample(&mut self.rng));
                }
                scores
            }
            BanditAlgorithm::Ucb1 => {
                let total: u64 = eligible.iter().map(|(_, _, s)| s.pulls.max(1)).sum();
                let ln_total = (total as f64).ln();
                eligible
                    .iter()
                    .map(|(_, _, s)| {
                        if s.pulls == 0 {
                            f64::INFINITY
                        } else {
                            s.mean_reward() + (2.0 * ln_total / s.pulls as f64).sqrt()
                        }
                    })
                    .collect()
            }
        };

        // Arms are in ascending id order; strict comparison keeps the lowest id on ties.
        let mut best = 0;
        for (i, score) in scores.iter().enumerate().skip(1) {
            if *score > scores[best] {
                best = i;
            }
        }

        let (id, params, _) = &eligible[best];
        debug!(
            arm = %id,
            score = scores[best],
            candidates = eligible.len(),
            bucket = %bucket,
            "selected arm"
        );
        Ok(Arm::new((*id).clone(), params.clone()))
    }

    // =========================================================================
    // Belief updates
    // =========================================================================

    /// Apply a realized reward to `arm` in the bucket of `context`.
    ///
    /// Rewards at or above the midpoint add to alpha, below it to beta, with
    /// weight `increment * |reward - midpoint|` normalized by the half-range on
    /// that side. Rewards outside `[reward_min, reward_max]` are clamped.
    pub fn update(&mut self, arm: &ArmId, reward: f64, context: &Context) -> Result<BanditStatRecord> {
        if !self.arms.contains_key(arm) {
            return Err(AutotraderError::UnknownArm(arm.to_string()));
        }
        if !reward.is_finite() {
            return Err(AutotraderError::InvalidMarketData(format!(
                "non-finite reward for arm {}",
                arm
            )));
        }

        let cfg = &self.config;
        let reward = reward.clamp(cfg.reward_min, cfg.reward_max);
        let mid = cfg.reward_midpoint;
        let success = reward >= mid;
        let half_range = if success {
            cfg.reward_max - mid
        } else {
            mid - cfg.reward_min
        };
        let weight = cfg.increment * (reward - mid).abs() / half_range;

        let bucket = self.bucketer.bucket(context);
        let prior = self.prior;
        let state = self
            .beliefs
            .entry(bucket.clone())
            .or_default()
            .entry(arm.clone())
            .or_insert_with(|| ArmState::fresh(prior));
        state.belief.observe(success, weight);
        state.pulls += 1;
        state.reward_sum += reward;

        debug!(
            arm = %arm,
            bucket = %bucket,
            reward,
            alpha = state.belief.alpha(),
            beta = state.belief.beta(),
            pulls = state.pulls,
            "updated belief"
        );

        Ok(BanditStatRecord {
            ts: context.ts,
            arm: arm.clone(),
            reward,
            context: context.to_json(),
            alpha: state.belief.alpha(),
            beta: state.belief.beta(),
        })
    }

    /// Reset `arm` to the prior in every bucket.
    pub fn reinitialize(&mut self, arm: &ArmId) -> Result<()> {
        self.require(arm)?;
        let prior = self.prior;
        for cells in self.beliefs.values_mut() {
            if let Some(state) = cells.get_mut(arm) {
                *state = ArmState::fresh(prior);
            }
        }
        info!(arm = %arm, "reinitialized arm belief to prior");
        Ok(())
    }

    /// Pull `arm` toward the prior, keeping `keep` of its evidence.
    pub fn shrink_prior(&mut self, arm: &ArmId, keep: f64) -> Result<()> {
        self.require(arm)?;
        let prior = self.prior;
        for cells in self.beliefs.values_mut() {
            if let Some(state) = cells.get_mut(arm) {
                state.belief.pull_toward(&prior, keep);
            }
        }
        info!(arm = %arm, keep, "shrunk arm belief toward prior");
        Ok(())
    }

    /// Decay one arm toward the prior by one step of a `half_life`-update half-life.
    pub fn decay_arm(&mut self, arm: &ArmId, half_life: u32) -> Result<()> {
        self.require(arm)?;
        let factor = decay_factor(half_life);
        let prior = self.prior;
        for cells in self.beliefs.values_mut() {
            if let Some(state) = cells.get_mut(arm) {
                Self::decay_state(state, &prior, factor);
            }
        }
        Ok(())
    }

    /// Decay every arm in every bucket one step toward the prior.
    pub fn apply_decay(&mut self, half_life: u32) {
        let factor = decay_factor(half_life);
        let prior = self.prior;
        for cells in self.beliefs.values_mut() {
            for state in cells.values_mut() {
                Self::decay_state(state, &prior, factor);
            }
        }
        debug!(half_life, factor, "applied belief decay");
    }

    fn decay_state(state: &mut ArmState, prior: &BetaBelief, factor: f64) {
        state.belief.pull_toward(prior, factor);
        state.pulls = (state.pulls as f64 * factor).floor() as u64;
        state.reward_sum *= factor;
    }

    pub fn disable_arm(&mut self, arm: &ArmId) -> Result<()> {
        let entry = self
            .arms
            .get_mut(arm)
            .ok_or_else(|| AutotraderError::UnknownArm(arm.to_string()))?;
        if !entry.disabled {
            warn!(arm = %arm, "arm disabled");
        }
        entry.disabled = true;
        Ok(())
    }

    pub fn enable_arm(&mut self, arm: &ArmId) -> Result<()> {
        let entry = self
            .arms
            .get_mut(arm)
            .ok_or_else(|| AutotraderError::UnknownArm(arm.to_string()))?;
        if entry.disabled {
            info!(arm = %arm, "arm re-enabled");
        }
        entry.disabled = false;
        Ok(())
    }

    fn require(&self, arm: &ArmId) -> Result<()> {
        if self.arms.contains_key(arm) {
            Ok(())
        } else {
            Err(AutotraderError::UnknownArm(arm.to_string()))
        }
    }

    // =========================================================================
    // Persistence
    // =========================================================================

    pub fn snapshot(&self) -> BanditSnapshot {
        let cells = self
            .beliefs
            .iter()
            .flat_map(|(bucket, cells)| {
                cells.iter().map(move |(arm, state)| ArmCellSnapshot {
                    bucket: bucket.clone(),
                    arm: arm.clone(),
                    alpha: state.belief.alpha(),
                    beta: state.belief.beta(),
                    pulls: state.pulls,
                    reward_sum: state.reward_sum,
                })
            })
            .collect();
        let disabled = self
            .arms
            .iter()
            .filter(|(_, e)| e.disabled)
            .map(|(id, _)| id.clone())
            .collect();
        BanditSnapshot { cells, disabled }
    }

    /// Replace all beliefs with `snapshot`.
    ///
    /// Cells for unregistered arms are skipped. Invalid parameters fail the
    /// whole restore and leave the current state untouched.
    pub fn restore(&mut self, snapshot: &BanditSnapshot) -> Result<()> {
        let mut beliefs: BTreeMap<String, BTreeMap<ArmId, ArmState>> = BTreeMap::new();
        for cell in &snapshot.cells {
            if !self.arms.contains_key(&cell.arm) {
                warn!(arm = %cell.arm, "skipping snapshot cell for unregistered arm");
                continue;
            }
            let belief = BetaBelief::new(cell.alpha, cell.beta)?;
            beliefs.entry(cell.bucket.clone()).or_default().insert(
                cell.arm.clone(),
                ArmState {
                    belief,
                    pulls: cell.pulls,
                    reward_sum: cell.reward_sum,
                },
            );
        }

        self.beliefs = beliefs;
        for (id, entry) in self.arms.iter_mut() {
            entry.disabled = snapshot.disabled.contains(id);
        }
        info!(cells = snapshot.cells.len(), "restored bandit state");
        Ok(())
    }
}
