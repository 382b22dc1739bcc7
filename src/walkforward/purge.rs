//! Leakage control for training data: label purging and purged K-fold CV.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::ops::Range;

use crate::domain::{Bar, TimeWindow};

/// A training example whose label is only known at `label_end`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LabeledSample {
    /// Index of the signal bar in the training slice
    pub index: usize,
    pub ts: DateTime<Utc>,
    /// Timestamp of the last bar the label depends on
    pub label_end: DateTime<Utc>,
    /// Realized outcome in ATR units
    pub pnl_atr: f64,
}

/// Drop every sample whose label horizon reaches `boundary` or later.
///
/// Returns the kept samples and the number purged.
pub fn purge_training(samples: Vec<LabeledSample>, boundary: DateTime<Utc>) -> (Vec<LabeledSample>, usize) {
    let before = samples.len();
    let kept: Vec<LabeledSample> = samples
        .into_iter()
        .filter(|s| s.label_end < boundary)
        .collect();
    let purged = before - kept.len();
    (kept, purged)
}

/// One cross-validation split over sample indices.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fold {
    pub train: Vec<usize>,
    pub test: Range<usize>,
}

/// Contiguous K-fold split with `embargo` samples dropped on both sides of
/// each test fold.
///
/// The first `n % k` folds get one extra sample. Yields fewer than `k` folds
/// when `n < k`.
pub fn purged_kfold(n: usize, k: usize, embargo: usize) -> Vec<Fold> {
    if n == 0 || k == 0 {
        return Vec::new();
    }
    let k = k.min(n);
    let base = n / k;
    let extra = n % k;

    let mut folds = Vec::with_capacity(k);
    let mut start = 0;
    for f in 0..k {
        let size = base + usize::from(f < extra);
        let stop = start + size;
        let left = start.saturating_sub(embargo);
        let right = (stop + embargo).min(n);
        let train = (0..left).chain(right..n).collect();
        folds.push(Fold {
            train,
            test: start..stop,
        });
        start = stop;
    }
    folds
}

/// Bars and leakage settings handed to `Strategy::fit`.
///
/// Only bars inside `window` are present; `label` purges anything whose
/// horizon would need bars past `window.end`.
#[derive(Debug, Clone, Copy)]
pub struct TrainingSet<'a> {
    pub bars: &'a [Bar],
    pub window: TimeWindow,
    /// Nominal bar spacing, used to date a label's horizon
    pub bar_duration: Duration,
    pub label_horizon: usize,
    pub cv_folds: usize,
    pub embargo: usize,
}

impl<'a> TrainingSet<'a> {
    /// Label each signal index with `outcome` and purge those that leak.
    ///
    /// `outcome(i)` returns the ATR-normalized result of acting at bar `i`,
    /// looking at most `label_horizon` bars ahead.
    pub fn label(
        &self,
        signal_indices: impl IntoIterator<Item = usize>,
        outcome: impl Fn(usize) -> Option<f64>,
    ) -> (Vec<LabeledSample>, usize) {
        let horizon = self.bar_duration * self.label_horizon as i32;
        let samples = signal_indices
            .into_iter()
            .filter(|&i| i < self.bars.len())
            .filter_map(|i| {
                let ts = self.bars[i].ts;
                let label_end = match self.bars.get(i + self.label_horizon) {
                    Some(bar) => bar.ts.max(ts + horizon),
                    None => ts + horizon,
                };
                Some(LabeledSample {
                    index: i,
                    ts,
                    label_end,
                    pnl_atr: outcome(i)?,
                })
            })
            .collect();
        purge_training(samples, self.window.end)
    }

    pub fn folds(&self, n_samples: usize) -> Vec<Fold> {
        purged_kfold(n_samples, self.cv_folds, self.embargo)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::strategy::indicators::fixtures::bars_from_closes;

    #[test]
    fn test_kfold_sizes_and_embargo() {
        let folds = purged_kfold(10, 3, 1);
        assert_eq!(folds.len(), 3);
        assert_eq!(folds[0].test, 0..4);
        assert_eq!(folds[1].test, 4..7);
        assert_eq!(folds[2].test, 7..10);

        // embargo removes index 3 and 7 around the middle fold
        assert_eq!(folds[1].train, vec![0, 1, 2, 8, 9]);
        assert_eq!(folds[0].train, vec![5, 6, 7, 8, 9]);
        for fold in &folds {
            assert!(fold.train.iter().all(|i| !fold.test.contains(i)));
        }
    }

    #[test]
    fn test_kfold_degenerate() {
        assert!(purged_kfold(0, 5, 1).is_empty());
        assert_eq!(purged_kfold(2, 5, 0).len(), 2);
    }

    #[test]
    fn test_purge_removes_labels_past_boundary() {
        let bars = bars_from_closes(&[100.0; 20]);
        let window = TimeWindow::new(bars[0].ts, bars[19].ts + Duration::hours(1)).unwrap();
        let set = TrainingSet {
            bars: &bars,
            window,
            bar_duration: Duration::hours(1),
            label_horizon: 5,
            cv_folds: 3,
            embargo: 1,
        };

        let (kept, purged) = set.label(0..20, |_| Some(0.0));
        // label at i needs bar i + 5, which exists for i <= 14
        assert_eq!(kept.len(), 15);
        assert_eq!(purged, 5);
        assert!(kept.iter().all(|s| s.label_end < window.end));
    }
}
