//! Train/test window planning.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::config::WalkForwardConfig;
use crate::domain::TimeWindow;
use crate::error::{AutotraderError, Result};

/// One (train, test) pair
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowPair {
    pub train: TimeWindow,
    pub test: TimeWindow,
}

/// Plan windows over `[start, end)`.
///
/// Rolling plans slide both windows by `step_hours`; anchored plans keep
/// the train start at `start` and grow it. A test window is only planned if
/// it ends at or before `end`.
pub fn plan_windows(
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    config: &WalkForwardConfig,
) -> Result<Vec<WindowPair>> {
    let train = Duration::hours(config.train_hours);
    let test = Duration::hours(config.test_hours);
    let step = Duration::hours(config.step_hours);
    if train <= Duration::zero() || test <= Duration::zero() || step <= Duration::zero() {
        return Err(AutotraderError::Configuration(
            "walk-forward window lengths and step must be positive".to_string(),
        ));
    }

    let mut pairs = Vec::new();
    let mut offset = Duration::zero();
    loop {
        let train_start = if config.anchored { start } else { start + offset };
        let train_end = start + train + offset;
        let test_end = train_end + test;
        if test_end > end {
            break;
        }
        pairs.push(WindowPair {
            train: TimeWindow::new(train_start, train_end)?,
            test: TimeWindow::new(train_end, test_end)?,
        });
        offset = offset + step;
    }

    validate_plan(&pairs)?;
    Ok(pairs)
}

/// Check the ordering invariants of a window plan.
///
/// Every train window must end at or before its test window starts, and test
/// windows must advance strictly in time.
pub fn validate_plan(pairs: &[WindowPair]) -> Result<()> {
    for (i, pair) in pairs.iter().enumerate() {
        if !pair.train.precedes(&pair.test) {
            return Err(AutotraderError::LeakageViolation(format!(
                "window {}: train {} overlaps test {}",
                i, pair.train, pair.test
            )));
        }
    }
    for (i, w) in pairs.windows(2).enumerate() {
        if w[1].test.start <= w[0].test.start {
            return Err(AutotraderError::LeakageViolation(format!(
                "window {} test {} does not follow window {} test {}",
                i + 1,
                w[1].test,
                i,
                w[0].test
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
    }

    fn config(anchored: bool) -> WalkForwardConfig {
        WalkForwardConfig {
            train_hours: 24,
            test_hours: 12,
            step_hours: 12,
            anchored,
            ..Default::default()
        }
    }

    #[test]
    fn test_rolling_plan() {
        let pairs = plan_windows(t0(), t0() + Duration::hours(60), &config(false)).unwrap();
        assert_eq!(pairs.len(), 3);
        assert_eq!(pairs[1].train.start, t0() + Duration::hours(12));
        assert_eq!(pairs[1].test.start, t0() + Duration::hours(36));
        assert_eq!(pairs[2].test.end, t0() + Duration::hours(60));
        for p in &pairs {
            assert!(p.train.end <= p.test.start);
            assert_eq!(p.train.end - p.train.start, Duration::hours(24));
        }
    }

    #[test]
    fn test_anchored_plan_grows_train() {
        let pairs = plan_windows(t0(), t0() + Duration::hours(60), &config(true)).unwrap();
        assert_eq!(pairs.len(), 3);
        assert!(pairs.iter().all(|p| p.train.start == t0()));
        assert_eq!(pairs[2].train.end - pairs[2].train.start, Duration::hours(48));
    }

    #[test]
    fn test_short_history_yields_no_windows() {
        let pairs = plan_windows(t0(), t0() + Duration::hours(30), &config(false)).unwrap();
        assert!(pairs.is_empty());
    }

    #[test]
    fn test_validate_rejects_overlap() {
        let bad = WindowPair {
            train: TimeWindow::new(t0(), t0() + Duration::hours(10)).unwrap(),
            test: TimeWindow::new(t0() + Duration::hours(9), t0() + Duration::hours(12)).unwrap(),
        };
        assert!(matches!(
            validate_plan(&[bad]),
            Err(AutotraderError::LeakageViolation(_))
        ));
    }
}
