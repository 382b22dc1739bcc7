//! Append-only record shapes handed to the persistence gateway.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::fmt;
use uuid::Uuid;

use super::arm::ArmId;
use crate::error::{AutotraderError, Result};

// =============================================================================
// TimeWindow
// =============================================================================

/// Half-open time range `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl TimeWindow {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Result<Self> {
        if end <= start {
            return Err(AutotraderError::Configuration(format!(
                "empty time window: {} .. {}",
                start, end
            )));
        }
        Ok(Self { start, end })
    }

    pub fn contains(&self, ts: DateTime<Utc>) -> bool {
        ts >= self.start && ts < self.end
    }

    /// True when this window ends at or before `other` starts.
    pub fn precedes(&self, other: &TimeWindow) -> bool {
        self.end <= other.start
    }

    /// ISO-8601 interval, the form stored in `window_train`/`window_test`.
    pub fn to_interval(&self) -> String {
        format!("{}/{}", self.start.to_rfc3339(), self.end.to_rfc3339())
    }

    pub fn parse_interval(s: &str) -> Option<Self> {
        let (start, end) = s.split_once('/')?;
        let start = DateTime::parse_from_rfc3339(start).ok()?.with_timezone(&Utc);
        let end = DateTime::parse_from_rfc3339(end).ok()?.with_timezone(&Utc);
        Self::new(start, end).ok()
    }
}

impl fmt::Display for TimeWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_interval())
    }
}

// =============================================================================
// EquityPoint
// =============================================================================

/// One settlement point on the equity curve. Keyed by `ts`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EquityPoint {
    pub ts: DateTime<Utc>,
    pub balance: f64,
    pub equity: f64,
    pub dd_pct: f64,
}

impl EquityPoint {
    /// Build a point, deriving drawdown from the running equity peak.
    pub fn from_peak(ts: DateTime<Utc>, balance: f64, equity: f64, peak_equity: f64) -> Self {
        let dd_pct = if peak_equity > 0.0 && equity < peak_equity {
            (peak_equity - equity) / peak_equity * 100.0
        } else {
            0.0
        };
        Self {
            ts,
            balance,
            equity,
            dd_pct,
        }
    }
}

// =============================================================================
// BanditStatRecord
// =============================================================================

/// Audit entry for one belief update. Never mutated after creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BanditStatRecord {
    pub ts: DateTime<Utc>,
    pub arm: ArmId,
    pub reward: f64,
    pub context: JsonValue,
    pub alpha: f64,
    pub beta: f64,
}

// =============================================================================
// RunStatus: state machine
// =============================================================================

/// Lifecycle status of a walk-forward registry entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
}

impl RunStatus {
    /// Valid next states from the current status.
    pub fn valid_transitions(self) -> &'static [RunStatus] {
        use RunStatus::*;
        match self {
            Pending => &[Running, Failed],
            Running => &[Succeeded, Failed],
            Succeeded => &[],
            Failed => &[],
        }
    }

    pub fn can_transition_to(self, next: RunStatus) -> bool {
        self.valid_transitions().contains(&next)
    }

    pub fn is_terminal(self) -> bool {
        self.valid_transitions().is_empty()
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "running" => Some(Self::Running),
            "succeeded" => Some(Self::Succeeded),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// WalkForwardRun: wf_registry row
// =============================================================================

/// One walk-forward window evaluation. Terminal states are immutable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WalkForwardRun {
    pub id: Uuid,
    pub ts: DateTime<Utc>,
    pub window_train: TimeWindow,
    pub window_test: TimeWindow,
    pub config: JsonValue,
    /// Per-strategy metrics; on failure carries an `error` field
    pub metrics: JsonValue,
    pub status: RunStatus,
}

impl WalkForwardRun {
    /// New `pending` entry. Fails with `LeakageViolation` if the windows overlap.
    pub fn pending(
        ts: DateTime<Utc>,
        window_train: TimeWindow,
        window_test: TimeWindow,
        config: JsonValue,
    ) -> Result<Self> {
        if !window_train.precedes(&window_test) {
            return Err(AutotraderError::LeakageViolation(format!(
                "train window {} overlaps test window {}",
                window_train, window_test
            )));
        }
        Ok(Self {
            id: Uuid::new_v4(),
            ts,
            window_train,
            window_test,
            config,
            metrics: JsonValue::Object(Default::default()),
            status: RunStatus::Pending,
        })
    }

    fn transition(&mut self, next: RunStatus) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(AutotraderError::InvalidStateTransition {
                from: self.status.to_string(),
                to: next.to_string(),
            });
        }
        self.status = next;
        Ok(())
    }

    pub fn start(&mut self) -> Result<()> {
        self.transition(RunStatus::Running)
    }

    pub fn succeed(&mut self, metrics: JsonValue) -> Result<()> {
        self.transition(RunStatus::Succeeded)?;
        self.metrics = metrics;
        Ok(())
    }

    /// Mark failed, keeping the captured error inside `metrics_json`.
    pub fn fail(&mut self, error: &str) -> Result<()> {
        self.transition(RunStatus::Failed)?;
        self.metrics = serde_json::json!({ "error": error });
        Ok(())
    }

    /// Captured error of a failed run.
    pub fn error(&self) -> Option<&str> {
        self.metrics.get("error").and_then(JsonValue::as_str)
    }
}
