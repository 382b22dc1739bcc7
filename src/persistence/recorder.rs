//! Background writer for the live decision path.
//!
//! `submit` never waits on storage: records go onto a bounded queue and a
//! worker task writes them with exponential backoff on transient failures.

use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::{PersistenceGateway, Record, WriteIntent};
use crate::config::RetryConfig;
use crate::error::{AutotraderError, Result};

/// Counters reported when the worker stops
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RecorderStats {
    pub written: u64,
    pub retried: u64,
    /// Gave up after `max_attempts` transient failures
    pub exhausted: u64,
    /// Permanent failures such as duplicate keys
    pub rejected: u64,
}

impl RetryConfig {
    fn backoff_duration(&self, retry_count: u32) -> Duration {
        let delay = self
            .base_backoff_ms
            .saturating_mul(2u64.saturating_pow(retry_count));
        Duration::from_millis(delay.min(self.max_backoff_ms))
    }
}

/// Handle for queueing records. Cloning shares the same worker.
#[derive(Debug, Clone)]
pub struct BackgroundRecorder {
    tx: mpsc::Sender<(Record, WriteIntent)>,
}

impl BackgroundRecorder {
    /// Start the worker task on the current runtime.
    pub fn spawn(
        gateway: Arc<dyn PersistenceGateway>,
        retry: RetryConfig,
    ) -> (Self, JoinHandle<RecorderStats>) {
        let (tx, rx) = mpsc::channel(retry.queue_capacity.max(1));
        let handle = tokio::spawn(run_worker(gateway, retry, rx));
        (Self { tx }, handle)
    }

    /// Queue a write. Fails only if the queue is full or the worker has stopped.
    pub fn submit(&self, record: Record, intent: WriteIntent) -> Result<()> {
        let table = record.table();
        self.tx.try_send((record, intent)).map_err(|e| {
            let reason = match e {
                mpsc::error::TrySendError::Full(_) => "queue full",
                mpsc::error::TrySendError::Closed(_) => "recorder stopped",
            };
            warn!(table, reason, "dropping record");
            AutotraderError::PersistenceFailure(format!("{} write not queued: {}", table, reason))
        })
    }
}

async fn run_worker(
    gateway: Arc<dyn PersistenceGateway>,
    retry: RetryConfig,
    mut rx: mpsc::Receiver<(Record, WriteIntent)>,
) -> RecorderStats {
    let mut stats = RecorderStats::default();
    info!(
        capacity = retry.queue_capacity,
        max_attempts = retry.max_attempts,
        "background recorder started"
    );

    while let Some((record, intent)) = rx.recv().await {
        let table = record.table();
        let key = record.key();
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match gateway.record(record.clone(), intent).await {
                Ok(()) => {
                    stats.written += 1;
                    debug!(table, key = %key, attempt, "record written");
                    break;
                }
                Err(e) if e.is_transient() && attempt < retry.max_attempts => {
                    stats.retried += 1;
                    let delay = retry.backoff_duration(attempt - 1);
                    warn!(table, key = %key, attempt, ?delay, error = %e, "write failed, retrying");
                    tokio::time::sleep(delay).await;
                }
                Err(e) if e.is_transient() => {
                    stats.exhausted += 1;
                    error!(table, key = %key, attempt, error = %e, "write failed, giving up");
                    break;
                }
                Err(e) => {
                    stats.rejected += 1;
                    error!(table, key = %key, error = %e, "write rejected");
                    break;
                }
            }
        }
    }

    info!(?stats, "background recorder stopped");
    stats
}
