use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, Ordering};
use tokio::sync::RwLock;
use tracing::debug;

use super::{PersistenceGateway, Record, WriteIntent};
use crate::error::{AutotraderError, Result};

/// Map-backed gateway with the same key semantics as the database.
#[derive(Debug, Default)]
pub struct InMemoryGateway {
    rows: RwLock<BTreeMap<(&'static str, String), Record>>,
    /// Remaining writes to fail with `PersistenceFailure`
    fail_next: AtomicU32,
}

impl InMemoryGateway {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` writes fail with a transient error.
    pub fn fail_next(&self, n: u32) {
        self.fail_next.store(n, Ordering::SeqCst);
    }

    pub async fn get(&self, table: &str, key: &str) -> Option<Record> {
        self.rows
            .read()
            .await
            .iter()
            .find(|((t, k), _)| *t == table && k == key)
            .map(|(_, r)| r.clone())
    }

    /// All rows of `table` in key order
    pub async fn rows(&self, table: &str) -> Vec<Record> {
        self.rows
            .read()
            .await
            .iter()
            .filter(|((t, _), _)| *t == table)
            .map(|(_, r)| r.clone())
            .collect()
    }

    pub async fn len(&self) -> usize {
        self.rows.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.rows.read().await.is_empty()
    }

    fn take_failure(&self) -> bool {
        self.fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl PersistenceGateway for InMemoryGateway {
    async fn record(&self, record: Record, intent: WriteIntent) -> Result<()> {
        if self.take_failure() {
            return Err(AutotraderError::PersistenceFailure(
                "injected write failure".to_string(),
            ));
        }
        // Same check the database applies to JSON columns
        serde_json::to_value(&record)?;

        let table = record.table();
        let key = (table, record.key());
        let mut rows = self.rows.write().await;
        match intent {
            WriteIntent::Insert if rows.contains_key(&key) => {
                return Err(AutotraderError::DuplicateKey { table, key: key.1 });
            }
            WriteIntent::Update if rows.get(&key).is_some_and(Record::is_final) => {
                return Err(AutotraderError::FinalRow { table, key: key.1 });
            }
            _ => {}
        }
        debug!(table, key = %key.1, ?intent, "recorded row");
        rows.insert(key, record);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::context::fixtures::now;
    use crate::domain::{EquityPoint, RunStatus, TimeWindow, WalkForwardRun};
    use chrono::Duration;

    #[tokio::test]
    async fn test_duplicate_insert_leaves_row_unchanged() {
        let gw = InMemoryGateway::new();
        let first = EquityPoint::from_peak(now(), 10_000.0, 10_000.0, 10_000.0);
        let mut second = first.clone();
        second.equity = 9_000.0;

        gw.record(first.clone().into(), WriteIntent::Insert).await.unwrap();
        let err = gw
            .record(second.clone().into(), WriteIntent::Insert)
            .await
            .unwrap_err();
        assert!(matches!(err, AutotraderError::DuplicateKey { table: "equity_curve", .. }));

        let key = Record::from(first.clone()).key();
        assert_eq!(gw.get("equity_curve", &key).await, Some(Record::Equity(first)));

        gw.record(second.clone().into(), WriteIntent::Update).await.unwrap();
        assert_eq!(gw.get("equity_curve", &key).await, Some(Record::Equity(second)));
        assert_eq!(gw.len().await, 1);
    }

    #[tokio::test]
    async fn test_injected_failures_are_transient() {
        let gw = InMemoryGateway::new();
        gw.fail_next(1);
        let point = EquityPoint::from_peak(now(), 1.0, 1.0, 1.0);
        let err = gw.record(point.clone().into(), WriteIntent::Insert).await.unwrap_err();
        assert!(err.is_transient());
        gw.record(point.into(), WriteIntent::Insert).await.unwrap();
        assert!(!gw.is_empty().await);
    }

    #[tokio::test]
    async fn test_terminal_run_cannot_be_rewritten() {
        let gw = InMemoryGateway::new();
        let train = TimeWindow::new(now() - Duration::days(10), now() - Duration::days(2)).unwrap();
        let test = TimeWindow::new(now() - Duration::days(2), now()).unwrap();
        let mut run = WalkForwardRun::pending(now(), train, test, serde_json::json!({})).unwrap();
        run.start().unwrap();
        gw.record(run.clone().into(), WriteIntent::Insert).await.unwrap();

        run.succeed(serde_json::json!({ "strategies": {} })).unwrap();
        gw.record(run.clone().into(), WriteIntent::Update).await.unwrap();

        let mut rewritten = run.clone();
        rewritten.status = RunStatus::Failed;
        let err = gw
            .record(rewritten.into(), WriteIntent::Update)
            .await
            .unwrap_err();
        assert!(matches!(err, AutotraderError::FinalRow { table: "wf_registry", .. }));
        assert!(!err.is_transient());
        assert_eq!(
            gw.get("wf_registry", &run.id.to_string()).await,
            Some(Record::WalkForward(run))
        );
    }

    #[test]
    fn test_rows_are_scoped_by_table() {
        tokio_test::block_on(async {
            let gw = InMemoryGateway::new();
            let point = EquityPoint::from_peak(now(), 1.0, 1.0, 1.0);
            tokio_test::assert_ok!(gw.record(point.into(), WriteIntent::Insert).await);

            assert_eq!(gw.rows("equity_curve").await.len(), 1);
            assert!(gw.rows("trades").await.is_empty());
            assert_eq!(gw.get("trades", &now().to_rfc3339()).await, None);
        });
    }
}
