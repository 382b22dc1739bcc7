use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgPoolOptions};
use tracing::{debug, info, instrument};

use super::{PersistenceGateway, Record, WriteIntent};
use crate::config::DatabaseConfig;
use crate::error::{AutotraderError, Result};

/// PostgreSQL storage over the core tables
#[derive(Clone)]
pub struct PostgresGateway {
    pool: PgPool,
}

impl PostgresGateway {
    /// Connect with the configured pool size
    pub async fn connect(config: &DatabaseConfig) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .connect(&config.url)
            .await?;

        info!("Connected to PostgreSQL");
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Run migrations
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        info!("Database migrations completed");
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    // ==================== Per-table writes ====================

    async fn write_trade(&self, t: &crate::domain::Trade, upsert: bool) -> Result<u64> {
        let sql = format!(
            r#"
            INSERT INTO trades (id, ts_open, ts_close, symbol, timeframe, strategy, context_json,
                                params_json, direction, lot, entry, sl, tp, exit, pnl, pnl_atr, slippage)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17)
            {}
            "#,
            on_conflict(
                "id",
                upsert,
                Some("trades.ts_close IS NULL"),
                "ts_close = EXCLUDED.ts_close, exit = EXCLUDED.exit, pnl = EXCLUDED.pnl, \
                 pnl_atr = EXCLUDED.pnl_atr, slippage = EXCLUDED.slippage, lot = EXCLUDED.lot, \
                 sl = EXCLUDED.sl, tp = EXCLUDED.tp, context_json = EXCLUDED.context_json, \
                 params_json = EXCLUDED.params_json"
            )
        );
        let result = sqlx::query(&sql)
            .bind(t.id)
            .bind(t.ts_open)
            .bind(t.ts_close)
            .bind(&t.symbol)
            .bind(&t.timeframe)
            .bind(t.strategy.as_str())
            .bind(&t.context)
            .bind(&t.params)
            .bind(t.direction.as_str())
            .bind(t.lot)
            .bind(t.entry)
            .bind(t.sl)
            .bind(t.tp)
            .bind(t.exit)
            .bind(t.pnl)
            .bind(t.pnl_atr)
            .bind(t.slippage)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn write_equity(&self, e: &crate::domain::EquityPoint, upsert: bool) -> Result<u64> {
        let sql = format!(
            "INSERT INTO equity_curve (ts, balance, equity, dd_pct) VALUES ($1, $2, $3, $4) {}",
            on_conflict(
                "ts",
                upsert,
                None,
                "balance = EXCLUDED.balance, equity = EXCLUDED.equity, dd_pct = EXCLUDED.dd_pct"
            )
        );
        let result = sqlx::query(&sql)
            .bind(e.ts)
            .bind(e.balance)
            .bind(e.equity)
            .bind(e.dd_pct)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn write_bandit_stat(&self, b: &crate::domain::BanditStatRecord, upsert: bool) -> Result<u64> {
        let sql = format!(
            r#"
            INSERT INTO bandit_stats (ts, arm, reward, context_json, alpha, beta)
            VALUES ($1, $2, $3, $4, $5, $6)
            {}
            "#,
            on_conflict(
                "ts, arm",
                upsert,
                None,
                "reward = EXCLUDED.reward, context_json = EXCLUDED.context_json, \
                 alpha = EXCLUDED.alpha, beta = EXCLUDED.beta"
            )
        );
        let result = sqlx::query(&sql)
            .bind(b.ts)
            .bind(b.arm.as_str())
            .bind(b.reward)
            .bind(&b.context)
            .bind(b.alpha)
            .bind(b.beta)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn write_wf_run(&self, w: &crate::domain::WalkForwardRun, upsert: bool) -> Result<u64> {
        let sql = format!(
            r#"
            INSERT INTO wf_registry (id, ts, window_train, window_test, config_json, metrics_json, status)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            {}
            "#,
            on_conflict(
                "id",
                upsert,
                Some("wf_registry.status NOT IN ('succeeded', 'failed')"),
                "metrics_json = EXCLUDED.metrics_json, status = EXCLUDED.status"
            )
        );
        let result = sqlx::query(&sql)
            .bind(w.id)
            .bind(w.ts)
            .bind(w.window_train.to_interval())
            .bind(w.window_test.to_interval())
            .bind(&w.config)
            .bind(&w.metrics)
            .bind(w.status.as_str())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn write_news(&self, n: &crate::domain::NewsEvent, upsert: bool) -> Result<u64> {
        let sql = format!(
            r#"
            INSERT INTO news_events (ts, source, event, sentiment, confidence, uncertainty)
            VALUES ($1, $2, $3, $4, $5, $6)
            {}
            "#,
            on_conflict(
                "ts, source, event",
                upsert,
                None,
                "sentiment = EXCLUDED.sentiment, confidence = EXCLUDED.confidence, \
                 uncertainty = EXCLUDED.uncertainty"
            )
        );
        let result = sqlx::query(&sql)
            .bind(n.ts)
            .bind(&n.source)
            .bind(&n.event)
            .bind(n.sentiment)
            .bind(n.confidence)
            .bind(n.uncertainty)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

/// `ON CONFLICT` clause: update on upsert, otherwise skip so that zero
/// affected rows signals a duplicate. `mutable` limits the upsert to rows
/// that are not final yet; a final row also leaves zero rows affected.
fn on_conflict(key: &str, upsert: bool, mutable: Option<&str>, assignments: &str) -> String {
    if upsert {
        match mutable {
            Some(guard) => format!(
                "ON CONFLICT ({}) DO UPDATE SET {} WHERE {}",
                key, assignments, guard
            ),
            None => format!("ON CONFLICT ({}) DO UPDATE SET {}", key, assignments),
        }
    } else {
        format!("ON CONFLICT ({}) DO NOTHING", key)
    }
}

#[async_trait]
impl PersistenceGateway for PostgresGateway {
    #[instrument(skip(self, record), fields(table = record.table()))]
    async fn record(&self, record: Record, intent: WriteIntent) -> Result<()> {
        let upsert = intent == WriteIntent::Update;
        let affected = match &record {
            Record::Trade(t) => self.write_trade(t, upsert).await?,
            Record::Equity(e) => self.write_equity(e, upsert).await?,
            Record::BanditStat(b) => self.write_bandit_stat(b, upsert).await?,
            Record::WalkForward(w) => self.write_wf_run(w, upsert).await?,
            Record::News(n) => self.write_news(n, upsert).await?,
        };

        if affected == 0 {
            let (table, key) = (record.table(), record.key());
            return Err(if upsert {
                AutotraderError::FinalRow { table, key }
            } else {
                AutotraderError::DuplicateKey { table, key }
            });
        }
        debug!(key = %record.key(), ?intent, "recorded row");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_skips_conflicts() {
        assert_eq!(on_conflict("id", false, Some("x"), "a = 1"), "ON CONFLICT (id) DO NOTHING");
    }

    #[test]
    fn test_upsert_only_touches_open_rows() {
        let sql = on_conflict(
            "id",
            true,
            Some("wf_registry.status NOT IN ('succeeded', 'failed')"),
            "status = EXCLUDED.status",
        );
        assert_eq!(
            sql,
            "ON CONFLICT (id) DO UPDATE SET status = EXCLUDED.status \
             WHERE wf_registry.status NOT IN ('succeeded', 'failed')"
        );
        assert!(!on_conflict("ts", true, None, "equity = EXCLUDED.equity").contains("WHERE"));
    }
}
