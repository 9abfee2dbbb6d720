use std::str::FromStr;
use std::time::Duration;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::db::models::{CheckpointRow, NewPayout, NewPolicy, SystemStats};
use crate::error::Result;
use crate::types::{Anomaly, AnomalyEvent, Balance, Candle, Payout, Policy, PolicyStatus};

/// Durable store for candles, anomalies and the relational mirror of ledger
/// state. Cheap to clone; every task gets its own handle.
#[derive(Clone)]
pub struct Store {
    pool: SqlitePool,
    candle_tx: Option<mpsc::Sender<()>>,
}

impl Store {
    pub async fn connect(path: &str) -> Result<Self> {
        let opts = SqliteConnectOptions::from_str(&format!("sqlite:{path}"))?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5));
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(opts)
            .await?;
        sqlx::migrate!("./migrations").run(&pool).await?;
        info!(path, "database ready");
        Ok(Self { pool, candle_tx: None })
    }

    #[cfg(test)]
    pub async fn memory() -> Self {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        sqlx::migrate!("./migrations").run(&pool).await.unwrap();
        Self { pool, candle_tx: None }
    }

    /// Every candle write signals `tx`. A full channel drops the signal.
    pub fn with_candle_notifier(mut self, tx: mpsc::Sender<()>) -> Self {
        self.candle_tx = Some(tx);
        self
    }

    // ----- candles -----

    /// Upsert on (timestamp, symbol); value fields take the latest write.
    pub async fn upsert_candle(&self, c: &Candle) -> Result<i64> {
        let id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO prices (timestamp, symbol, open, high, low, close, volume)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            ON CONFLICT (timestamp, symbol) DO UPDATE SET
                open = excluded.open,
                high = excluded.high,
                low = excluded.low,
                close = excluded.close,
                volume = excluded.volume
            RETURNING id
            "#,
        )
        .bind(c.timestamp)
        .bind(&c.symbol)
        .bind(c.open)
        .bind(c.high)
        .bind(c.low)
        .bind(c.close)
        .bind(c.volume)
        .fetch_one(&self.pool)
        .await?;

        if let Some(tx) = &self.candle_tx {
            if tx.try_send(()).is_err() {
                debug!("candle notification dropped");
            }
        }
        Ok(id)
    }

    pub async fn latest_candle(&self, symbol: &str) -> Result<Option<Candle>> {
        Ok(sqlx::query_as::<_, Candle>(
            "SELECT timestamp, symbol, open, high, low, close, volume
             FROM prices WHERE symbol = ?1 ORDER BY timestamp DESC LIMIT 1",
        )
        .bind(symbol)
        .fetch_optional(&self.pool)
        .await?)
    }

    /// Newest candle whose bucket started at or before `started_by`.
    pub async fn latest_candle_started_by(&self, symbol: &str, started_by: i64) -> Result<Option<Candle>> {
        Ok(sqlx::query_as::<_, Candle>(
            "SELECT timestamp, symbol, open, high, low, close, volume
             FROM prices WHERE symbol = ?1 AND timestamp <= ?2
             ORDER BY timestamp DESC LIMIT 1",
        )
        .bind(symbol)
        .bind(started_by)
        .fetch_optional(&self.pool)
        .await?)
    }

    /// Candles with `after < timestamp <= started_by`, oldest first.
    pub async fn candles_between(&self, symbol: &str, after: i64, started_by: i64) -> Result<Vec<Candle>> {
        Ok(sqlx::query_as::<_, Candle>(
            "SELECT timestamp, symbol, open, high, low, close, volume
             FROM prices WHERE symbol = ?1 AND timestamp > ?2 AND timestamp <= ?3
             ORDER BY timestamp ASC",
        )
        .bind(symbol)
        .bind(after)
        .bind(started_by)
        .fetch_all(&self.pool)
        .await?)
    }

    /// All candles for `symbol`, oldest first.
    pub async fn candles_for_symbol(&self, symbol: &str) -> Result<Vec<Candle>> {
        Ok(sqlx::query_as::<_, Candle>(
            "SELECT timestamp, symbol, open, high, low, close, volume
             FROM prices WHERE symbol = ?1 ORDER BY timestamp ASC",
        )
        .bind(symbol)
        .fetch_all(&self.pool)
        .await?)
    }

    pub async fn recent_candles(&self, symbol: Option<&str>, limit: i64) -> Result<Vec<Candle>> {
        Ok(sqlx::query_as::<_, Candle>(
            "SELECT timestamp, symbol, open, high, low, close, volume
             FROM prices WHERE (?1 IS NULL OR symbol = ?1)
             ORDER BY timestamp DESC LIMIT ?2",
        )
        .bind(symbol)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?)
    }

    // ----- anomalies -----

    /// Persists `a` unless its candle already produced an event. Returns the
    /// new row, or None if one existed.
    pub async fn insert_anomaly(&self, a: &Anomaly, detected_at: i64) -> Result<Option<AnomalyEvent>> {
        Ok(sqlx::query_as::<_, AnomalyEvent>(
            r#"
            INSERT INTO anomaly_events (
                price_id, timestamp, symbol, strategy,
                open, high, low, close, body_ratio, range_ratio, detected_at
            ) VALUES (
                (SELECT id FROM prices WHERE timestamp = ?1 AND symbol = ?2),
                ?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10
            )
            ON CONFLICT (timestamp, symbol) DO NOTHING
            RETURNING id, timestamp, symbol, strategy, open, high, low, close,
                      body_ratio, range_ratio, detected_at, settled_at
            "#,
        )
        .bind(a.timestamp)
        .bind(&a.symbol)
        .bind(a.strategy)
        .bind(a.open)
        .bind(a.high)
        .bind(a.low)
        .bind(a.close)
        .bind(a.body_ratio)
        .bind(a.range_ratio)
        .bind(detected_at)
        .fetch_optional(&self.pool)
        .await?)
    }

    pub async fn recent_anomalies(&self, limit: i64) -> Result<Vec<AnomalyEvent>> {
        Ok(sqlx::query_as::<_, AnomalyEvent>(
            "SELECT id, timestamp, symbol, strategy, open, high, low, close,
                    body_ratio, range_ratio, detected_at, settled_at
             FROM anomaly_events ORDER BY timestamp DESC LIMIT ?1",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?)
    }

    /// Events still owed a settlement, oldest first.
    pub async fn unsettled_anomalies(&self, limit: i64) -> Result<Vec<AnomalyEvent>> {
        Ok(sqlx::query_as::<_, AnomalyEvent>(
            "SELECT id, timestamp, symbol, strategy, open, high, low, close,
                    body_ratio, range_ratio, detected_at, settled_at
             FROM anomaly_events WHERE settled_at IS NULL ORDER BY id ASC LIMIT ?1",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?)
    }

    pub async fn is_settled(&self, event_id: i64) -> Result<bool> {
        let settled: Option<Option<i64>> =
            sqlx::query_scalar("SELECT settled_at FROM anomaly_events WHERE id = ?1")
                .bind(event_id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(matches!(settled, Some(Some(_))))
    }

    /// First write wins; a later call leaves the original time.
    pub async fn mark_settled(&self, event_id: i64, now: i64) -> Result<()> {
        sqlx::query("UPDATE anomaly_events SET settled_at = ?2 WHERE id = ?1 AND settled_at IS NULL")
            .bind(event_id)
            .bind(now)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // ----- policies -----

    /// Active policies whose expiry is still ahead of `now`, oldest first.
    pub async fn eligible_policies(&self, now: i64) -> Result<Vec<Policy>> {
        Ok(sqlx::query_as::<_, Policy>(
            "SELECT id, user_address, onchain_id, premium, coverage_amount,
                    purchase_time, expiry_time, status, tx_hash
             FROM policies WHERE status = 'active' AND expiry_time > ?1
             ORDER BY id ASC",
        )
        .bind(now)
        .fetch_all(&self.pool)
        .await?)
    }

    /// Upsert on (user_address, purchase_time). A claimed row stays claimed.
    pub async fn upsert_policy(&self, p: &NewPolicy) -> Result<i64> {
        let id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO policies (
                user_address, onchain_id, premium, coverage_amount,
                purchase_time, expiry_time, status, tx_hash
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, COALESCE(?7, 'active'), ?8)
            ON CONFLICT (user_address, purchase_time) DO UPDATE SET
                onchain_id = COALESCE(excluded.onchain_id, policies.onchain_id),
                premium = excluded.premium,
                coverage_amount = excluded.coverage_amount,
                expiry_time = excluded.expiry_time,
                status = CASE
                    WHEN policies.status = 'claimed' THEN 'claimed'
                    ELSE COALESCE(?7, policies.status)
                END,
                tx_hash = COALESCE(excluded.tx_hash, policies.tx_hash)
            RETURNING id
            "#,
        )
        .bind(&p.user_address)
        .bind(p.onchain_id)
        .bind(p.premium)
        .bind(p.coverage_amount)
        .bind(p.purchase_time)
        .bind(p.expiry_time)
        .bind(p.status)
        .bind(&p.tx_hash)
        .fetch_one(&self.pool)
        .await?;
        Ok(id)
    }

    pub async fn policy(&self, id: i64) -> Result<Option<Policy>> {
        Ok(sqlx::query_as::<_, Policy>(
            "SELECT id, user_address, onchain_id, premium, coverage_amount,
                    purchase_time, expiry_time, status, tx_hash
             FROM policies WHERE id = ?1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?)
    }

    pub async fn policy_by_onchain_id(&self, user: &str, onchain_id: i64) -> Result<Option<Policy>> {
        Ok(sqlx::query_as::<_, Policy>(
            "SELECT id, user_address, onchain_id, premium, coverage_amount,
                    purchase_time, expiry_time, status, tx_hash
             FROM policies WHERE user_address = ?1 AND onchain_id = ?2",
        )
        .bind(user)
        .bind(onchain_id)
        .fetch_optional(&self.pool)
        .await?)
    }

    pub async fn policies(&self, user: Option<&str>, limit: i64) -> Result<Vec<Policy>> {
        Ok(sqlx::query_as::<_, Policy>(
            "SELECT id, user_address, onchain_id, premium, coverage_amount,
                    purchase_time, expiry_time, status, tx_hash
             FROM policies WHERE (?1 IS NULL OR user_address = ?1)
             ORDER BY purchase_time DESC LIMIT ?2",
        )
        .bind(user)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?)
    }

    pub async fn distinct_policy_users(&self) -> Result<Vec<String>> {
        Ok(sqlx::query_scalar("SELECT DISTINCT user_address FROM policies ORDER BY user_address")
            .fetch_all(&self.pool)
            .await?)
    }

    /// Moves active policies whose expiry has passed to inactive.
    pub async fn expire_policies(&self, now: i64) -> Result<u64> {
        let res = sqlx::query(
            "UPDATE policies SET status = ?1 WHERE status = 'active' AND expiry_time < ?2",
        )
        .bind(PolicyStatus::Inactive)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(res.rows_affected())
    }

    // ----- payouts -----

    /// Inserts the payout and marks its policy claimed in one transaction.
    /// Returns false when a payout with the same tx hash or policy already
    /// existed; the claimed transition is applied either way.
    pub async fn record_payout(&self, p: &NewPayout) -> Result<bool> {
        let mut tx = self.pool.begin().await?;

        let inserted = sqlx::query(
            r#"
            INSERT OR IGNORE INTO payouts (
                policy_id, user_address, amount, anomaly_event_id,
                onchain_policy_id, tx_hash, executed_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            "#,
        )
        .bind(p.policy_id)
        .bind(&p.user_address)
        .bind(p.amount)
        .bind(p.anomaly_event_id)
        .bind(p.onchain_policy_id)
        .bind(&p.tx_hash)
        .bind(p.executed_at)
        .execute(&mut *tx)
        .await?
        .rows_affected()
            > 0;

        if let Some(policy_id) = p.policy_id {
            sqlx::query(
                "UPDATE policies SET status = ?1, onchain_id = COALESCE(?2, onchain_id)
                 WHERE id = ?3",
            )
            .bind(PolicyStatus::Claimed)
            .bind(p.onchain_policy_id)
            .bind(policy_id)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(inserted)
    }

    pub async fn recent_payouts(&self, user: Option<&str>, limit: i64) -> Result<Vec<Payout>> {
        Ok(sqlx::query_as::<_, Payout>(
            "SELECT id, policy_id, user_address, amount, anomaly_event_id,
                    onchain_policy_id, tx_hash, executed_at
             FROM payouts WHERE (?1 IS NULL OR user_address = ?1)
             ORDER BY executed_at DESC, id DESC LIMIT ?2",
        )
        .bind(user)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?)
    }

    // ----- balances -----

    pub async fn upsert_balance(&self, token: &str, user: &str, balance: f64, now: i64) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO balances (token_address, user_address, balance, last_updated)
            VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT (token_address, user_address) DO UPDATE SET
                balance = excluded.balance,
                last_updated = excluded.last_updated
            "#,
        )
        .bind(token)
        .bind(user)
        .bind(balance)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn balance_for(&self, token: &str, user: &str) -> Result<Option<Balance>> {
        Ok(sqlx::query_as::<_, Balance>(
            "SELECT token_address, user_address, balance, last_updated
             FROM balances WHERE token_address = ?1 AND user_address = ?2",
        )
        .bind(token)
        .bind(user)
        .fetch_optional(&self.pool)
        .await?)
    }

    pub async fn all_balances(&self) -> Result<Vec<Balance>> {
        Ok(sqlx::query_as::<_, Balance>(
            "SELECT token_address, user_address, balance, last_updated FROM balances",
        )
        .fetch_all(&self.pool)
        .await?)
    }

    // ----- sync checkpoints -----

    /// Last synced height for `contract`, 0 if it was never synced.
    pub async fn checkpoint(&self, contract: &str) -> Result<u64> {
        let height: Option<i64> = sqlx::query_scalar(
            "SELECT last_synced_block FROM sync_state WHERE contract_address = ?1",
        )
        .bind(contract)
        .fetch_optional(&self.pool)
        .await?;
        Ok(height.map(|h| h.max(0) as u64).unwrap_or(0))
    }

    /// Never moves a checkpoint backwards.
    pub async fn advance_checkpoint(&self, contract: &str, height: u64, now: i64) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO sync_state (contract_address, last_synced_block, updated_at)
            VALUES (?1, ?2, ?3)
            ON CONFLICT (contract_address) DO UPDATE SET
                last_synced_block = MAX(sync_state.last_synced_block, excluded.last_synced_block),
                updated_at = excluded.updated_at
            "#,
        )
        .bind(contract)
        .bind(height as i64)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn checkpoints(&self) -> Result<Vec<CheckpointRow>> {
        Ok(sqlx::query_as::<_, CheckpointRow>(
            "SELECT contract_address, last_synced_block, updated_at
             FROM sync_state ORDER BY contract_address",
        )
        .fetch_all(&self.pool)
        .await?)
    }

    // ----- reporting -----

    pub async fn stats(&self, now: i64) -> Result<SystemStats> {
        Ok(sqlx::query_as::<_, SystemStats>(
            r#"
            SELECT
                (SELECT COUNT(*) FROM prices) AS total_prices,
                (SELECT COUNT(*) FROM anomaly_events) AS total_anomalies,
                (SELECT COUNT(*) FROM policies) AS total_policies,
                (SELECT COUNT(*) FROM policies
                    WHERE status = 'active' AND expiry_time > ?1) AS active_policies,
                (SELECT COUNT(*) FROM payouts) AS total_payouts,
                (SELECT COALESCE(SUM(amount), 0.0) FROM payouts) AS total_paid_out
            "#,
        )
        .bind(now)
        .fetch_one(&self.pool)
        .await?)
    }
}
