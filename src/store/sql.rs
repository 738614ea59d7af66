//! Relational bucket store for limits shared across processes.
//!
//! Leaky-bucket state lives as one row per tag:
//!
//! ```sql
//! CREATE TABLE IF NOT EXISTS <table> (
//!     tag     varchar(128) NOT NULL PRIMARY KEY,
//!     touched bigint       NOT NULL,  -- microseconds since the Unix epoch
//!     tokens  real         NOT NULL
//! );
//! CREATE INDEX IF NOT EXISTS <table>_tag_idx ON <table> (tag);
//! ```
//!
//! Every take runs in its own transaction: read the row, fold the elapsed
//! time into the balance, then update or roll back. A rejection always rolls
//! back, so it never consumes tokens and leaves the table byte-identical.
//! Storage stays bounded at one row per live tag; the janitor deletes rows
//! whose `touched` is older than one rate interval.

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::{BuildError, LimiterError};
use crate::limiter::{Decision, Limiter};
use crate::rate::Rate;
use crate::store::{validate_burst, validate_cleanup_interval, validate_table, DEFAULT_CLEANUP_INTERVAL};

/// Default table name when none is configured.
const DEFAULT_TABLE: &str = "rate_limit_buckets";

/// Open a SQLite pool suitable for a [`SqlStore`].
///
/// The database file is created if missing and put in WAL mode. The pool is
/// capped at a single connection so that take transactions serialize instead
/// of tripping over SQLite's writer lock; callers that build their own pool
/// own that trade-off.
pub async fn sqlite_pool(url: &str) -> Result<SqlitePool, sqlx::Error> {
    let options: SqliteConnectOptions = url
        .parse::<SqliteConnectOptions>()?
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal);
    SqlitePoolOptions::new().max_connections(1).connect_with(options).await
}

/// Open a SQLite pool from the `DATABASE_URL` environment variable.
pub async fn sqlite_pool_from_env() -> Result<SqlitePool, sqlx::Error> {
    let url = std::env::var("DATABASE_URL")
        .map_err(|_| sqlx::Error::Configuration("DATABASE_URL is not set".into()))?;
    sqlite_pool(&url).await
}

/// A tag-keyed bucket store persisted in a relational table.
///
/// Construction creates the table if absent and spawns a janitor task that
/// deletes idle rows; the task stops when the store is dropped or the
/// configured cleanup signal fires. Janitor failures are logged, never
/// fatal.
#[derive(Debug)]
pub struct SqlStore {
    rate: Rate,
    burst: f64,
    pool: SqlitePool,
    select_sql: String,
    insert_sql: String,
    update_sql: String,
    purge_sql: String,
    janitor: JoinHandle<()>,
}

impl SqlStore {
    /// Start configuring a store for `rate` over `pool`.
    pub fn builder(rate: Rate, pool: SqlitePool) -> SqlStoreBuilder {
        SqlStoreBuilder {
            rate,
            pool,
            table: DEFAULT_TABLE.to_string(),
            burst: None,
            cleanup_interval: DEFAULT_CLEANUP_INTERVAL,
            cleanup_signal: None,
        }
    }

    /// Delete every row left untouched for at least one rate interval before
    /// `now_micros`. Returns the number of rows removed.
    pub async fn purge(&self, now_micros: i64) -> Result<u64, LimiterError> {
        let horizon = now_micros - interval_micros(&self.rate);
        let result = sqlx::query(&self.purge_sql).bind(horizon).execute(&self.pool).await?;
        let evicted = result.rows_affected();
        if evicted > 0 {
            debug!(evicted, "deleted idle rate limiter rows");
        }
        Ok(evicted)
    }
}

#[async_trait]
impl Limiter for SqlStore {
    fn rate(&self) -> &Rate {
        &self.rate
    }

    async fn take(&self, tag: &str, tokens: f64) -> Result<Decision, LimiterError> {
        let mut tx = self.pool.begin().await?;
        let now = Utc::now().timestamp_micros();

        let row: Option<(i64, f64)> =
            sqlx::query_as(&self.select_sql).bind(tag).fetch_optional(&mut *tx).await?;

        let Some((touched, stored)) = row else {
            // First sighting of this tag: a full bucket minus the request.
            if tokens > self.burst {
                return Ok(Decision::Denied { remaining: self.burst });
            }
            let remaining = self.burst - tokens;
            sqlx::query(&self.insert_sql)
                .bind(tag)
                .bind(now)
                .bind(remaining)
                .execute(&mut *tx)
                .await?;
            tx.commit().await?;
            return Ok(Decision::Allowed { remaining });
        };

        let refreshed = refreshed_balance(&self.rate, self.burst, stored, touched, now);
        if refreshed < tokens {
            tx.rollback().await?;
            return Ok(Decision::Denied { remaining: refreshed });
        }
        let remaining = refreshed - tokens;
        sqlx::query(&self.update_sql)
            .bind(now)
            .bind(remaining)
            .bind(tag)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(Decision::Allowed { remaining })
    }

    async fn remaining(&self, tag: &str) -> Result<f64, LimiterError> {
        let row: Option<(i64, f64)> =
            sqlx::query_as(&self.select_sql).bind(tag).fetch_optional(&self.pool).await?;
        Ok(match row {
            None => self.burst,
            Some((touched, stored)) => {
                refreshed_balance(&self.rate, self.burst, stored, touched, Utc::now().timestamp_micros())
            }
        })
    }
}

impl Drop for SqlStore {
    fn drop(&mut self) {
        self.janitor.abort();
    }
}

fn interval_micros(rate: &Rate) -> i64 {
    i64::try_from(rate.interval().as_micros()).unwrap_or(i64::MAX)
}

/// The balance a row holds once elapsed time is folded in, clamped to burst.
/// A `touched` in the future counts as zero elapsed time.
fn refreshed_balance(rate: &Rate, burst: f64, stored: f64, touched: i64, now: i64) -> f64 {
    let elapsed = (now - touched).max(0) as f64;
    (stored + elapsed * rate.per_microsecond()).min(burst)
}

/// Configures and spawns a [`SqlStore`].
pub struct SqlStoreBuilder {
    rate: Rate,
    pool: SqlitePool,
    table: String,
    burst: Option<f64>,
    cleanup_interval: Duration,
    cleanup_signal: Option<watch::Receiver<bool>>,
}

impl SqlStoreBuilder {
    /// Use `table` instead of the default; must match `^\w+$`.
    pub fn table(mut self, table: impl Into<String>) -> Self {
        self.table = table.into();
        self
    }

    /// Override the bucket depth; defaults to the rate's token budget.
    pub fn burst(mut self, burst: f64) -> Self {
        self.burst = Some(burst);
        self
    }

    /// How often the janitor deletes idle rows. Accepts `[1s, 1h]`.
    pub fn cleanup_interval(mut self, every: Duration) -> Self {
        self.cleanup_interval = every;
        self
    }

    /// Stop the janitor when `true` is published or the sender is dropped.
    pub fn cleanup_signal(mut self, signal: watch::Receiver<bool>) -> Self {
        self.cleanup_signal = Some(signal);
        self
    }

    /// Validate the configuration, create the table if absent, and spawn the
    /// store and its janitor.
    ///
    /// # Errors
    /// Returns a [`BuildError`] for violated bounds or a failed schema
    /// creation.
    pub async fn build(self) -> Result<SqlStore, BuildError> {
        validate_table(&self.table)?;
        if let Some(burst) = self.burst {
            validate_burst(burst)?;
        }
        validate_cleanup_interval(self.cleanup_interval)?;

        sqlx::query(&format!(
            "CREATE TABLE IF NOT EXISTS {} (
                tag     varchar(128) NOT NULL PRIMARY KEY,
                touched bigint       NOT NULL,
                tokens  real         NOT NULL
            )",
            self.table
        ))
        .execute(&self.pool)
        .await
        .map_err(|e| BuildError::Schema(e.to_string()))?;

        // Postgres index naming convention: {tablename}_{columnname}_{suffix}.
        sqlx::query(&format!(
            "CREATE INDEX IF NOT EXISTS {0}_tag_idx ON {0} (tag)",
            self.table
        ))
        .execute(&self.pool)
        .await
        .map_err(|e| BuildError::Schema(e.to_string()))?;

        let burst = self.burst.unwrap_or_else(|| self.rate.burst());
        let purge_sql = format!("DELETE FROM {} WHERE touched < $1", self.table);
        let janitor = spawn_janitor(
            self.pool.clone(),
            purge_sql.clone(),
            self.rate,
            self.cleanup_interval,
            self.cleanup_signal,
        );
        Ok(SqlStore {
            rate: self.rate,
            burst,
            select_sql: format!("SELECT touched, tokens FROM {} WHERE tag = $1", self.table),
            insert_sql: format!(
                "INSERT INTO {} (tag, touched, tokens) VALUES ($1, $2, $3)",
                self.table
            ),
            update_sql: format!("UPDATE {} SET touched = $1, tokens = $2 WHERE tag = $3", self.table),
            purge_sql,
            pool: self.pool,
            janitor,
        })
    }
}

fn spawn_janitor(
    pool: SqlitePool,
    purge_sql: String,
    rate: Rate,
    every: Duration,
    mut signal: Option<watch::Receiver<bool>>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.tick().await; // the zeroth tick fires immediately
        loop {
            if let Some(stop) = signal.as_mut() {
                tokio::select! {
                    _ = ticker.tick() => {}
                    changed = stop.changed() => {
                        if changed.is_err() || *stop.borrow() {
                            return;
                        }
                        continue;
                    }
                }
            } else {
                ticker.tick().await;
            }
            let horizon = Utc::now().timestamp_micros() - interval_micros(&rate);
            if let Err(e) = sqlx::query(&purge_sql).bind(horizon).execute(&pool).await {
                warn!(error = %e, "could not delete idle rate limiter rows");
            }
        }
    })
}
