//! SQL-backed storage: `api_keys` + `usage_windows`, with optimistic
//! concurrency on `update_usage`.
//!
//! Targets SQLite by default (the `sqlite` feature); the `postgres`
//! feature declares the driver dependency but the query layer below
//! speaks SQLite's `?` placeholder syntax — see `DESIGN.md` for the
//! open question this leaves for a production Postgres deployment.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use gateway_core::{Error, Result};
use sqlx::{Row, SqlitePool};
use tracing::{debug, warn};

use super::CredentialStore;
use crate::record::{CredentialRecord, CredentialStats, UsageWindow};

const MAX_CONCURRENCY_RETRIES: u32 = 3;

/// SQL-backed credential store.
pub struct SqlStore {
    pool: SqlitePool,
}

impl SqlStore {
    /// Connect using `database_url`, configuring WAL-equivalent mode,
    /// foreign-key enforcement, and a 5s busy timeout.
    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = sqlx::sqlite::SqlitePoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await
            .map_err(|e| Error::unavailable(format!("connect sql backend: {e}")))?;

        sqlx::query("PRAGMA journal_mode=WAL")
            .execute(&pool)
            .await
            .map_err(|e| Error::unavailable(format!("set journal_mode: {e}")))?;
        sqlx::query("PRAGMA foreign_keys=ON")
            .execute(&pool)
            .await
            .map_err(|e| Error::unavailable(format!("set foreign_keys: {e}")))?;
        sqlx::query("PRAGMA busy_timeout=5000")
            .execute(&pool)
            .await
            .map_err(|e| Error::unavailable(format!("set busy_timeout: {e}")))?;

        Ok(Self { pool })
    }

    /// Build directly from an existing pool (used by tests).
    #[must_use]
    pub fn from_pool(pool: SqlitePool) -> Self {
        Self { pool }
    }

    async fn load_windows(&self, key: &str) -> Result<Vec<UsageWindow>> {
        let rows = sqlx::query("SELECT window_start, tokens_used FROM usage_windows WHERE api_key = ? ORDER BY window_start ASC")
            .bind(key)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| Error::unavailable(format!("load usage windows: {e}")))?;

        rows.into_iter()
            .map(|row| {
                let window_start: i64 = row.try_get("window_start").map_err(sql_err)?;
                let tokens_used: i64 = row.try_get("tokens_used").map_err(sql_err)?;
                Ok(UsageWindow {
                    window_start: DateTime::from_timestamp_millis(window_start)
                        .unwrap_or_else(Utc::now),
                    tokens_used: tokens_used.max(0) as u64,
                })
            })
            .collect()
    }
}

fn sql_err(e: sqlx::Error) -> Error {
    Error::internal(format!("decode sql row: {e}"))
}

#[async_trait]
impl CredentialStore for SqlStore {
    async fn initialize(&self) -> Result<()> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS api_keys (
                key TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                model TEXT,
                token_limit_per_5h INTEGER NOT NULL,
                expiry_date INTEGER NOT NULL,
                created_at INTEGER NOT NULL,
                last_used INTEGER,
                total_lifetime_tokens INTEGER NOT NULL DEFAULT 0,
                version INTEGER NOT NULL DEFAULT 0
            )",
        )
        .execute(&self.pool)
        .await
        .map_err(|e| Error::unavailable(format!("create api_keys: {e}")))?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS usage_windows (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                api_key TEXT NOT NULL REFERENCES api_keys(key) ON DELETE CASCADE ON UPDATE CASCADE,
                window_start INTEGER NOT NULL,
                tokens_used INTEGER NOT NULL
            )",
        )
        .execute(&self.pool)
        .await
        .map_err(|e| Error::unavailable(format!("create usage_windows: {e}")))?;

        for (name, ddl) in [
            ("idx_api_keys_last_used", "CREATE INDEX IF NOT EXISTS idx_api_keys_last_used ON api_keys(last_used)"),
            ("idx_api_keys_expiry", "CREATE INDEX IF NOT EXISTS idx_api_keys_expiry ON api_keys(expiry_date)"),
            ("idx_usage_windows_api_key", "CREATE INDEX IF NOT EXISTS idx_usage_windows_api_key ON usage_windows(api_key)"),
            ("idx_usage_windows_start", "CREATE INDEX IF NOT EXISTS idx_usage_windows_start ON usage_windows(window_start)"),
        ] {
            sqlx::query(ddl)
                .execute(&self.pool)
                .await
                .map_err(|e| Error::unavailable(format!("create {name}: {e}")))?;
        }

        Ok(())
    }

    async fn find(&self, key: &str) -> Result<Option<CredentialRecord>> {
        let row = sqlx::query(
            "SELECT key, name, model, token_limit_per_5h, expiry_date, created_at, last_used, total_lifetime_tokens
             FROM api_keys WHERE key = ?",
        )
        .bind(key)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| Error::unavailable(format!("find credential: {e}")))?;

        let Some(row) = row else { return Ok(None) };

        let expiry_ms: i64 = row.try_get("expiry_date").map_err(sql_err)?;
        let created_ms: i64 = row.try_get("created_at").map_err(sql_err)?;
        let last_used_ms: Option<i64> = row.try_get("last_used").map_err(sql_err)?;
        let total_lifetime_tokens: i64 = row.try_get("total_lifetime_tokens").map_err(sql_err)?;

        let usage_windows = self.load_windows(key).await?;

        Ok(Some(CredentialRecord {
            key: row.try_get("key").map_err(sql_err)?,
            name: row.try_get("name").map_err(sql_err)?,
            model: row.try_get("model").map_err(sql_err)?,
            token_limit_per_5h: {
                let v: i64 = row.try_get("token_limit_per_5h").map_err(sql_err)?;
                v.max(0) as u64
            },
            expiry: DateTime::from_timestamp_millis(expiry_ms).unwrap_or_else(Utc::now),
            created_at: DateTime::from_timestamp_millis(created_ms).unwrap_or_else(Utc::now),
            last_used: last_used_ms.and_then(DateTime::from_timestamp_millis),
            total_lifetime_tokens: total_lifetime_tokens.max(0) as u64,
            usage_windows,
            rolling_window_cache: None,
            created_by: None,
        }))
    }

    async fn update_usage(
        &self,
        key: &str,
        tokens_used: i64,
        _model: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        for attempt in 0..MAX_CONCURRENCY_RETRIES {
            let mut tx = self
                .pool
                .begin()
                .await
                .map_err(|e| Error::unavailable(format!("begin tx: {e}")))?;

            let version_row = sqlx::query("SELECT version FROM api_keys WHERE key = ?")
                .bind(key)
                .fetch_optional(&mut *tx)
                .await
                .map_err(|e| Error::unavailable(format!("read version: {e}")))?;
            let Some(version_row) = version_row else {
                return Err(Error::internal(format!("unknown credential key {key}")));
            };
            let version: i64 = version_row.try_get("version").map_err(sql_err)?;

            let span_start = (now - chrono::Duration::hours(5)).timestamp_millis();
            sqlx::query("DELETE FROM usage_windows WHERE api_key = ? AND window_start < ?")
                .bind(key)
                .bind(span_start)
                .execute(&mut *tx)
                .await
                .map_err(|e| Error::unavailable(format!("purge windows: {e}")))?;

            let latest = sqlx::query(
                "SELECT id, tokens_used FROM usage_windows WHERE api_key = ? ORDER BY window_start DESC LIMIT 1",
            )
            .bind(key)
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| Error::unavailable(format!("read latest window: {e}")))?;

            match latest {
                Some(row) => {
                    let id: i64 = row.try_get("id").map_err(sql_err)?;
                    let existing: i64 = row.try_get("tokens_used").map_err(sql_err)?;
                    let updated = (existing + tokens_used).max(0);
                    sqlx::query("UPDATE usage_windows SET tokens_used = ? WHERE id = ?")
                        .bind(updated)
                        .bind(id)
                        .execute(&mut *tx)
                        .await
                        .map_err(|e| Error::unavailable(format!("update window: {e}")))?;
                }
                None => {
                    sqlx::query(
                        "INSERT INTO usage_windows (api_key, window_start, tokens_used) VALUES (?, ?, ?)",
                    )
                    .bind(key)
                    .bind(now.timestamp_millis())
                    .bind(tokens_used.max(0))
                    .execute(&mut *tx)
                    .await
                    .map_err(|e| Error::unavailable(format!("insert window: {e}")))?;
                }
            }

            let lifetime_delta = tokens_used.max(0);
            let result = sqlx::query(
                "UPDATE api_keys SET last_used = ?, total_lifetime_tokens = total_lifetime_tokens + ?, version = version + 1
                 WHERE key = ? AND version = ?",
            )
            .bind(now.timestamp_millis())
            .bind(lifetime_delta)
            .bind(key)
            .bind(version)
            .execute(&mut *tx)
            .await
            .map_err(|e| Error::unavailable(format!("update api_keys: {e}")))?;

            if result.rows_affected() == 0 {
                // Lost the optimistic-concurrency race; retry against the
                // current version, up to MAX_CONCURRENCY_RETRIES times.
                tx.rollback()
                    .await
                    .map_err(|e| Error::unavailable(format!("rollback: {e}")))?;
                if attempt + 1 == MAX_CONCURRENCY_RETRIES {
                    warn!(key, attempt, "update_usage exhausted optimistic-concurrency retries");
                    return Err(Error::unavailable(
                        "update_usage conflict: exhausted retries",
                    ));
                }
                debug!(key, attempt, "update_usage lost optimistic-concurrency race; retrying");
                continue;
            }

            tx.commit()
                .await
                .map_err(|e| Error::unavailable(format!("commit: {e}")))?;
            return Ok(());
        }

        Err(Error::unavailable("update_usage conflict: exhausted retries"))
    }

    async fn stats(&self, key: &str) -> Result<Option<CredentialStats>> {
        let Some(record) = self.find(key).await? else {
            return Ok(None);
        };
        let now = gateway_core::now();
        let span = chrono::Duration::hours(5);
        let used: u64 = record
            .usage_windows
            .iter()
            .filter(|w| w.window_start >= now - span)
            .map(|w| w.tokens_used)
            .sum();
        Ok(Some(CredentialStats {
            tokens_used_in_current_window: used,
            remaining_tokens: record.token_limit_per_5h.saturating_sub(used),
            is_expired: record.is_expired(now),
            total_lifetime_tokens: record.total_lifetime_tokens,
        }))
    }
}

/// Admin-surface helper mirroring `store::file::upsert`. Not part of the
/// request path.
pub async fn upsert(store: &SqlStore, record: &CredentialRecord) -> Result<()> {
    sqlx::query(
        "INSERT INTO api_keys (key, name, model, token_limit_per_5h, expiry_date, created_at, last_used, total_lifetime_tokens, version)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, 0)
         ON CONFLICT(key) DO UPDATE SET
            name = excluded.name,
            model = excluded.model,
            token_limit_per_5h = excluded.token_limit_per_5h,
            expiry_date = excluded.expiry_date",
    )
    .bind(&record.key)
    .bind(&record.name)
    .bind(&record.model)
    .bind(record.token_limit_per_5h as i64)
    .bind(record.expiry.timestamp_millis())
    .bind(record.created_at.timestamp_millis())
    .bind(record.last_used.map(|t| t.timestamp_millis()))
    .bind(record.total_lifetime_tokens as i64)
    .execute(&store.pool)
    .await
    .map_err(|e| Error::unavailable(format!("upsert credential: {e}")))?;
    Ok(())
}
