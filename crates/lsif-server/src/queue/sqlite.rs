use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use tracing::info;

use super::{QueueBackend, QueuedJob, duration_ms};
use crate::{LsifError, Result};

const MAX_CONNECTIONS: u32 = 4;
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

fn unavailable(operation: &'static str) -> impl Fn(sqlx::Error) -> LsifError {
    move |e| LsifError::queue_unavailable_with_source(operation, e)
}

/// Queue backend stored in a SQLite file shared by every server process.
#[derive(Debug, Clone)]
pub struct SqliteQueueBackend {
    pool: SqlitePool,
}

impl SqliteQueueBackend {
    /// Opens (creating if needed) the queue database at `url` and applies
    /// pending migrations.
    pub async fn connect(url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(url)
            .map_err(|e| LsifError::configuration_error_with_source("queue_url", e))?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(BUSY_TIMEOUT);

        let pool = SqlitePoolOptions::new()
            .max_connections(MAX_CONNECTIONS)
            .connect_with(options)
            .await
            .map_err(unavailable("connect"))?;

        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(|e| LsifError::queue_unavailable_with_source("migrate", e))?;

        info!(url, "Connected to SQLite queue backend");
        Ok(Self { pool })
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

#[async_trait]
impl QueueBackend for SqliteQueueBackend {
    async fn push(&self, queue: &str, payload: &str, now: DateTime<Utc>) -> Result<i64> {
        let result = sqlx::query("INSERT INTO jobs (queue, payload, enqueued_at) VALUES (?, ?, ?)")
            .bind(queue)
            .bind(payload)
            .bind(now.timestamp_millis())
            .execute(&self.pool)
            .await
            .map_err(unavailable("push"))?;
        Ok(result.last_insert_rowid())
    }

    async fn pop(&self, queue: &str, worker: &str, now: DateTime<Utc>) -> Result<Option<QueuedJob>> {
        let mut tx = self.pool.begin().await.map_err(unavailable("pop"))?;

        sqlx::query(
            "INSERT INTO workers (worker, last_seen) VALUES (?1, ?2) \
             ON CONFLICT(worker) DO UPDATE SET last_seen = excluded.last_seen",
        )
        .bind(worker)
        .bind(now.timestamp_millis())
        .execute(&mut *tx)
        .await
        .map_err(unavailable("pop"))?;

        let row: Option<(i64, String, String)> = sqlx::query_as(
            "UPDATE jobs SET worker = ?1, claimed_at = ?2 \
             WHERE id = (SELECT id FROM jobs WHERE queue = ?3 AND worker IS NULL ORDER BY id LIMIT 1) \
             RETURNING id, queue, payload",
        )
        .bind(worker)
        .bind(now.timestamp_millis())
        .bind(queue)
        .fetch_optional(&mut *tx)
        .await
        .map_err(unavailable("pop"))?;

        tx.commit().await.map_err(unavailable("pop"))?;
        Ok(row.map(|(id, queue, payload)| QueuedJob { id, queue, payload }))
    }

    async fn heartbeat(&self, worker: &str, now: DateTime<Utc>) -> Result<()> {
        sqlx::query(
            "INSERT INTO workers (worker, last_seen) VALUES (?1, ?2) \
             ON CONFLICT(worker) DO UPDATE SET last_seen = excluded.last_seen",
        )
        .bind(worker)
        .bind(now.timestamp_millis())
        .execute(&self.pool)
        .await
        .map_err(unavailable("heartbeat"))?;
        Ok(())
    }

    async fn complete(&self, job_id: i64) -> Result<()> {
        sqlx::query("DELETE FROM jobs WHERE id = ?")
            .bind(job_id)
            .execute(&self.pool)
            .await
            .map_err(unavailable("complete"))?;
        Ok(())
    }

    async fn try_acquire_lease(
        &self,
        name: &str,
        holder: &str,
        now: DateTime<Utc>,
        ttl: Duration,
    ) -> Result<bool> {
        let now_ms = now.timestamp_millis();
        let result = sqlx::query(
            "INSERT INTO leases (name, holder, expires_at) VALUES (?1, ?2, ?3) \
             ON CONFLICT(name) DO UPDATE SET holder = excluded.holder, expires_at = excluded.expires_at \
             WHERE leases.holder = excluded.holder OR leases.expires_at <= ?4",
        )
        .bind(name)
        .bind(holder)
        .bind(now_ms.saturating_add(duration_ms(ttl)))
        .bind(now_ms)
        .execute(&self.pool)
        .await
        .map_err(unavailable("acquire lease"))?;
        Ok(result.rows_affected() == 1)
    }

    async fn release_lease(&self, name: &str, holder: &str) -> Result<()> {
        sqlx::query("DELETE FROM leases WHERE name = ? AND holder = ?")
            .bind(name)
            .bind(holder)
            .execute(&self.pool)
            .await
            .map_err(unavailable("release lease"))?;
        Ok(())
    }

    async fn stale_workers(&self, cutoff: DateTime<Utc>) -> Result<Vec<String>> {
        sqlx::query_scalar("SELECT worker FROM workers WHERE last_seen < ? ORDER BY worker")
            .bind(cutoff.timestamp_millis())
            .fetch_all(&self.pool)
            .await
            .map_err(unavailable("list stale workers"))
    }

    async fn requeue_worker(&self, worker: &str, cutoff: DateTime<Utc>) -> Result<usize> {
        let mut tx = self.pool.begin().await.map_err(unavailable("requeue"))?;

        let forgotten = sqlx::query("DELETE FROM workers WHERE worker = ? AND last_seen < ?")
            .bind(worker)
            .bind(cutoff.timestamp_millis())
            .execute(&mut *tx)
            .await
            .map_err(unavailable("requeue"))?;
        if forgotten.rows_affected() == 0 {
            return Ok(0);
        }

        let requeued = sqlx::query("UPDATE jobs SET worker = NULL, claimed_at = NULL WHERE worker = ?")
            .bind(worker)
            .execute(&mut *tx)
            .await
            .map_err(unavailable("requeue"))?;

        tx.commit().await.map_err(unavailable("requeue"))?;
        Ok(requeued.rows_affected() as usize)
    }

    async fn pending(&self, queue: &str) -> Result<usize> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM jobs WHERE queue = ? AND worker IS NULL")
            .bind(queue)
            .fetch_one(&self.pool)
            .await
            .map_err(unavailable("count pending"))?;
        Ok(count as usize)
    }
}
