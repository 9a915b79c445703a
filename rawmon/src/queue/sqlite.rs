//! SQLite-backed durable queue.
//!
//! Messages live in one table keyed by queue name. A lease moves `visible_at` into the
//! future and stamps a fresh `lease_id`; acknowledging deletes the row.

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::{Pool, Row, Sqlite};
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, info};

use super::{AckToken, Delivery, QueueHandle, QueueName, QueueService, deadline_after};
use crate::Result;

const BUSY_TIMEOUT_MS: u64 = 5000;
/// Upper bound between looks at the table while waiting; other processes may enqueue
/// without waking us.
const RECHECK_INTERVAL: Duration = Duration::from_millis(100);

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS queues (
        name TEXT PRIMARY KEY NOT NULL,
        created_at INTEGER NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS queue_messages (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        queue TEXT NOT NULL,
        payload TEXT NOT NULL,
        enqueued_at INTEGER NOT NULL,
        visible_at INTEGER NOT NULL,
        lease_id TEXT
    )",
    "CREATE INDEX IF NOT EXISTS idx_queue_messages_visible
        ON queue_messages (queue, visible_at, id)",
];

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// Durable queue backend over a single SQLite database file.
pub struct SqliteQueue {
    pool: Pool<Sqlite>,
    notify: Arc<Notify>,
    poll_wait: Duration,
}

impl SqliteQueue {
    /// Connect (creating the database if missing) and apply the schema.
    pub async fn connect(database_url: &str, poll_wait: Duration) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(database_url)?
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(Duration::from_millis(BUSY_TIMEOUT_MS))
            .create_if_missing(true);

        // Every statement is tiny; a single connection keeps lease claims serialized.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .acquire_timeout(Duration::from_secs(30))
            .connect_with(options)
            .await?;

        for statement in SCHEMA {
            sqlx::query(statement).execute(&pool).await?;
        }

        info!("Queue database ready at {}", database_url);

        Ok(Self {
            pool,
            notify: Arc::new(Notify::new()),
            poll_wait,
        })
    }

    async fn try_lease(&self, queue: &QueueHandle, lease: Duration) -> Result<Option<Delivery>> {
        let now = now_ms();
        let lease_ms = i64::try_from(lease.as_millis()).unwrap_or(i64::MAX);
        let lease_id = uuid::Uuid::new_v4();

        let row = sqlx::query(
            "UPDATE queue_messages
                SET visible_at = ?, lease_id = ?
              WHERE id = (
                    SELECT id FROM queue_messages
                     WHERE queue = ? AND visible_at <= ?
                     ORDER BY id
                     LIMIT 1)
          RETURNING id, payload",
        )
        .bind(now.saturating_add(lease_ms))
        .bind(lease_id.to_string())
        .bind(queue.name())
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|row| Delivery {
            payload: row.get::<String, _>("payload"),
            token: AckToken {
                queue: queue.name().to_string(),
                message_id: row.get::<i64, _>("id"),
                lease_id,
            },
        }))
    }
}

#[async_trait]
impl QueueService for SqliteQueue {
    async fn ensure_queue(&self, name: &QueueName) -> Result<QueueHandle> {
        let key = name.to_string();
        sqlx::query("INSERT OR IGNORE INTO queues (name, created_at) VALUES (?, ?)")
            .bind(&key)
            .bind(now_ms())
            .execute(&self.pool)
            .await?;
        Ok(QueueHandle::new(key))
    }

    async fn enqueue(&self, queue: &QueueHandle, payload: &str) -> Result<()> {
        let now = now_ms();
        sqlx::query(
            "INSERT INTO queue_messages (queue, payload, enqueued_at, visible_at)
             VALUES (?, ?, ?, ?)",
        )
        .bind(queue.name())
        .bind(payload)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;
        self.notify.notify_one();
        Ok(())
    }

    async fn poll(&self, queue: &QueueHandle, lease: Duration) -> Result<Option<Delivery>> {
        let deadline = deadline_after(Instant::now(), self.poll_wait);
        loop {
            if let Some(delivery) = self.try_lease(queue, lease).await? {
                return Ok(Some(delivery));
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            let wait = (deadline - now).min(RECHECK_INTERVAL);
            let _ = tokio::time::timeout(wait, self.notify.notified()).await;
        }
    }

    async fn ack(&self, token: &AckToken) -> Result<()> {
        let result = sqlx::query("DELETE FROM queue_messages WHERE id = ? AND queue = ?")
            .bind(token.message_id)
            .bind(&token.queue)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            debug!(
                message_id = token.message_id,
                lease_id = %token.lease_id,
                "Acknowledged message was already removed"
            );
        }
        Ok(())
    }

    async fn size(&self, queue: &QueueHandle) -> Result<usize> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM queue_messages WHERE queue = ?")
            .bind(queue.name())
            .fetch_one(&self.pool)
            .await?;
        Ok(usize::try_from(count).unwrap_or(0))
    }

    async fn purge(&self, queue: &QueueHandle) -> Result<()> {
        sqlx::query("DELETE FROM queue_messages WHERE queue = ?")
            .bind(queue.name())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    fn is_durable(&self) -> bool {
        true
    }
}
