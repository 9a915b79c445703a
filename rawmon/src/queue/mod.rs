//! Named work queues with lease semantics.
//!
//! Every stage reads from and writes to a [`QueueService`]. The backend is chosen by
//! configuration: [`MemoryQueue`] keeps everything in process and is cleared on shutdown,
//! [`SqliteQueue`] persists messages across restarts.
//!
//! Delivery is at-least-once. A polled message is leased to the caller; it disappears
//! for good once acknowledged and becomes visible again if the lease runs out first.

mod memory;
mod sqlite;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::Result;
use crate::config::{QueueBackend, QueueConfig};
use crate::domain::Stage;

pub use memory::MemoryQueue;
pub use sqlite::SqliteQueue;

/// Identity of a queue: `(base name, environment, stage)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct QueueName {
    pub base: String,
    pub environment: String,
    pub stage: Stage,
}

impl QueueName {
    pub fn new(base: impl Into<String>, environment: impl Into<String>, stage: Stage) -> Self {
        Self {
            base: base.into(),
            environment: environment.into(),
            stage,
        }
    }
}

impl std::fmt::Display for QueueName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-{}-{}", self.base, self.stage, self.environment)
    }
}

/// Resolved reference to an existing queue.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct QueueHandle {
    name: String,
}

impl QueueHandle {
    pub(crate) fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl std::fmt::Display for QueueHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.name)
    }
}

/// Proof of a lease, handed back to [`QueueService::ack`].
///
/// Acknowledging removes the message even if its lease already expired: the work was
/// done, and redelivering it would only repeat it. The lease id identifies which
/// delivery is being acknowledged in logs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AckToken {
    pub(crate) queue: String,
    pub(crate) message_id: i64,
    pub(crate) lease_id: uuid::Uuid,
}

/// A leased message.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub payload: String,
    pub token: AckToken,
}

#[async_trait]
pub trait QueueService: Send + Sync {
    /// Create the queue if needed. Calling it for an existing queue is not an error.
    async fn ensure_queue(&self, name: &QueueName) -> Result<QueueHandle>;

    async fn enqueue(&self, queue: &QueueHandle, payload: &str) -> Result<()>;

    /// Lease the next visible message, waiting briefly when the queue is empty.
    ///
    /// Returns `None` if nothing became available within the backend's poll wait.
    async fn poll(&self, queue: &QueueHandle, lease: Duration) -> Result<Option<Delivery>>;

    /// Remove a leased message permanently.
    async fn ack(&self, token: &AckToken) -> Result<()>;

    /// Approximate number of messages not yet acknowledged.
    async fn size(&self, queue: &QueueHandle) -> Result<usize>;

    /// Drop every message in the queue, leased or not.
    async fn purge(&self, queue: &QueueHandle) -> Result<()>;

    /// Whether contents outlive the process.
    fn is_durable(&self) -> bool;
}

/// About thirty years; stands in for "never" when a deadline would overflow.
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

/// `now + wait`, clamped to a far-future instant instead of overflowing.
pub(crate) fn deadline_after(now: Instant, wait: Duration) -> Instant {
    now.checked_add(wait)
        .or_else(|| now.checked_add(FAR_FUTURE))
        .unwrap_or(now)
}

/// Open the backend selected in `config`.
///
/// Failing to reach a durable backend is returned as an error; callers treat it as fatal.
pub async fn open_queue_service(config: &QueueConfig) -> Result<Arc<dyn QueueService>> {
    let poll_wait = Duration::from_millis(config.poll_wait_ms);
    let service: Arc<dyn QueueService> = match config.backend {
        QueueBackend::Memory => Arc::new(MemoryQueue::new(poll_wait)),
        QueueBackend::Sqlite => {
            Arc::new(SqliteQueue::connect(&config.database_url, poll_wait).await?)
        }
    };
    Ok(service)
}
