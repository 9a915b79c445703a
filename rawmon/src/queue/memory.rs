//! In-process queue backend.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::debug;

use super::{AckToken, Delivery, QueueHandle, QueueName, QueueService, deadline_after};
use crate::{Error, Result};

struct Lease {
    payload: String,
    lease_id: uuid::Uuid,
    expires_at: Instant,
}

#[derive(Default)]
struct Inner {
    next_id: i64,
    ready: VecDeque<(i64, String)>,
    leased: HashMap<i64, Lease>,
}

impl Inner {
    /// Move expired leases back to the front of the ready list, oldest first.
    fn reclaim_expired(&mut self, now: Instant) {
        let mut expired: Vec<i64> = self
            .leased
            .iter()
            .filter(|(_, lease)| lease.expires_at <= now)
            .map(|(id, _)| *id)
            .collect();
        if expired.is_empty() {
            return;
        }
        expired.sort_unstable_by(|a, b| b.cmp(a));
        for id in expired {
            if let Some(lease) = self.leased.remove(&id) {
                debug!(message_id = id, "Lease expired, message visible again");
                self.ready.push_front((id, lease.payload));
            }
        }
    }
}

#[derive(Default)]
struct QueueState {
    inner: Mutex<Inner>,
    notify: Notify,
}

/// Queue backend held entirely in memory.
///
/// Safe to share between any number of producers and consumers; contents are lost when
/// the process exits.
pub struct MemoryQueue {
    queues: DashMap<String, Arc<QueueState>>,
    poll_wait: Duration,
}

impl MemoryQueue {
    pub fn new(poll_wait: Duration) -> Self {
        Self {
            queues: DashMap::new(),
            poll_wait,
        }
    }

    fn state(&self, name: &str) -> Result<Arc<QueueState>> {
        self.queues
            .get(name)
            .map(|s| Arc::clone(s.value()))
            .ok_or_else(|| Error::queue(format!("queue {name} does not exist")))
    }

    fn try_lease(state: &QueueState, queue: &str, lease: Duration) -> Option<Delivery> {
        let now = Instant::now();
        let mut inner = state.inner.lock();
        inner.reclaim_expired(now);
        let (message_id, payload) = inner.ready.pop_front()?;
        let lease_id = uuid::Uuid::new_v4();
        inner.leased.insert(
            message_id,
            Lease {
                payload: payload.clone(),
                lease_id,
                expires_at: deadline_after(now, lease),
            },
        );
        Some(Delivery {
            payload,
            token: AckToken {
                queue: queue.to_string(),
                message_id,
                lease_id,
            },
        })
    }
}

impl Default for MemoryQueue {
    fn default() -> Self {
        Self::new(Duration::from_millis(500))
    }
}

#[async_trait]
impl QueueService for MemoryQueue {
    async fn ensure_queue(&self, name: &QueueName) -> Result<QueueHandle> {
        let key = name.to_string();
        self.queues.entry(key.clone()).or_default();
        Ok(QueueHandle::new(key))
    }

    async fn enqueue(&self, queue: &QueueHandle, payload: &str) -> Result<()> {
        let state = self.state(queue.name())?;
        {
            let mut inner = state.inner.lock();
            inner.next_id += 1;
            let id = inner.next_id;
            inner.ready.push_back((id, payload.to_string()));
        }
        state.notify.notify_one();
        Ok(())
    }

    async fn poll(&self, queue: &QueueHandle, lease: Duration) -> Result<Option<Delivery>> {
        let state = self.state(queue.name())?;
        let deadline = deadline_after(Instant::now(), self.poll_wait);
        loop {
            if let Some(delivery) = Self::try_lease(&state, queue.name(), lease) {
                return Ok(Some(delivery));
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            // Timing out just means another look at the ready list before giving up.
            let _ = tokio::time::timeout(deadline - now, state.notify.notified()).await;
        }
    }

    async fn ack(&self, token: &AckToken) -> Result<()> {
        let state = self.state(&token.queue)?;
        let mut inner = state.inner.lock();
        match inner.leased.remove(&token.message_id) {
            Some(lease) if lease.lease_id != token.lease_id => {
                debug!(
                    message_id = token.message_id,
                    lease_id = %token.lease_id,
                    "Acknowledging message redelivered under another lease"
                );
            }
            Some(_) => {}
            None => inner.ready.retain(|(id, _)| *id != token.message_id),
        }
        Ok(())
    }

    async fn size(&self, queue: &QueueHandle) -> Result<usize> {
        let state = self.state(queue.name())?;
        let inner = state.inner.lock();
        Ok(inner.ready.len() + inner.leased.len())
    }

    async fn purge(&self, queue: &QueueHandle) -> Result<()> {
        let state = self.state(queue.name())?;
        let mut inner = state.inner.lock();
        inner.ready.clear();
        inner.leased.clear();
        Ok(())
    }

    fn is_durable(&self) -> bool {
        false
    }
}
