//! Generic consumer pool over one queue.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::Result;
use crate::clients::SampleTracker;
use crate::domain::{StatusUpdate, sample_name};
use crate::queue::{Delivery, QueueHandle, QueueService};

/// Result of handling one work item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Processed and forwarded.
    Done,
    /// Not eligible; acknowledged without touching the sample's state.
    Skipped(String),
    /// Rejected; acknowledged and the sample is marked failed with this reason.
    Failed(String),
}

/// Per-item work of one stage.
#[async_trait]
pub trait StageHandler: Send + Sync {
    fn name(&self) -> &'static str;

    async fn handle(&self, payload: &str) -> Result<Outcome>;

    /// Sample a payload belongs to, used when reporting failures.
    fn sample_id(&self, payload: &str) -> String {
        sample_name(payload)
    }
}

/// Lifecycle of a [`WorkerPool`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PoolState {
    Created = 0,
    Running = 1,
    Draining = 2,
    Stopped = 3,
}

impl PoolState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => PoolState::Created,
            1 => PoolState::Running,
            2 => PoolState::Draining,
            _ => PoolState::Stopped,
        }
    }
}

impl std::fmt::Display for PoolState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PoolState::Created => write!(f, "created"),
            PoolState::Running => write!(f, "running"),
            PoolState::Draining => write!(f, "draining"),
            PoolState::Stopped => write!(f, "stopped"),
        }
    }
}

/// Configuration for a worker pool.
#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    /// Number of concurrent consumer loops.
    pub size: usize,
    /// How long a polled item stays invisible to other consumers.
    pub lease_timeout: Duration,
    /// Pause after an empty poll.
    pub idle_backoff: Duration,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            size: 1,
            lease_timeout: Duration::from_secs(4 * 60 * 60),
            idle_backoff: Duration::from_secs(1),
        }
    }
}

/// A named pool of identical consumer loops over one queue.
///
/// A single bad item never ends a loop: handler errors and panics are caught, the item
/// is acknowledged and its sample marked failed.
pub struct WorkerPool {
    name: String,
    config: WorkerPoolConfig,
    state: Arc<AtomicU8>,
    cancellation_token: CancellationToken,
    tasks: parking_lot::Mutex<Option<JoinSet<()>>>,
}

/// Everything one consumer loop needs.
struct Slot {
    pool: String,
    index: usize,
    queue: Arc<dyn QueueService>,
    handle: QueueHandle,
    handler: Arc<dyn StageHandler>,
    tracker: Arc<dyn SampleTracker>,
    config: WorkerPoolConfig,
    token: CancellationToken,
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "handler panicked".to_string()
    }
}

impl Slot {
    async fn run(self) {
        debug!("{} worker {} started", self.pool, self.index);

        loop {
            if self.token.is_cancelled() {
                debug!("{} worker {} shutting down", self.pool, self.index);
                break;
            }

            // Poll is bounded by the backend's own wait, so it is not raced against
            // cancellation: a lease taken here is always processed.
            let delivery = match self
                .queue
                .poll(&self.handle, self.config.lease_timeout)
                .await
            {
                Ok(Some(delivery)) => delivery,
                Ok(None) => {
                    self.idle().await;
                    continue;
                }
                Err(e) => {
                    error!("{} worker {} failed to poll {}: {}", self.pool, self.index, self.handle, e);
                    self.idle().await;
                    continue;
                }
            };

            self.process(delivery).await;
        }
    }

    async fn idle(&self) {
        tokio::select! {
            _ = self.token.cancelled() => {}
            _ = tokio::time::sleep(self.config.idle_backoff) => {}
        }
    }

    async fn process(&self, delivery: Delivery) {
        let payload = delivery.payload.as_str();
        let sample = self.handler.sample_id(payload);
        info!("{} worker {} processing {}", self.pool, self.index, payload);

        let result = AssertUnwindSafe(self.handler.handle(payload))
            .catch_unwind()
            .await;

        let failure = match result {
            Ok(Ok(Outcome::Done)) => None,
            Ok(Ok(Outcome::Skipped(reason))) => {
                info!("Skipping {}: {}", payload, reason);
                None
            }
            Ok(Ok(Outcome::Failed(reason))) => {
                warn!("{} of {} failed: {}", self.handler.name(), payload, reason);
                Some(reason)
            }
            Ok(Err(e)) => {
                error!(
                    stage = self.handler.name(),
                    sample = %sample,
                    "Error processing {}: {}",
                    payload,
                    e
                );
                Some(e.to_string())
            }
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                error!(
                    stage = self.handler.name(),
                    sample = %sample,
                    "Handler panicked on {}: {}",
                    payload,
                    message
                );
                Some(message)
            }
        };

        if let Err(e) = self.queue.ack(&delivery.token).await {
            error!("Failed to acknowledge {} on {}: {}", payload, self.handle, e);
        }

        if let Some(reason) = failure {
            mark_failed(self.tracker.as_ref(), &sample, reason).await;
        }

        match self.queue.size(&self.handle).await {
            Ok(size) => info!("{} queue size: {}", self.handle, size),
            Err(e) => debug!("Could not read size of {}: {}", self.handle, e),
        }
    }
}

/// Report a state change; tracker errors are logged, never raised.
pub(crate) async fn report_status(tracker: &dyn SampleTracker, update: &StatusUpdate) {
    if let Err(e) = tracker.update(update).await {
        warn!(
            "Tracker can't record '{}' for sample {}: {}",
            update.status, update.sample, e
        );
    }
}

/// Report a failed sample; tracker errors are logged, never raised.
pub(crate) async fn mark_failed(tracker: &dyn SampleTracker, sample: &str, reason: String) {
    warn!("Setting sample {} as failed", sample);
    if let Err(e) = tracker.update(&StatusUpdate::failed(sample, reason)).await {
        error!("Tracker can't record 'failed' for sample {}: {}", sample, e);
    }
}

impl WorkerPool {
    /// Create a pool whose loops stop when `parent` or [`WorkerPool::stop`] cancels.
    pub fn new(name: impl Into<String>, config: WorkerPoolConfig, parent: &CancellationToken) -> Self {
        Self {
            name: name.into(),
            config,
            state: Arc::new(AtomicU8::new(PoolState::Created as u8)),
            cancellation_token: parent.child_token(),
            tasks: parking_lot::Mutex::new(Some(JoinSet::new())),
        }
    }

    /// Launch the consumer loops.
    pub fn start(
        &self,
        queue: Arc<dyn QueueService>,
        handle: QueueHandle,
        handler: Arc<dyn StageHandler>,
        tracker: Arc<dyn SampleTracker>,
    ) {
        if self.state() != PoolState::Created {
            warn!("{} pool already started", self.name);
            return;
        }

        info!(
            "Starting {} worker pool with {} workers on {}",
            self.name, self.config.size, handle
        );

        let mut tasks = self.tasks.lock();
        if let Some(ref mut join_set) = *tasks {
            for index in 0..self.config.size {
                let slot = Slot {
                    pool: self.name.clone(),
                    index,
                    queue: queue.clone(),
                    handle: handle.clone(),
                    handler: handler.clone(),
                    tracker: tracker.clone(),
                    config: self.config.clone(),
                    token: self.cancellation_token.clone(),
                };
                join_set.spawn(slot.run());
            }
        }
        self.state.store(PoolState::Running as u8, Ordering::SeqCst);
    }

    /// Ask every loop to exit after its current item.
    pub fn stop(&self) {
        info!("Stopping {} worker pool", self.name);
        self.cancellation_token.cancel();
        let _ = self.state.compare_exchange(
            PoolState::Running as u8,
            PoolState::Draining as u8,
            Ordering::SeqCst,
            Ordering::SeqCst,
        );
        let _ = self.state.compare_exchange(
            PoolState::Created as u8,
            PoolState::Stopped as u8,
            Ordering::SeqCst,
            Ordering::SeqCst,
        );
    }

    /// Wait up to `timeout` for all loops to exit.
    ///
    /// Returns `false` if the wait timed out. Loops still busy at that point are
    /// detached and finish in the background.
    pub async fn join(&self, timeout: Duration) -> bool {
        let join_set = {
            let mut tasks = self.tasks.lock();
            tasks.take()
        };
        let Some(mut join_set) = join_set else {
            return self.state() == PoolState::Stopped;
        };

        let name = &self.name;
        let drained = tokio::time::timeout(timeout, async {
            while let Some(res) = join_set.join_next().await {
                if let Err(e) = res {
                    warn!("{} worker ended abnormally: {}", name, e);
                }
            }
        })
        .await
        .is_ok();

        if drained {
            self.state.store(PoolState::Stopped as u8, Ordering::SeqCst);
            info!("{} worker pool stopped", self.name);
        } else {
            warn!(
                "{} worker pool did not stop within {:?}; {} workers left running",
                self.name,
                timeout,
                join_set.len()
            );
            join_set.detach_all();
        }
        drained
    }

    pub fn state(&self) -> PoolState {
        let state = PoolState::from_u8(self.state.load(Ordering::SeqCst));
        if state == PoolState::Running && self.cancellation_token.is_cancelled() {
            return PoolState::Draining;
        }
        state
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn size(&self) -> usize {
        self.config.size
    }
}
