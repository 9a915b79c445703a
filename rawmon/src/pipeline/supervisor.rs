//! Wires queues, worker pools and the watcher together and owns shutdown.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::convert::{ConvertSettings, ConvertStage};
use super::schedule::ScheduleStage;
use super::upload::UploadStage;
use super::worker_pool::{StageHandler, WorkerPool, WorkerPoolConfig};
use crate::clients::{Converter, JobStore, MetadataService, SampleTracker, Storage};
use crate::config::AppConfig;
use crate::domain::Stage;
use crate::queue::{QueueHandle, QueueName, QueueService};
use crate::watch::{EventClassifier, EventRouter, FsWatcher, StabilityProbe, WatcherSettings};
use crate::{Error, Result};

/// External systems the stages talk to.
#[derive(Clone)]
pub struct Collaborators {
    pub tracker: Arc<dyn SampleTracker>,
    pub storage: Arc<dyn Storage>,
    pub converter: Arc<dyn Converter>,
    /// Required when scheduling is enabled.
    pub metadata: Option<Arc<dyn MetadataService>>,
    /// Required when scheduling is enabled.
    pub jobs: Option<Arc<dyn JobStore>>,
}

/// Handles of the three stage queues.
#[derive(Debug, Clone)]
pub struct StageQueues {
    pub conversion: QueueHandle,
    pub upload: QueueHandle,
    pub schedule: QueueHandle,
}

impl StageQueues {
    /// Create (or reopen) every stage queue.
    pub async fn ensure(config: &AppConfig, queue: &dyn QueueService) -> Result<Self> {
        let name = |stage| QueueName::new(&config.queue.base_name, &config.environment, stage);
        Ok(Self {
            conversion: queue.ensure_queue(&name(Stage::Conversion)).await?,
            upload: queue.ensure_queue(&name(Stage::Upload)).await?,
            schedule: queue.ensure_queue(&name(Stage::Schedule)).await?,
        })
    }

    pub fn get(&self, stage: Stage) -> &QueueHandle {
        match stage {
            Stage::Conversion => &self.conversion,
            Stage::Upload => &self.upload,
            Stage::Schedule => &self.schedule,
        }
    }
}

/// Owns every worker pool and the watcher.
///
/// Pools observe a child of the supervisor's cancellation token and never reference the
/// supervisor itself.
pub struct PipelineSupervisor {
    queue: Arc<dyn QueueService>,
    queues: StageQueues,
    pools: Vec<WorkerPool>,
    watcher: Option<FsWatcher>,
    cancellation_token: CancellationToken,
    join_timeout: Duration,
}

impl PipelineSupervisor {
    /// Create the queues, start the pools and then the watcher.
    ///
    /// Any queue failure here is returned; the caller is expected to exit.
    pub async fn start(
        config: &AppConfig,
        queue: Arc<dyn QueueService>,
        collaborators: Collaborators,
    ) -> Result<Self> {
        let queues = StageQueues::ensure(config, queue.as_ref()).await?;
        let cancellation_token = CancellationToken::new();

        let mut supervisor = Self {
            queue,
            queues,
            pools: Vec::new(),
            watcher: None,
            cancellation_token,
            join_timeout: Duration::from_secs(config.workers.join_timeout_secs),
        };

        supervisor.start_pools(config, &collaborators)?;
        if let Err(e) = supervisor.start_watcher(config) {
            supervisor.cancellation_token.cancel();
            return Err(e);
        }

        info!(
            "Pipeline running in '{}' environment with {} pools",
            config.environment,
            supervisor.pools.len()
        );
        Ok(supervisor)
    }

    fn pool_config(config: &AppConfig, size: usize) -> WorkerPoolConfig {
        WorkerPoolConfig {
            size,
            lease_timeout: Duration::from_secs(config.queue.lease_timeout_secs),
            idle_backoff: Duration::from_millis(config.queue.idle_backoff_ms),
        }
    }

    fn spawn_pool(
        &mut self,
        stage: Stage,
        config: WorkerPoolConfig,
        handler: Arc<dyn StageHandler>,
        tracker: &Arc<dyn SampleTracker>,
    ) {
        let pool = WorkerPool::new(stage.as_str(), config, &self.cancellation_token);
        pool.start(
            self.queue.clone(),
            self.queues.get(stage).clone(),
            handler,
            tracker.clone(),
        );
        self.pools.push(pool);
    }

    fn start_pools(&mut self, config: &AppConfig, c: &Collaborators) -> Result<()> {
        let schedule_stage = match (config.monitor.schedule, &c.metadata, &c.jobs) {
            (false, _, _) => None,
            (true, Some(metadata), Some(jobs)) => Some(ScheduleStage::new(
                c.tracker.clone(),
                metadata.clone(),
                jobs.clone(),
            )),
            (true, _, _) => {
                return Err(Error::config(
                    "scheduling is enabled but no metadata service or job store was provided",
                ));
            }
        };

        let probe = StabilityProbe::new(config.stability_interval())
            .with_confirmations(config.stability.confirmations)
            .with_max_wait(config.stability.max_wait_secs.map(Duration::from_secs));

        let mut settings = ConvertSettings::new(&config.monitor.storage, probe)
            .with_skip_patterns(&config.monitor.skip)?;
        settings.check_exists = config.monitor.exists;
        settings.freshness_window = config
            .monitor
            .freshness_window_hours
            .and_then(|h| i64::try_from(h).ok())
            .map(chrono::Duration::hours);

        let convert = ConvertStage::new(
            settings,
            c.tracker.clone(),
            c.storage.clone(),
            c.converter.clone(),
            self.queue.clone(),
            self.queues.upload.clone(),
        );
        self.spawn_pool(
            Stage::Conversion,
            Self::pool_config(config, config.workers.conversion),
            Arc::new(convert),
            &c.tracker,
        );

        let schedule_handle = config
            .monitor
            .schedule
            .then(|| self.queues.schedule.clone());
        let upload = UploadStage::new(
            c.storage.clone(),
            c.tracker.clone(),
            self.queue.clone(),
            schedule_handle,
        );
        self.spawn_pool(
            Stage::Upload,
            Self::pool_config(config, config.workers.upload),
            Arc::new(upload),
            &c.tracker,
        );

        if let Some(schedule) = schedule_stage {
            self.spawn_pool(
                Stage::Schedule,
                Self::pool_config(config, config.workers.schedule),
                Arc::new(schedule),
                &c.tracker,
            );
        }
        Ok(())
    }

    fn start_watcher(&mut self, config: &AppConfig) -> Result<()> {
        let classifier =
            EventClassifier::new(&config.monitor.extensions, &config.monitor.sidecar_patterns)?
                .with_roots(config.monitor.paths.iter().cloned());
        let router = EventRouter::new(
            classifier,
            self.queue.clone(),
            self.queues.conversion.clone(),
            self.queues.upload.clone(),
            Duration::from_secs(config.monitor.dedupe_window_secs),
        );
        let settings = WatcherSettings {
            paths: config.monitor.paths.clone(),
            mode: config.monitor.watch_mode,
            poll_interval: Duration::from_secs(config.monitor.watch_poll_secs),
            dedupe_window: Duration::from_secs(config.monitor.dedupe_window_secs),
        };
        let watcher = FsWatcher::start(&settings, router, self.cancellation_token.child_token())?;
        self.watcher = Some(watcher);
        Ok(())
    }

    pub fn queues(&self) -> &StageQueues {
        &self.queues
    }

    pub fn queue_service(&self) -> Arc<dyn QueueService> {
        self.queue.clone()
    }

    pub fn pools(&self) -> &[WorkerPool] {
        &self.pools
    }

    /// Token cancelled once shutdown completes; background helpers can observe it.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancellation_token.clone()
    }

    /// Ordered shutdown: watcher, pools, joins, then in-process queue contents.
    pub async fn shutdown(&mut self) -> Result<()> {
        info!("Shutting down pipeline (join timeout: {:?})", self.join_timeout);

        if let Some(mut watcher) = self.watcher.take() {
            watcher.stop().await;
        }

        for pool in &self.pools {
            pool.stop();
        }

        for pool in &self.pools {
            if !pool.join(self.join_timeout).await {
                warn!("Worker pool {} left running after shutdown timeout", pool.name());
            }
        }

        if !self.queue.is_durable() {
            for stage in Stage::ALL {
                let handle = self.queues.get(stage);
                if let Err(e) = self.queue.purge(handle).await {
                    error!("Failed to clear {}: {}", handle, e);
                }
            }
        }

        self.cancellation_token.cancel();
        info!("Pipeline stopped");
        Ok(())
    }

    /// Run until Ctrl-C (or SIGTERM on unix), then shut down.
    pub async fn run_until_shutdown(mut self) -> Result<()> {
        wait_for_signal().await?;
        self.shutdown().await
    }
}

async fn wait_for_signal() -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        let mut sigterm = signal(SignalKind::terminate())?;
        tokio::select! {
            _ = sigterm.recv() => info!("Received SIGTERM, initiating graceful shutdown"),
            res = tokio::signal::ctrl_c() => {
                res?;
                info!("Received Ctrl+C, initiating graceful shutdown");
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        info!("Received Ctrl+C, initiating graceful shutdown");
    }

    Ok(())
}
