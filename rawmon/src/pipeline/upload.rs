//! Upload stage: archive a converted file, verify it, hand the sample to the scheduler.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{info, warn};

use super::worker_pool::{Outcome, StageHandler, report_status};
use crate::clients::{SampleTracker, Storage};
use crate::domain::{SampleStatus, StatusUpdate, file_name, sample_name};
use crate::queue::{QueueHandle, QueueService};
use crate::utils::fs::remove_path;
use crate::watch::CONVERTED_EXTENSION;
use crate::Result;

const UNKNOWN_UPLOAD_FAILURE: &str = "some unknown error happened while uploading the file";

/// Name of the machine the monitor runs on, for tracker reasons.
pub fn host_name() -> String {
    sysinfo::System::host_name().unwrap_or_else(|| "unknown host".to_string())
}

pub struct UploadStage {
    storage: Arc<dyn Storage>,
    tracker: Arc<dyn SampleTracker>,
    queue: Arc<dyn QueueService>,
    /// Set when scheduling is enabled.
    schedule: Option<QueueHandle>,
    host: String,
}

impl UploadStage {
    pub fn new(
        storage: Arc<dyn Storage>,
        tracker: Arc<dyn SampleTracker>,
        queue: Arc<dyn QueueService>,
        schedule: Option<QueueHandle>,
    ) -> Self {
        Self {
            storage,
            tracker,
            queue,
            schedule,
            host: host_name(),
        }
    }

    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    async fn archive(&self, path: &Path, name: &str) -> Result<Outcome> {
        let local_exists = tokio::fs::try_exists(path).await.unwrap_or(false);

        let remote = if local_exists {
            info!("Uploading {} to {}", path.display(), self.storage.location());
            match self.storage.save(path).await? {
                Some(remote) => remote,
                None => return Ok(Outcome::Failed(UNKNOWN_UPLOAD_FAILURE.to_string())),
            }
        } else {
            // A redelivered item whose first run already uploaded and removed the file.
            info!("{} is gone locally, checking {}", path.display(), self.storage.location());
            name.to_string()
        };

        if !self.storage.exists(&remote).await? {
            let reason = if local_exists {
                format!(
                    "After successful upload the file {} was not found in {}",
                    remote,
                    self.storage.location()
                )
            } else {
                format!(
                    "{} no longer exists locally and was never archived",
                    path.display()
                )
            };
            return Ok(Outcome::Failed(reason));
        }
        info!("{} is archived as {}", path.display(), remote);
        Ok(Outcome::Done)
    }
}

#[async_trait]
impl StageHandler for UploadStage {
    fn name(&self) -> &'static str {
        "upload"
    }

    async fn handle(&self, payload: &str) -> Result<Outcome> {
        let path = Path::new(payload);
        let sample = sample_name(payload);

        let result = self.archive(path, file_name(payload)).await;

        if let Err(e) = remove_path(path).await {
            warn!("Could not remove local copy {}: {}", payload, e);
        }

        match result? {
            Outcome::Done => {}
            other => return Ok(other),
        }

        report_status(
            self.tracker.as_ref(),
            &StatusUpdate::new(&sample, SampleStatus::UploadedRaw)
                .with_file_handle(format!("{sample}{CONVERTED_EXTENSION}"))
                .with_reason(format!("File uploaded by Monitor running on {}", self.host)),
        )
        .await;

        if let Some(schedule) = &self.schedule {
            self.queue.enqueue(schedule, &sample).await?;
            info!("Adding {} to schedule queue", sample);
        }
        Ok(Outcome::Done)
    }
}
