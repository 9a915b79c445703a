//! Schedule stage: build a preprocessing job for an uploaded sample and submit it.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info};

use super::worker_pool::{Outcome, StageHandler};
use crate::clients::{JobStore, MetadataService, SampleTracker};
use crate::domain::{Job, ScheduleResponse, latest_version};
use crate::{Result, SchedulingError};

pub struct ScheduleStage {
    tracker: Arc<dyn SampleTracker>,
    metadata: Arc<dyn MetadataService>,
    jobs: Arc<dyn JobStore>,
}

impl ScheduleStage {
    pub fn new(
        tracker: Arc<dyn SampleTracker>,
        metadata: Arc<dyn MetadataService>,
        jobs: Arc<dyn JobStore>,
    ) -> Self {
        Self {
            tracker,
            metadata,
            jobs,
        }
    }

    /// Resolve the sample's method, version and profiles, then store and schedule its job.
    pub async fn schedule_sample(&self, sample: &str) -> Result<ScheduleResponse> {
        let acquisition = self.tracker.get_acquisition(sample).await.map_err(|e| {
            if e.is_not_found() {
                SchedulingError::SampleNotFound(sample.to_string()).into()
            } else {
                e
            }
        })?;

        let method = acquisition.method_key();
        let versions = self.metadata.latest_versions(&method).await?;
        let version = latest_version(&versions);
        debug!("Using version '{}' of method '{}' for {}", version, method, sample);

        let profiles: Vec<String> = self
            .metadata
            .unique_profiles(&method, &version)
            .await?
            .into_iter()
            .map(|p| p.profile)
            .collect();
        if profiles.is_empty() {
            return Err(SchedulingError::NoProfile { method, version }.into());
        }

        let job = Job::for_sample(sample, method, &profiles);
        info!("Submitting job {} with profiles {}", job.id, job.profile);

        if !self.jobs.store_job(&job).await? {
            return Err(SchedulingError::JobDataStore(job.id).into());
        }

        let response = self.jobs.schedule_job(&job.id).await?;
        info!("Scheduled job {} ({})", response.job, response.status);
        Ok(response)
    }
}

#[async_trait]
impl StageHandler for ScheduleStage {
    fn name(&self) -> &'static str {
        "schedule"
    }

    async fn handle(&self, payload: &str) -> Result<Outcome> {
        self.schedule_sample(payload.trim()).await?;
        Ok(Outcome::Done)
    }

    /// Schedule payloads are bare sample ids.
    fn sample_id(&self, payload: &str) -> String {
        payload.trim().to_string()
    }
}
