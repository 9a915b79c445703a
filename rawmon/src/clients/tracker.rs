//! HTTP client for the sample tracking service.

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, StatusCode};
use tracing::{debug, warn};
use url::Url;

use super::{JobStore, SampleTracker, base_url, endpoint};
use crate::config::ServiceConfig;
use crate::domain::{AcquisitionData, Job, ScheduleResponse, StatusUpdate};
use crate::utils::http_client::build_client;
use crate::utils::retry::retry_transient;
use crate::{Error, Result};

/// Client for the tracking service, which also stores and schedules jobs.
pub struct StasisClient {
    client: Client,
    base: Url,
    api_key: Option<String>,
    retries: u32,
}

impl StasisClient {
    pub fn new(config: &ServiceConfig) -> Result<Self> {
        Ok(Self {
            client: build_client(config.timeout())?,
            base: base_url(&config.url)?,
            api_key: config.api_key(),
            retries: config.retries,
        })
    }

    fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.api_key {
            Some(key) => request.header("x-api-key", key),
            None => request,
        }
    }

    async fn fetch_acquisition(&self, sample: &str) -> Result<AcquisitionData> {
        let url = endpoint(&self.base, &["acquisition", sample])?;
        let response = self.authorized(self.client.get(url)).send().await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Err(Error::not_found("Acquisition", sample));
        }
        let mut data: AcquisitionData = response.error_for_status()?.json().await?;
        if data.sample.is_empty() {
            data.sample = sample.to_string();
        }
        Ok(data)
    }
}

#[async_trait]
impl SampleTracker for StasisClient {
    async fn update(&self, update: &StatusUpdate) -> Result<()> {
        debug!(
            sample = %update.sample,
            status = %update.status,
            "Updating sample state"
        );
        let url = endpoint(&self.base, &["tracking"])?;
        retry_transient("tracking update", self.retries, || async {
            self.authorized(self.client.post(url.clone()))
                .json(update)
                .send()
                .await?
                .error_for_status()?;
            Ok::<(), Error>(())
        })
        .await
    }

    async fn get_acquisition(&self, sample: &str) -> Result<AcquisitionData> {
        retry_transient("acquisition lookup", self.retries, || {
            self.fetch_acquisition(sample)
        })
        .await
    }

    async fn acquisition_exists(&self, sample: &str) -> Result<bool> {
        match self.get_acquisition(sample).await {
            Ok(_) => Ok(true),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        }
    }
}

#[async_trait]
impl JobStore for StasisClient {
    async fn store_job(&self, job: &Job) -> Result<bool> {
        let url = endpoint(&self.base, &["job", "store"])?;
        retry_transient("job store", self.retries, || async {
            let response = self
                .authorized(self.client.post(url.clone()))
                .json(job)
                .send()
                .await?;
            let status = response.status();
            if status.is_client_error() {
                let body = response.text().await.unwrap_or_default();
                warn!("Job store rejected {}: {} - {}", job.id, status, body);
                return Ok::<bool, Error>(false);
            }
            response.error_for_status()?;
            Ok(true)
        })
        .await
    }

    async fn schedule_job(&self, job_id: &str) -> Result<ScheduleResponse> {
        let url = endpoint(&self.base, &["job", "schedule", job_id])?;
        retry_transient("job schedule", self.retries, || async {
            let response = self
                .authorized(self.client.post(url.clone()))
                .send()
                .await?
                .error_for_status()?;
            Ok::<_, Error>(response.json::<ScheduleResponse>().await?)
        })
        .await
    }
}
