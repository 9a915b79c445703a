//! Interfaces to the systems the pipeline drives, and their concrete clients.
//!
//! Stage workers only see the traits; `main` picks the implementations.

mod converter;
mod metadata;
mod storage;
mod tracker;

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use url::Url;

use crate::{Error, Result};
use crate::domain::{
    AcquisitionData, Job, MethodVersion, ProfileEntry, ScheduleResponse, StatusUpdate,
};

pub use converter::{MsConvert, parse_output_file};
pub use metadata::CisClient;
pub use storage::{LocalStorage, RcloneStorage};
pub use tracker::StasisClient;

/// External record of each sample's progress.
#[async_trait]
pub trait SampleTracker: Send + Sync {
    async fn update(&self, update: &StatusUpdate) -> Result<()>;

    /// Acquisition metadata; [`crate::Error::NotFound`] when the tracker has no record.
    async fn get_acquisition(&self, sample: &str) -> Result<AcquisitionData>;

    async fn acquisition_exists(&self, sample: &str) -> Result<bool>;
}

/// Persistent job storage and the scheduler behind it.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Upsert a job by id. `false` means the store refused it.
    async fn store_job(&self, job: &Job) -> Result<bool>;

    async fn schedule_job(&self, job_id: &str) -> Result<ScheduleResponse>;
}

/// Method and profile registry.
#[async_trait]
pub trait MetadataService: Send + Sync {
    async fn latest_versions(&self, method: &str) -> Result<Vec<MethodVersion>>;

    async fn unique_profiles(&self, method: &str, version: &str) -> Result<Vec<ProfileEntry>>;
}

/// Metadata of an archived object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteObject {
    pub name: String,
    pub modified: DateTime<Utc>,
}

/// Archive for converted files.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Upload a local file. Returns the remote name, or `None` if nothing was stored.
    async fn save(&self, path: &Path) -> Result<Option<String>>;

    async fn exists(&self, name: &str) -> Result<bool>;

    async fn delete(&self, name: &str) -> Result<()>;

    async fn stat(&self, name: &str) -> Result<Option<RemoteObject>>;

    /// Human-readable location, for logs.
    fn location(&self) -> String;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConversionResult {
    Converted(PathBuf),
    Failed { reason: String },
}

/// Raw-to-mzML conversion tool.
#[async_trait]
pub trait Converter: Send + Sync {
    /// Convert `input`, writing into `dest_dir`.
    async fn convert(&self, input: &Path, dest_dir: &Path) -> Result<ConversionResult>;
}

/// Parse a service base URL.
pub(crate) fn base_url(raw: &str) -> Result<Url> {
    Url::parse(raw.trim_end_matches('/'))
        .map_err(|e| Error::config(format!("invalid service URL '{raw}': {e}")))
}

/// Append percent-encoded path segments to a base URL.
pub(crate) fn endpoint(base: &Url, segments: &[&str]) -> Result<Url> {
    let mut url = base.clone();
    url.path_segments_mut()
        .map_err(|_| Error::config(format!("service URL {base} cannot take a path")))?
        .pop_if_empty()
        .extend(segments);
    Ok(url)
}
