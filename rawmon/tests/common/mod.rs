//! In-memory stand-ins for the external systems, shared by the integration tests.

#![allow(dead_code)]

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use rawmon::clients::{
    ConversionResult, Converter, JobStore, MetadataService, RemoteObject, SampleTracker, Storage,
};
use rawmon::domain::{
    AcquisitionData, Chromatography, Job, MethodVersion, ProfileEntry, SampleStatus,
    ScheduleResponse, Stage, StatusUpdate, sample_name,
};
use rawmon::queue::{AckToken, Delivery, MemoryQueue, QueueHandle, QueueName, QueueService};
use rawmon::{Error, Result};

/// Tracker that records every update and serves canned acquisitions.
#[derive(Default)]
pub struct RecordingTracker {
    pub updates: Mutex<Vec<StatusUpdate>>,
    pub acquisitions: Mutex<HashMap<String, AcquisitionData>>,
}

impl RecordingTracker {
    pub fn with_acquisition(self, sample: &str, method: &str, instrument: &str) -> Self {
        self.acquisitions.lock().insert(
            sample.to_string(),
            AcquisitionData {
                sample: sample.to_string(),
                chromatography: Chromatography {
                    method: method.to_string(),
                    instrument: instrument.to_string(),
                    column: "test".to_string(),
                    ionisation: "positive".to_string(),
                },
            },
        );
        self
    }

    pub fn updates(&self) -> Vec<StatusUpdate> {
        self.updates.lock().clone()
    }

    pub fn statuses(&self, sample: &str) -> Vec<SampleStatus> {
        self.updates
            .lock()
            .iter()
            .filter(|u| u.sample == sample)
            .map(|u| u.status)
            .collect()
    }

    pub fn failures(&self) -> Vec<StatusUpdate> {
        self.updates
            .lock()
            .iter()
            .filter(|u| u.status == SampleStatus::Failed)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl SampleTracker for RecordingTracker {
    async fn update(&self, update: &StatusUpdate) -> Result<()> {
        self.updates.lock().push(update.clone());
        Ok(())
    }

    async fn get_acquisition(&self, sample: &str) -> Result<AcquisitionData> {
        self.acquisitions
            .lock()
            .get(sample)
            .cloned()
            .ok_or_else(|| Error::not_found("Acquisition", sample))
    }

    async fn acquisition_exists(&self, sample: &str) -> Result<bool> {
        Ok(self.acquisitions.lock().contains_key(sample))
    }
}

/// Method registry keyed by method key and `(method, version)`.
#[derive(Default)]
pub struct FakeMetadata {
    pub versions: Mutex<HashMap<String, Vec<MethodVersion>>>,
    pub profiles: Mutex<HashMap<(String, String), Vec<ProfileEntry>>>,
}

impl FakeMetadata {
    pub fn with_version(self, method: &str, version: &str, updated: DateTime<Utc>) -> Self {
        self.versions
            .lock()
            .entry(method.to_string())
            .or_default()
            .push(MethodVersion {
                version: version.to_string(),
                updated,
            });
        self
    }

    pub fn with_profiles(self, method: &str, version: &str, profiles: &[&str]) -> Self {
        self.profiles.lock().insert(
            (method.to_string(), version.to_string()),
            profiles
                .iter()
                .map(|p| ProfileEntry {
                    profile: p.to_string(),
                })
                .collect(),
        );
        self
    }
}

#[async_trait]
impl MetadataService for FakeMetadata {
    async fn latest_versions(&self, method: &str) -> Result<Vec<MethodVersion>> {
        Ok(self.versions.lock().get(method).cloned().unwrap_or_default())
    }

    async fn unique_profiles(&self, method: &str, version: &str) -> Result<Vec<ProfileEntry>> {
        Ok(self
            .profiles
            .lock()
            .get(&(method.to_string(), version.to_string()))
            .cloned()
            .unwrap_or_default())
    }
}

/// Job store keeping jobs by id, as an upsert.
pub struct FakeJobStore {
    pub jobs: Mutex<HashMap<String, Job>>,
    pub scheduled: Mutex<Vec<String>>,
    pub accept: bool,
}

impl Default for FakeJobStore {
    fn default() -> Self {
        Self {
            jobs: Mutex::new(HashMap::new()),
            scheduled: Mutex::new(Vec::new()),
            accept: true,
        }
    }
}

impl FakeJobStore {
    pub fn rejecting() -> Self {
        Self {
            accept: false,
            ..Self::default()
        }
    }
}

#[async_trait]
impl JobStore for FakeJobStore {
    async fn store_job(&self, job: &Job) -> Result<bool> {
        if !self.accept {
            return Ok(false);
        }
        self.jobs.lock().insert(job.id.clone(), job.clone());
        Ok(true)
    }

    async fn schedule_job(&self, job_id: &str) -> Result<ScheduleResponse> {
        self.scheduled.lock().push(job_id.to_string());
        Ok(ScheduleResponse {
            job: job_id.to_string(),
            status: "scheduled".to_string(),
        })
    }
}

/// Converter that writes `<dest>/<sample>.mzml`, or fails when told to.
#[derive(Default)]
pub struct FakeConverter {
    pub calls: Mutex<Vec<(PathBuf, PathBuf)>>,
    pub fail_with: Option<String>,
}

#[async_trait]
impl Converter for FakeConverter {
    async fn convert(&self, input: &Path, dest_dir: &Path) -> Result<ConversionResult> {
        self.calls
            .lock()
            .push((input.to_path_buf(), dest_dir.to_path_buf()));
        if let Some(reason) = &self.fail_with {
            return Ok(ConversionResult::Failed {
                reason: reason.clone(),
            });
        }
        tokio::fs::create_dir_all(dest_dir).await?;
        let output = dest_dir.join(format!(
            "{}.mzml",
            sample_name(&input.to_string_lossy())
        ));
        tokio::fs::write(&output, b"<mzML/>").await?;
        Ok(ConversionResult::Converted(output))
    }
}

/// Object store held in memory.
#[derive(Default)]
pub struct MemoryStorage {
    pub objects: Mutex<HashMap<String, (Vec<u8>, DateTime<Utc>)>>,
    pub saves: Mutex<usize>,
    /// Accept uploads without keeping them, so verification fails.
    pub lose_uploads: bool,
    /// Report nothing stored.
    pub refuse_uploads: bool,
}

impl MemoryStorage {
    pub fn with_object(self, name: &str, modified: DateTime<Utc>) -> Self {
        self.objects
            .lock()
            .insert(name.to_string(), (b"archived".to_vec(), modified));
        self
    }

    pub fn contains(&self, name: &str) -> bool {
        self.objects.lock().contains_key(name)
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn save(&self, path: &Path) -> Result<Option<String>> {
        *self.saves.lock() += 1;
        if self.refuse_uploads {
            return Ok(None);
        }
        let bytes = tokio::fs::read(path).await?;
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        if !self.lose_uploads {
            self.objects.lock().insert(name.clone(), (bytes, Utc::now()));
        }
        Ok(Some(name))
    }

    async fn exists(&self, name: &str) -> Result<bool> {
        Ok(self.contains(name))
    }

    async fn delete(&self, name: &str) -> Result<()> {
        self.objects.lock().remove(name);
        Ok(())
    }

    async fn stat(&self, name: &str) -> Result<Option<RemoteObject>> {
        Ok(self.objects.lock().get(name).map(|(_, modified)| RemoteObject {
            name: name.to_string(),
            modified: *modified,
        }))
    }

    fn location(&self) -> String {
        "memory".to_string()
    }
}

/// Memory queue with short waits, plus handles for every stage.
pub async fn memory_queues() -> (Arc<MemoryQueue>, HashMap<Stage, QueueHandle>) {
    let queue = Arc::new(MemoryQueue::new(Duration::from_millis(10)));
    let mut handles = HashMap::new();
    for stage in Stage::ALL {
        let handle = queue
            .ensure_queue(&QueueName::new("rawmon", "test", stage))
            .await
            .expect("Failed to create queue");
        handles.insert(stage, handle);
    }
    (queue, handles)
}

/// Take every payload currently visible in `handle`, acknowledging each.
pub async fn drain(queue: &dyn QueueService, handle: &QueueHandle) -> Vec<String> {
    let mut payloads = Vec::new();
    while let Some(delivery) = queue
        .poll(handle, Duration::from_secs(60))
        .await
        .expect("Failed to poll")
    {
        queue.ack(&delivery.token).await.expect("Failed to ack");
        payloads.push(delivery.payload);
    }
    payloads
}

/// Poll `check` until it holds or a few seconds pass.
pub async fn eventually(what: &str, mut check: impl FnMut() -> bool) {
    for _ in 0..500 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("timed out waiting for {what}");
}

/// Queue backend that cannot be reached at all.
pub struct UnreachableQueue;

impl UnreachableQueue {
    fn down<T>() -> Result<T> {
        Err(Error::queue("queue backend is down"))
    }
}

#[async_trait]
impl QueueService for UnreachableQueue {
    async fn ensure_queue(&self, _name: &QueueName) -> Result<QueueHandle> {
        Self::down()
    }

    async fn enqueue(&self, _queue: &QueueHandle, _payload: &str) -> Result<()> {
        Self::down()
    }

    async fn poll(&self, _queue: &QueueHandle, _lease: Duration) -> Result<Option<Delivery>> {
        Self::down()
    }

    async fn ack(&self, _token: &AckToken) -> Result<()> {
        Self::down()
    }

    async fn size(&self, _queue: &QueueHandle) -> Result<usize> {
        Self::down()
    }

    async fn purge(&self, _queue: &QueueHandle) -> Result<()> {
        Self::down()
    }

    fn is_durable(&self) -> bool {
        true
    }
}
