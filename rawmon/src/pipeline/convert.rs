//! Conversion stage: wait for a raw acquisition to settle, convert it, pass it on.

use std::path::{Path, PathBuf};
use std::sync::{Arc, LazyLock};

use async_trait::async_trait;
use chrono::Utc;
use regex::Regex;
use tracing::{debug, info, warn};

use super::worker_pool::{Outcome, StageHandler, report_status};
use crate::clients::{ConversionResult, Converter, SampleTracker, Storage};
use crate::domain::sample::dotted_extension;
use crate::domain::{SampleStatus, StatusUpdate, file_name, sample_name};
use crate::queue::{QueueHandle, QueueService};
use crate::watch::{CONVERTED_EXTENSION, StabilityProbe};
use crate::{Error, Result};

/// Output folder used when a file name carries no project id.
pub const FALLBACK_FOLDER: &str = "autoconv";

static PROJECT_ID: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^(mx\d{6,7})_|_(mx\d{6,7})_").unwrap());

/// Conversion output folder for a raw file: `<root>/<project id>` or `<root>/autoconv`.
pub fn destination_for(root: &Path, name: &str) -> PathBuf {
    let project = PROJECT_ID
        .captures(name)
        .and_then(|c| c.get(1).or_else(|| c.get(2)))
        .map(|m| m.as_str().to_ascii_lowercase());
    match project {
        Some(id) => root.join(id),
        None => root.join(FALLBACK_FOLDER),
    }
}

/// Settings of the conversion stage.
#[derive(Debug, Clone)]
pub struct ConvertSettings {
    /// Paths matching any of these are acknowledged and left alone.
    pub skip: Vec<Regex>,
    pub check_exists: bool,
    pub freshness_window: Option<chrono::Duration>,
    pub storage_root: PathBuf,
    pub probe: StabilityProbe,
}

impl ConvertSettings {
    pub fn new(storage_root: impl Into<PathBuf>, probe: StabilityProbe) -> Self {
        Self {
            skip: Vec::new(),
            check_exists: false,
            freshness_window: None,
            storage_root: storage_root.into(),
            probe,
        }
    }

    /// Compile skip patterns.
    pub fn with_skip_patterns<S: AsRef<str>>(mut self, patterns: &[S]) -> Result<Self> {
        self.skip = patterns
            .iter()
            .map(|p| {
                Regex::new(p.as_ref()).map_err(|e| {
                    Error::config(format!("invalid skip pattern '{}': {e}", p.as_ref()))
                })
            })
            .collect::<Result<_>>()?;
        Ok(self)
    }
}

pub struct ConvertStage {
    settings: ConvertSettings,
    tracker: Arc<dyn SampleTracker>,
    storage: Arc<dyn Storage>,
    converter: Arc<dyn Converter>,
    queue: Arc<dyn QueueService>,
    upload: QueueHandle,
}

impl ConvertStage {
    pub fn new(
        settings: ConvertSettings,
        tracker: Arc<dyn SampleTracker>,
        storage: Arc<dyn Storage>,
        converter: Arc<dyn Converter>,
        queue: Arc<dyn QueueService>,
        upload: QueueHandle,
    ) -> Self {
        Self {
            settings,
            tracker,
            storage,
            converter,
            queue,
            upload,
        }
    }

    fn skip_reason(&self, payload: &str) -> Option<String> {
        self.settings
            .skip
            .iter()
            .find(|re| re.is_match(payload))
            .map(|re| format!("matches skip pattern {}", re.as_str()))
    }

    /// `true` when the tracker has a record of the sample. Lookup errors do not block.
    async fn known_to_tracker(&self, sample: &str) -> bool {
        match self.tracker.acquisition_exists(sample).await {
            Ok(known) => known,
            Err(e) => {
                warn!("Existence check for {} failed, converting anyway: {}", sample, e);
                true
            }
        }
    }

    /// `true` when storage already holds a converted copy younger than the window.
    async fn recently_archived(&self, sample: &str, window: chrono::Duration) -> bool {
        let name = format!("{sample}{CONVERTED_EXTENSION}");
        match self.storage.stat(&name).await {
            Ok(Some(object)) => Utc::now() - object.modified < window,
            Ok(None) => false,
            Err(e) => {
                warn!("Freshness check for {} failed: {}", name, e);
                false
            }
        }
    }

    async fn report(&self, update: StatusUpdate) {
        report_status(self.tracker.as_ref(), &update).await;
    }
}

#[async_trait]
impl StageHandler for ConvertStage {
    fn name(&self) -> &'static str {
        "conversion"
    }

    async fn handle(&self, payload: &str) -> Result<Outcome> {
        if let Some(reason) = self.skip_reason(payload) {
            return Ok(Outcome::Skipped(reason));
        }

        let path = Path::new(payload);
        let name = file_name(payload);
        let sample = sample_name(payload);

        if self.settings.check_exists && !self.known_to_tracker(&sample).await {
            return Ok(Outcome::Skipped(format!("sample {sample} is unknown to the tracker")));
        }

        if let Some(window) = self.settings.freshness_window
            && self.recently_archived(&sample, window).await
        {
            return Ok(Outcome::Skipped(format!(
                "storage holds a converted copy of {sample} newer than {} hours",
                window.num_hours()
            )));
        }

        debug!("Waiting for {} to stabilize", payload);
        let size = self.settings.probe.wait_until_stable(path).await?;
        info!("{} is stable at {} bytes", payload, size);

        if dotted_extension(path).as_deref() == Some(CONVERTED_EXTENSION) {
            self.queue.enqueue(&self.upload, payload).await?;
            info!("{} is already converted, adding to upload queue", payload);
            return Ok(Outcome::Done);
        }

        self.report(StatusUpdate::new(&sample, SampleStatus::Acquired).with_file_handle(name))
            .await;

        let destination = destination_for(&self.settings.storage_root, name);
        info!("Converting {} into {}", payload, destination.display());
        match self.converter.convert(path, &destination).await? {
            ConversionResult::Converted(output) => {
                info!("Converted {} to {}", payload, output.display());
                self.report(
                    StatusUpdate::new(&sample, SampleStatus::Converted)
                        .with_file_handle(format!("{sample}{CONVERTED_EXTENSION}")),
                )
                .await;
                let output = output.to_string_lossy();
                self.queue.enqueue(&self.upload, &output).await?;
                info!("Adding {} to upload queue", output);
                Ok(Outcome::Done)
            }
            ConversionResult::Failed { reason } => Ok(Outcome::Failed(reason)),
        }
    }
}
