//! Sample state and acquisition metadata as seen by the tracking service.

use std::path::Path;

use serde::{Deserialize, Serialize};

/// Lifecycle status of a sample in the external tracker.
///
/// Forward-monotonic in the happy path; `Failed` is reachable from any state and needs
/// manual intervention to resume.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SampleStatus {
    Entered,
    Acquired,
    Converted,
    UploadedRaw,
    Scheduled,
    Failed,
}

impl SampleStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SampleStatus::Entered => "entered",
            SampleStatus::Acquired => "acquired",
            SampleStatus::Converted => "converted",
            SampleStatus::UploadedRaw => "uploaded_raw",
            SampleStatus::Scheduled => "scheduled",
            SampleStatus::Failed => "failed",
        }
    }
}

impl std::fmt::Display for SampleStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One state change reported to the tracker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusUpdate {
    pub sample: String,
    pub status: SampleStatus,
    #[serde(rename = "fileHandle", skip_serializing_if = "Option::is_none")]
    pub file_handle: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl StatusUpdate {
    pub fn new(sample: impl Into<String>, status: SampleStatus) -> Self {
        Self {
            sample: sample.into(),
            status,
            file_handle: None,
            reason: None,
        }
    }

    pub fn with_file_handle(mut self, file_handle: impl Into<String>) -> Self {
        self.file_handle = Some(file_handle.into());
        self
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    pub fn failed(sample: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::new(sample, SampleStatus::Failed).with_reason(reason)
    }
}

/// Chromatography block of a sample's acquisition record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chromatography {
    pub method: String,
    pub instrument: String,
    pub column: String,
    pub ionisation: String,
}

/// Acquisition metadata for one sample.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AcquisitionData {
    #[serde(default)]
    pub sample: String,
    pub chromatography: Chromatography,
}

impl AcquisitionData {
    /// Composite method key: method, instrument, column and ionisation joined by `" | "`.
    pub fn method_key(&self) -> String {
        let c = &self.chromatography;
        [
            c.method.as_str(),
            c.instrument.as_str(),
            c.column.as_str(),
            c.ionisation.as_str(),
        ]
        .join(" | ")
    }
}

/// Last path component, accepting both `/` and `\` separators.
///
/// Payloads may originate on Windows acquisition PCs, so both separators are honoured
/// regardless of the platform the monitor runs on.
pub fn file_name(path: &str) -> &str {
    let trimmed = path.trim_end_matches(['/', '\\']);
    trimmed.rsplit(['/', '\\']).next().unwrap_or(trimmed)
}

/// Sample name of a work item: the file name with its last extension removed.
///
/// `.../Batch1/SampleA.d` and `.../SampleA.mzml` both yield `SampleA`; a bare sample id
/// is returned as-is.
pub fn sample_name(payload: &str) -> String {
    let name = file_name(payload);
    match name.rsplit_once('.') {
        Some((stem, _)) if !stem.is_empty() => stem.to_string(),
        _ => name.to_string(),
    }
}

/// Lowercased extension of a path including the leading dot (`.d`, `.raw`, `.mzml`).
pub(crate) fn dotted_extension(path: &Path) -> Option<String> {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| format!(".{}", e.to_ascii_lowercase()))
}
