//! Preprocessing job and the metadata it is resolved from.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Version label used when a method has no registered versions.
pub const FIXED_VERSION: &str = "fixed";

const JOB_ID_PREFIX: &str = "preprocess_";

/// A preprocessing job for a single sample.
///
/// The id is derived from the sample id, so storing the same sample twice overwrites
/// the earlier job instead of creating a second one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub method: String,
    /// Comma-joined profile names.
    pub profile: String,
    pub samples: Vec<String>,
}

impl Job {
    pub fn id_for(sample: &str) -> String {
        format!("{JOB_ID_PREFIX}{sample}")
    }

    pub fn for_sample(sample: &str, method: impl Into<String>, profiles: &[String]) -> Self {
        Self {
            id: Self::id_for(sample),
            method: method.into(),
            profile: profiles.join(","),
            samples: vec![sample.to_string()],
        }
    }
}

/// A registered version of a method.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MethodVersion {
    pub version: String,
    pub updated: DateTime<Utc>,
}

/// One row of a method/version profile listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProfileEntry {
    pub profile: String,
}

/// Answer of the job scheduler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleResponse {
    pub job: String,
    #[serde(default)]
    pub status: String,
}

/// Pick the version with the greatest `updated` timestamp.
///
/// Ties resolve to the entry that appears first in `versions`. An empty list resolves to
/// [`FIXED_VERSION`].
pub fn latest_version(versions: &[MethodVersion]) -> String {
    versions
        .iter()
        .fold(None::<&MethodVersion>, |best, v| match best {
            Some(b) if v.updated <= b.updated => Some(b),
            _ => Some(v),
        })
        .map(|v| v.version.clone())
        .unwrap_or_else(|| FIXED_VERSION.to_string())
}
