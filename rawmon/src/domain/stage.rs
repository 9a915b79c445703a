//! Pipeline stage value object.

use serde::{Deserialize, Serialize};

/// One phase of the pipeline, each backed by its own queue and worker pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    /// Raw instrument output waiting to be converted to mzML.
    Conversion,
    /// Converted files waiting to be archived.
    Upload,
    /// Sample ids waiting for a preprocessing job.
    Schedule,
}

impl Stage {
    pub const ALL: [Stage; 3] = [Stage::Conversion, Stage::Upload, Stage::Schedule];

    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Conversion => "conversion",
            Stage::Upload => "upload",
            Stage::Schedule => "schedule",
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
