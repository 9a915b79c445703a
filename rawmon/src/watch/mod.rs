//! Filesystem side of the pipeline: readiness detection, event classification and the
//! directory watcher that feeds the first queues.

mod classifier;
mod stability;
mod watcher;

pub use classifier::{Classification, EventClassifier, WatchEvent, WatchEventKind};
pub use stability::StabilityProbe;
pub use watcher::{EventRouter, FsWatcher, WatcherSettings};

/// Companion artifacts that belong to a bundle and are never queued on their own:
/// anything inside a `.d` directory, `.wiff.scan` companions and temporary files.
pub const DEFAULT_SIDECAR_PATTERNS: &[&str] =
    &[r"(?i)\.d[\\/]", r"(?i)\.wiff\.scan$", r"(?i)\.tmp$"];

/// Raw formats stored as a directory bundle rather than a single file.
pub const DIRECTORY_EXTENSIONS: &[&str] = &[".d"];

/// Extension of converted files, admitted straight to the upload stage.
pub const CONVERTED_EXTENSION: &str = ".mzml";
