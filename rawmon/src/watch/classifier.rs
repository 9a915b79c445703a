//! Maps filesystem events to pipeline stages.

use std::path::{Path, PathBuf};

use regex::Regex;

use super::{CONVERTED_EXTENSION, DIRECTORY_EXTENSIONS};
use crate::domain::Stage;
use crate::domain::sample::dotted_extension;
use crate::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchEventKind {
    Created,
    Moved,
}

/// A create or move observed under a watched root.
///
/// `path` is the resulting path: the new entry for a create, the destination for a move.
/// `is_dir` is `None` when neither the event nor the filesystem could tell.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchEvent {
    pub kind: WatchEventKind,
    pub path: PathBuf,
    pub is_dir: Option<bool>,
}

impl WatchEvent {
    pub fn created(path: impl Into<PathBuf>) -> Self {
        Self {
            kind: WatchEventKind::Created,
            path: path.into(),
            is_dir: None,
        }
    }

    pub fn moved(to: impl Into<PathBuf>) -> Self {
        Self {
            kind: WatchEventKind::Moved,
            path: to.into(),
            is_dir: None,
        }
    }

    pub fn with_dir(mut self, is_dir: bool) -> Self {
        self.is_dir = Some(is_dir);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Classification {
    Stage(Stage),
    Ignore(&'static str),
}

/// Rule set deciding which queue, if any, an event belongs to.
///
/// Rules apply in order: sidecar patterns, the converted extension, then the
/// recognized raw extensions. Sidecar patterns only see the part of the path below the
/// watched root it falls under, so a root named like a bundle does not hide its contents.
/// A directory bundle extension must arrive as a directory and every other extension as
/// a file; an event of unknown type is taken at its extension.
#[derive(Debug, Clone)]
pub struct EventClassifier {
    extensions: Vec<String>,
    sidecars: Vec<Regex>,
    roots: Vec<PathBuf>,
}

impl EventClassifier {
    pub fn new<S: AsRef<str>>(extensions: &[S], sidecar_patterns: &[S]) -> Result<Self> {
        let extensions = extensions
            .iter()
            .map(|e| {
                let e = e.as_ref().trim().to_ascii_lowercase();
                if e.starts_with('.') { e } else { format!(".{e}") }
            })
            .collect();
        let sidecars = sidecar_patterns
            .iter()
            .map(|p| {
                Regex::new(p.as_ref()).map_err(|e| {
                    Error::config(format!("invalid sidecar pattern '{}': {e}", p.as_ref()))
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            extensions,
            sidecars,
            roots: Vec::new(),
        })
    }

    /// Watched roots, stripped from event paths before sidecar patterns are matched.
    pub fn with_roots<P: Into<PathBuf>>(mut self, roots: impl IntoIterator<Item = P>) -> Self {
        self.roots = roots.into_iter().map(Into::into).collect();
        self
    }

    pub fn classify(&self, event: &WatchEvent) -> Classification {
        let path = event.path.as_path();
        let text = self.below_root(path).to_string_lossy();
        if self.sidecars.iter().any(|rx| rx.is_match(&text)) {
            return Classification::Ignore("bundle companion");
        }

        let Some(ext) = dotted_extension(path) else {
            return Classification::Ignore("unrecognized extension");
        };
        let stage = if ext == CONVERTED_EXTENSION {
            Stage::Upload
        } else if self.extensions.iter().any(|e| *e == ext) {
            Stage::Conversion
        } else {
            return Classification::Ignore("unrecognized extension");
        };

        let bundle = DIRECTORY_EXTENSIONS.contains(&ext.as_str());
        match event.is_dir {
            Some(false) if bundle => Classification::Ignore("bundle is not a directory"),
            Some(true) if !bundle => Classification::Ignore("directory with file extension"),
            _ => Classification::Stage(stage),
        }
    }

    /// `path` relative to the deepest root containing it, or unchanged outside every root.
    fn below_root<'a>(&self, path: &'a Path) -> &'a Path {
        self.roots
            .iter()
            .filter_map(|root| path.strip_prefix(root).ok())
            .min_by_key(|rel| rel.components().count())
            .unwrap_or(path)
    }
}
