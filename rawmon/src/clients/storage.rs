//! Archive backends for converted files.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use process_utils::{run_captured, tokio_command};
use serde::Deserialize;
use tracing::{debug, info};

use super::{RemoteObject, Storage};
use crate::domain::file_name;
use crate::utils::fs::{ensure_dir_all, ensure_parent_dir, io_error};
use crate::{Error, Result};

/// Archive kept in a local (or mounted) directory.
#[derive(Debug, Clone)]
pub struct LocalStorage {
    root: PathBuf,
}

impl LocalStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn object_path(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }
}

#[async_trait]
impl Storage for LocalStorage {
    async fn save(&self, path: &Path) -> Result<Option<String>> {
        let name = file_name(&path.to_string_lossy()).to_string();
        if name.is_empty() {
            return Ok(None);
        }
        ensure_dir_all(&self.root).await?;
        let target = self.object_path(&name);
        ensure_parent_dir(&target).await?;
        let bytes = tokio::fs::copy(path, &target)
            .await
            .map_err(|e| io_error("archiving", path, e))?;
        debug!("Copied {} bytes to {}", bytes, target.display());
        Ok(Some(name))
    }

    async fn exists(&self, name: &str) -> Result<bool> {
        Ok(tokio::fs::try_exists(self.object_path(name)).await?)
    }

    async fn delete(&self, name: &str) -> Result<()> {
        crate::utils::fs::remove_path(&self.object_path(name)).await
    }

    async fn stat(&self, name: &str) -> Result<Option<RemoteObject>> {
        let path = self.object_path(name);
        match tokio::fs::metadata(&path).await {
            Ok(meta) => {
                let modified = meta.modified().map_err(|e| io_error("reading", &path, e))?;
                Ok(Some(RemoteObject {
                    name: name.to_string(),
                    modified: DateTime::<Utc>::from(modified),
                }))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(io_error("reading", &path, e)),
        }
    }

    fn location(&self) -> String {
        self.root.display().to_string()
    }
}

/// Archive on any rclone remote (S3, SFTP, ...).
#[derive(Debug, Clone)]
pub struct RcloneStorage {
    rclone_path: PathBuf,
    remote: String,
}

/// rclone exit code for "directory not found" / "object not found".
const RCLONE_NOT_FOUND: i32 = 3;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct LsJsonEntry {
    name: String,
    mod_time: DateTime<Utc>,
    #[serde(default)]
    is_dir: bool,
}

/// Parse `rclone lsjson` output for a single object.
pub(crate) fn parse_lsjson(stdout: &str, name: &str) -> Result<Option<RemoteObject>> {
    let entries: Vec<LsJsonEntry> = serde_json::from_str(stdout.trim())?;
    Ok(entries
        .into_iter()
        .find(|e| !e.is_dir && e.name == name)
        .map(|e| RemoteObject {
            name: e.name,
            modified: e.mod_time,
        }))
}

impl RcloneStorage {
    pub fn new(rclone_path: impl Into<PathBuf>, remote: impl Into<String>) -> Self {
        Self {
            rclone_path: rclone_path.into(),
            remote: remote.into(),
        }
    }

    fn target(&self, name: &str) -> String {
        if self.remote.ends_with(':') || self.remote.ends_with('/') {
            format!("{}{}", self.remote, name)
        } else {
            format!("{}/{}", self.remote, name)
        }
    }

    async fn rclone(&self, args: &[&str]) -> Result<process_utils::CapturedOutput> {
        let mut cmd = tokio_command(&self.rclone_path);
        cmd.args(["--log-level", "ERROR"]).args(args);
        run_captured(&mut cmd)
            .await
            .map_err(|e| io_error("running", &self.rclone_path, e))
    }
}

#[async_trait]
impl Storage for RcloneStorage {
    async fn save(&self, path: &Path) -> Result<Option<String>> {
        let name = file_name(&path.to_string_lossy()).to_string();
        if name.is_empty() {
            return Ok(None);
        }
        let source = path.to_string_lossy();
        let target = self.target(&name);
        info!("Rclone copyto: {} -> {}", source, target);

        let output = self.rclone(&["copyto", &source, &target]).await?;
        if !output.success() {
            return Err(Error::Other(format!(
                "rclone failed with exit code {}: {}",
                output.code(),
                output.combined()
            )));
        }
        Ok(Some(name))
    }

    async fn exists(&self, name: &str) -> Result<bool> {
        Ok(self.stat(name).await?.is_some())
    }

    async fn delete(&self, name: &str) -> Result<()> {
        let output = self.rclone(&["deletefile", &self.target(name)]).await?;
        if output.success() || output.code() == RCLONE_NOT_FOUND {
            return Ok(());
        }
        Err(Error::Other(format!(
            "rclone deletefile failed with exit code {}: {}",
            output.code(),
            output.combined()
        )))
    }

    async fn stat(&self, name: &str) -> Result<Option<RemoteObject>> {
        let output = self.rclone(&["lsjson", &self.target(name)]).await?;
        if output.code() == RCLONE_NOT_FOUND {
            return Ok(None);
        }
        if !output.success() {
            return Err(Error::Other(format!(
                "rclone lsjson failed with exit code {}: {}",
                output.code(),
                output.combined()
            )));
        }
        parse_lsjson(&output.stdout, name)
    }

    fn location(&self) -> String {
        self.remote.clone()
    }
}
