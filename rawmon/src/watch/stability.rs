//! Detects when a file or bundle has stopped growing.

use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info};

use crate::utils::fs::{io_error, tree_size};
use crate::{Error, Result};

/// Polls the size of a path until it stops changing.
///
/// A directory's size is the recursive sum of the files it contains. The path counts as
/// stable after `confirmations` consecutive polls, `interval` apart, saw the same size.
#[derive(Debug, Clone)]
pub struct StabilityProbe {
    interval: Duration,
    confirmations: u32,
    max_wait: Option<Duration>,
}

impl StabilityProbe {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            confirmations: 1,
            max_wait: None,
        }
    }

    pub fn with_confirmations(mut self, confirmations: u32) -> Self {
        self.confirmations = confirmations.max(1);
        self
    }

    /// Fail with [`Error::StabilityTimeout`] instead of waiting forever.
    pub fn with_max_wait(mut self, max_wait: Option<Duration>) -> Self {
        self.max_wait = max_wait;
        self
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    async fn measure(path: &Path) -> Result<u64> {
        let owned: PathBuf = path.to_path_buf();
        tokio::task::spawn_blocking(move || tree_size(&owned).map_err(|e| io_error("measuring", &owned, e)))
            .await
            .map_err(|e| Error::Other(format!("size probe task failed: {e}")))?
    }

    /// Block until `path` stops growing and return its final size.
    ///
    /// Without a `max_wait` this never gives up: an instrument may write to the same
    /// bundle for hours.
    pub async fn wait_until_stable(&self, path: &Path) -> Result<u64> {
        let started = Instant::now();
        let mut last = Self::measure(path).await?;
        let mut confirmed = 0u32;

        loop {
            info!("Waiting for instrument to finish writing {}", path.display());
            tokio::time::sleep(self.interval).await;

            let current = Self::measure(path).await?;
            if current == last {
                confirmed += 1;
                if confirmed >= self.confirmations {
                    debug!(path = %path.display(), size = current, "Path is stable");
                    return Ok(current);
                }
            } else {
                debug!(
                    path = %path.display(),
                    previous = last,
                    current,
                    "Path still growing"
                );
                confirmed = 0;
                last = current;
            }

            if let Some(max_wait) = self.max_wait {
                let waited = started.elapsed();
                if waited >= max_wait {
                    return Err(Error::StabilityTimeout {
                        path: path.to_path_buf(),
                        waited_secs: waited.as_secs(),
                    });
                }
            }
        }
    }
}
