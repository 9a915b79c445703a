//! ProteoWizard msconvert wrapper.

use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use async_trait::async_trait;
use process_utils::{run_captured, tokio_command};
use regex::Regex;
use tracing::{info, warn};

use super::{ConversionResult, Converter};
use crate::utils::fs::{ensure_dir_all, io_error};
use crate::{Error, Result};

const MSCONVERT_ARGS: &[&str] = &[
    "--mzML",
    "-e",
    ".mzml",
    "--zlib",
    "--filter",
    "peakPicking true 1-",
    "--filter",
    "zeroSamples removeExtra",
    "-o",
];

static OUTPUT_LINE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)writing output file:\s*(.+?)\s*$").unwrap());

/// Extract the path from msconvert's `writing output file: <path>` line.
pub fn parse_output_file(stdout: &str) -> Option<PathBuf> {
    OUTPUT_LINE
        .captures(stdout)
        .and_then(|c| c.get(1))
        .map(|m| PathBuf::from(m.as_str()))
        .filter(|p| !p.as_os_str().is_empty())
}

/// Runs msconvert as a child process, one conversion at a time per call.
#[derive(Debug, Clone)]
pub struct MsConvert {
    program: PathBuf,
}

impl MsConvert {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    /// Verify the executable can be found, either at the configured path or on `PATH`.
    pub fn check(&self) -> Result<()> {
        if self.program.components().count() > 1 || self.program.is_absolute() {
            if self.program.is_file() {
                return Ok(());
            }
        } else if let Some(paths) = std::env::var_os("PATH") {
            let found = std::env::split_paths(&paths).any(|dir| {
                let candidate = dir.join(&self.program);
                candidate.is_file() || candidate.with_extension("exe").is_file()
            });
            if found {
                return Ok(());
            }
        }
        Err(Error::config(format!(
            "Can't find ProteoWizard at {}",
            self.program.display()
        )))
    }
}

#[async_trait]
impl Converter for MsConvert {
    async fn convert(&self, input: &Path, dest_dir: &Path) -> Result<ConversionResult> {
        ensure_dir_all(dest_dir).await?;

        let mut cmd = tokio_command(&self.program);
        cmd.arg(input).args(MSCONVERT_ARGS).arg(dest_dir);
        info!(
            "Running ProteoWizard: {} {} {:?} {}",
            self.program.display(),
            input.display(),
            MSCONVERT_ARGS,
            dest_dir.display()
        );

        let output = run_captured(&mut cmd)
            .await
            .map_err(|e| io_error("running", &self.program, e))?;

        if !output.success() {
            warn!("Conversion of {} failed with exit code {}", input.display(), output.code());
            let captured = output.combined();
            let reason = if captured.is_empty() {
                format!("msconvert exited with code {}", output.code())
            } else {
                captured
            };
            return Ok(ConversionResult::Failed { reason });
        }

        match parse_output_file(&output.stdout) {
            Some(path) => Ok(ConversionResult::Converted(path)),
            None => Ok(ConversionResult::Failed {
                reason: format!(
                    "msconvert reported no output file: {}",
                    output.combined()
                ),
            }),
        }
    }
}
