//! 1D/2D symbol reading primitive
//!
//! Readers are given one prepared grayscale image and return every payload
//! they find in it. They must be pure functions of the image: the decode
//! ladder relies on that for repeatable results.

use crate::domain::types::new_uuid_v7;
use image::GrayImage;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Command, Output, Stdio};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info, warn};

/// zbarimg exit status when the image holds no symbol
const ZBAR_NO_SYMBOLS: i32 = 4;
/// How often a running scanner is checked for exit
const WAIT_POLL: Duration = Duration::from_millis(5);

#[derive(Debug, Error)]
pub enum SymbolReaderError {
    #[error("symbol reader {program} unavailable: {reason}")]
    Unavailable { program: String, reason: String },
}

pub trait SymbolReader: Send + Sync {
    fn read(&self, image: &GrayImage) -> Vec<String>;
}

/// Adapts a closure into a reader
pub struct FnReader<F>(pub F);

impl<F> SymbolReader for FnReader<F>
where
    F: Fn(&GrayImage) -> Vec<String> + Send + Sync,
{
    fn read(&self, image: &GrayImage) -> Vec<String> {
        (self.0)(image)
    }
}

/// Reads symbols by running the zbar command-line scanner on a scratch PNG
pub struct ZbarCommandReader {
    program: String,
    scratch_dir: PathBuf,
    timeout: Duration,
}

impl ZbarCommandReader {
    pub fn new(program: &str) -> Self {
        Self {
            program: program.to_string(),
            scratch_dir: std::env::temp_dir(),
            timeout: Duration::from_secs(2),
        }
    }

    /// Longest a single scan may run before the scanner is killed
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Run the scanner on `path`; `None` if it could not run or was killed
    fn scan(&self, path: &Path) -> Option<Output> {
        let mut child = match Command::new(&self.program)
            .args(["--raw", "-q"])
            .arg(path)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
        {
            Ok(child) => child,
            Err(e) => {
                warn!(program = %self.program, error = %e, "symbol_reader_spawn_failed");
                return None;
            }
        };

        let deadline = Instant::now() + self.timeout;
        let status = loop {
            match child.try_wait() {
                Ok(Some(status)) => break status,
                Ok(None) if Instant::now() >= deadline => {
                    if let Err(e) = child.kill() {
                        debug!(error = %e, "symbol_reader_kill_failed");
                    }
                    let _ = child.wait();
                    warn!(
                        program = %self.program,
                        timeout_ms = %self.timeout.as_millis(),
                        "symbol_reader_timed_out"
                    );
                    return None;
                }
                Ok(None) => std::thread::sleep(WAIT_POLL),
                Err(e) => {
                    warn!(program = %self.program, error = %e, "symbol_reader_wait_failed");
                    let _ = child.kill();
                    let _ = child.wait();
                    return None;
                }
            }
        };

        // Output is a few lines; it fits the pipe buffer while the scanner runs
        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        if let Some(mut out) = child.stdout.take() {
            let _ = out.read_to_end(&mut stdout);
        }
        if let Some(mut err) = child.stderr.take() {
            let _ = err.read_to_end(&mut stderr);
        }
        Some(Output { status, stdout, stderr })
    }

    /// Confirm the scanner can be executed; returns its version string
    pub fn probe(&self) -> Result<String, SymbolReaderError> {
        let output = Command::new(&self.program).arg("--version").output().map_err(|e| {
            SymbolReaderError::Unavailable { program: self.program.clone(), reason: e.to_string() }
        })?;
        if !output.status.success() {
            return Err(SymbolReaderError::Unavailable {
                program: self.program.clone(),
                reason: format!("exit status {}", output.status),
            });
        }
        let version = String::from_utf8_lossy(&output.stdout).trim().to_string();
        info!(program = %self.program, version = %version, "symbol_reader_ready");
        Ok(version)
    }
}

fn parse_zbar_output(stdout: &[u8]) -> Vec<String> {
    String::from_utf8_lossy(stdout)
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect()
}

impl SymbolReader for ZbarCommandReader {
    fn read(&self, image: &GrayImage) -> Vec<String> {
        if image.width() == 0 || image.height() == 0 {
            return Vec::new();
        }

        let path = self.scratch_dir.join(format!("dock-scan-{}.png", new_uuid_v7()));
        if let Err(e) = image.save(&path) {
            warn!(path = %path.display(), error = %e, "symbol_scratch_write_failed");
            return Vec::new();
        }

        let output = self.scan(&path);
        if let Err(e) = std::fs::remove_file(&path) {
            debug!(path = %path.display(), error = %e, "symbol_scratch_cleanup_failed");
        }

        match output {
            Some(output) if output.status.success() => parse_zbar_output(&output.stdout),
            Some(output) if output.status.code() == Some(ZBAR_NO_SYMBOLS) => Vec::new(),
            Some(output) => {
                debug!(
                    status = %output.status,
                    stderr = %String::from_utf8_lossy(&output.stderr).trim(),
                    "symbol_reader_failed"
                );
                Vec::new()
            }
            None => Vec::new(),
        }
    }
}
