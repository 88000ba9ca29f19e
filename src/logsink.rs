//! Append-only server log.
//!
//! The supervisor opens the log once per launch and hands duplicates of the
//! file descriptor to the child's stdout and stderr. Its own copy is dropped
//! right after the spawn; the child's copies close when the child exits.
//! Reading never goes through that handle: `tail` re-reads the file.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::process::Stdio;

use crate::error::SupervisorError;

/// Result of tailing the log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogTail {
    /// The server has never written a log at this path.
    NoLogYet,
    /// Up to the requested number of trailing lines, oldest first.
    Lines(Vec<String>),
}

/// Location of the server log.
#[derive(Debug, Clone)]
pub struct LogSink {
    path: PathBuf,
}

/// Open append-mode handle, alive for the duration of one launch.
#[derive(Debug)]
pub struct LogHandle {
    file: File,
    path: PathBuf,
}

impl LogSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Open the log for appending, creating it and its directory if needed.
    pub fn open(&self) -> crate::Result<LogHandle> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|source| self.io_error(source))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|source| self.io_error(source))?;
        Ok(LogHandle {
            file,
            path: self.path.clone(),
        })
    }

    /// Read the last `lines` lines of the log.
    pub async fn tail(&self, lines: usize) -> crate::Result<LogTail> {
        let bytes = match tokio::fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(LogTail::NoLogYet),
            Err(source) => return Err(self.io_error(source)),
        };

        // The child may write anything; never fail on invalid UTF-8
        let content = String::from_utf8_lossy(&bytes);
        let all: Vec<&str> = content.lines().collect();
        let start = all.len().saturating_sub(lines);
        Ok(LogTail::Lines(
            all[start..].iter().map(|line| line.to_string()).collect(),
        ))
    }

    fn io_error(&self, source: std::io::Error) -> SupervisorError {
        SupervisorError::LogIo {
            path: self.path.clone(),
            source,
        }
    }
}

impl LogHandle {
    /// Two `Stdio` values sharing this file, for the child's stdout and stderr.
    pub fn child_stdio(&self) -> crate::Result<(Stdio, Stdio)> {
        let stdout = self.file.try_clone().map_err(|source| self.io_error(source))?;
        let stderr = self.file.try_clone().map_err(|source| self.io_error(source))?;
        Ok((Stdio::from(stdout), Stdio::from(stderr)))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn io_error(&self, source: std::io::Error) -> SupervisorError {
        SupervisorError::LogIo {
            path: self.path.clone(),
            source,
        }
    }
}
