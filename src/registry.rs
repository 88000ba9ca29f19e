//! PID registry — the one durable link between CLI invocations and the
//! background server.
//!
//! The registry file holds nothing but the decimal PID. Writes go through a
//! temp file and a rename so a concurrent reader sees either the old PID or
//! the new one, never a torn value. The file's modification time doubles as
//! the record's start timestamp.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};

use crate::error::SupervisorError;

/// A PID read back from the registry, with the time it was written.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegistryRecord {
    pub pid: u32,
    pub saved_at: DateTime<Utc>,
}

/// File-backed store for the PID of the managed server.
#[derive(Debug, Clone)]
pub struct ProcessRegistry {
    path: PathBuf,
}

impl ProcessRegistry {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Overwrite the registry with `pid` (write temp file, then rename).
    pub async fn save(&self, pid: u32) -> crate::Result<()> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|source| self.io_error(source))?;
        }

        let temp_path = self.temp_path();
        tokio::fs::write(&temp_path, pid.to_string())
            .await
            .map_err(|source| self.io_error(source))?;

        if let Err(source) = tokio::fs::rename(&temp_path, &self.path).await {
            let _ = tokio::fs::remove_file(&temp_path).await;
            return Err(self.io_error(source));
        }

        tracing::debug!(pid = pid, path = %self.path.display(), "registry saved");
        Ok(())
    }

    /// Read the recorded PID. Missing, empty, or garbled files read as `None`.
    pub async fn load(&self) -> Option<u32> {
        self.load_record().await.map(|record| record.pid)
    }

    /// Read the recorded PID together with the time it was written.
    pub async fn load_record(&self) -> Option<RegistryRecord> {
        let content = tokio::fs::read_to_string(&self.path).await.ok()?;
        let pid = match content.trim().parse::<u32>() {
            Ok(pid) if pid > 0 => pid,
            _ => {
                tracing::debug!(path = %self.path.display(), "ignoring unparsable registry file");
                return None;
            }
        };
        let saved_at = tokio::fs::metadata(&self.path)
            .await
            .and_then(|m| m.modified())
            .map(DateTime::<Utc>::from)
            .unwrap_or_else(|_| Utc::now());
        Some(RegistryRecord { pid, saved_at })
    }

    /// Remove the registry file. Clearing an absent registry is a no-op.
    pub async fn clear(&self) -> crate::Result<()> {
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => {
                tracing::debug!(path = %self.path.display(), "registry cleared");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(self.io_error(source)),
        }
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    fn temp_path(&self) -> PathBuf {
        let name = self
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "registry".to_string());
        self.path
            .with_file_name(format!("{}.{}.tmp", name, std::process::id()))
    }

    fn io_error(&self, source: std::io::Error) -> SupervisorError {
        SupervisorError::RegistryIo {
            path: self.path.clone(),
            source,
        }
    }
}

/// Check whether `pid` names a live process.
///
/// Sends signal 0 on Unix. Best-effort: a PID recycled by the OS for an
/// unrelated process still reads as alive. Zombies read as dead on Linux;
/// on other Unixes an unreaped child of ours reads as alive until
/// [`crate::launcher::reap_exited`] collects it.
pub fn is_alive(pid: u32) -> bool {
    // PID 0 would address our own process group
    if pid == 0 || pid > i32::MAX as u32 {
        return false;
    }

    #[cfg(unix)]
    {
        use nix::errno::Errno;
        use nix::sys::signal::kill;
        use nix::unistd::Pid;

        match kill(Pid::from_raw(pid as i32), None) {
            Ok(()) => !is_zombie(pid),
            Err(Errno::EPERM) => true,
            Err(_) => false,
        }
    }

    #[cfg(windows)]
    {
        use std::os::windows::process::CommandExt;

        std::process::Command::new("tasklist")
            .args(["/FI", &format!("PID eq {pid}"), "/NH", "/FO", "CSV"])
            .creation_flags(0x0800_0000) // CREATE_NO_WINDOW
            .output()
            .map(|out| String::from_utf8_lossy(&out.stdout).contains(&format!("\"{pid}\"")))
            .unwrap_or(false)
    }
}

#[cfg(target_os = "linux")]
fn is_zombie(pid: u32) -> bool {
    // Field 3 of /proc/<pid>/stat follows the parenthesised command name
    std::fs::read_to_string(format!("/proc/{pid}/stat"))
        .ok()
        .and_then(|stat| {
            let after_comm = &stat[stat.rfind(')')? + 1..];
            after_comm.split_whitespace().next().map(|state| state == "Z")
        })
        .unwrap_or(false)
}

#[cfg(all(unix, not(target_os = "linux")))]
fn is_zombie(_pid: u32) -> bool {
    false
}
