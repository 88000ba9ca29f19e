//! Supervisor configuration — deserialization, validation, and path resolution.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::error::SupervisorError;

/// Env var that forces the system interpreter over the project's virtualenv.
pub const SYSTEM_INTERPRETER_ENV: &str = "MY_PLATFORM_USE_SYSTEM_PYTHON";

/// Env var naming an explicit config file.
pub const CONFIG_PATH_ENV: &str = "FUYAO_SERVER_CONFIG";

/// Config file name searched in the working directory and the user config dir.
pub const CONFIG_FILE_NAME: &str = "fuyao-server.toml";

/// Upper bound for a single health probe.
const MAX_HEALTH_TIMEOUT_MS: u64 = 30_000;

/// Top-level supervisor configuration, parsed from TOML.
///
/// Every field has a default, so an empty file (or no file at all) yields a
/// working configuration for the bundled `python-server` directory.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    /// Directory the server runs in; relative paths below resolve against it.
    pub server_dir: PathBuf,
    pub pid_file: PathBuf,
    pub log_file: PathBuf,
    /// Prebuilt server executable, preferred over the interpreter when present.
    pub native_binary: PathBuf,
    pub venv_dir: PathBuf,
    /// Interpreter commands probed in order with `--version`.
    pub interpreters: Vec<String>,
    /// Arguments placed between the interpreter and `--host`/`--port`.
    pub entry_args: Vec<String>,
    pub host: String,
    pub port: u16,
    pub log_lines: usize,
    pub poll_interval_ms: u64,
    pub poll_attempts: u32,
    pub settle_delay_ms: u64,
    pub health_timeout_ms: u64,
    /// How long `stop` waits for the process to exit after signalling it.
    pub stop_timeout_ms: u64,
    pub use_system_interpreter: bool,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            server_dir: PathBuf::from("python-server"),
            pid_file: PathBuf::from(".server.pid"),
            log_file: PathBuf::from("server.log"),
            native_binary: default_native_binary(),
            venv_dir: PathBuf::from(".venv"),
            interpreters: vec!["python3".into(), "python".into(), "py".into()],
            entry_args: vec!["-m".into(), "uvicorn".into(), "server:app".into()],
            host: "0.0.0.0".to_string(),
            port: 8000,
            log_lines: 50,
            poll_interval_ms: 500,
            poll_attempts: 10,
            settle_delay_ms: 1000,
            health_timeout_ms: 3000,
            stop_timeout_ms: 5000,
            use_system_interpreter: false,
        }
    }
}

fn default_native_binary() -> PathBuf {
    if cfg!(windows) {
        PathBuf::from("dist").join("fuyao-server.exe")
    } else {
        PathBuf::from("dist").join("fuyao-server")
    }
}

/// Absolute-or-server-relative paths derived from a [`SupervisorConfig`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedPaths {
    pub server_dir: PathBuf,
    pub pid_file: PathBuf,
    pub log_file: PathBuf,
    pub native_binary: PathBuf,
    pub venv_dir: PathBuf,
}

impl SupervisorConfig {
    /// Load config following the lookup order: `$FUYAO_SERVER_CONFIG` →
    /// `./fuyao-server.toml` → `<config dir>/fuyao-server/fuyao-server.toml`
    /// → built-in defaults. The interpreter override env var is applied last.
    pub fn load() -> crate::Result<Self> {
        let mut config = match locate_config_file() {
            Some(path) => Self::from_file(&path)?,
            None => {
                tracing::debug!("no config file found, using defaults");
                Self::default()
            }
        };
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Parse a config file from disk.
    pub fn from_file(path: &Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|source| SupervisorError::ConfigIo {
            path: path.to_path_buf(),
            source,
        })?;
        let config: SupervisorConfig =
            toml::from_str(&content).map_err(|e| SupervisorError::ConfigParse {
                path: path.to_path_buf(),
                reason: e.to_string(),
            })?;
        tracing::debug!(path = %path.display(), "loaded config file");
        Ok(config)
    }

    /// Apply `MY_PLATFORM_USE_SYSTEM_PYTHON=true`.
    pub fn apply_env_overrides(&mut self) {
        if std::env::var(SYSTEM_INTERPRETER_ENV).is_ok_and(|v| v == "true") {
            self.use_system_interpreter = true;
        }
    }

    /// Validate the config, failing fast before anything is spawned.
    pub fn validate(&self) -> crate::Result<()> {
        if self.poll_attempts == 0 {
            return Err(SupervisorError::InvalidConfig(
                "poll_attempts must be > 0".to_string(),
            ));
        }
        if self.poll_interval_ms == 0 {
            return Err(SupervisorError::InvalidConfig(
                "poll_interval_ms must be > 0".to_string(),
            ));
        }
        if self.health_timeout_ms == 0 || self.health_timeout_ms > MAX_HEALTH_TIMEOUT_MS {
            return Err(SupervisorError::InvalidConfig(format!(
                "health_timeout_ms must be between 1 and {}, got {}",
                MAX_HEALTH_TIMEOUT_MS, self.health_timeout_ms
            )));
        }
        if self.interpreters.is_empty() {
            return Err(SupervisorError::InvalidConfig(
                "interpreters must list at least one command".to_string(),
            ));
        }
        if self.port == 0 {
            return Err(SupervisorError::InvalidConfig(
                "port must be non-zero".to_string(),
            ));
        }
        Ok(())
    }

    /// Resolve every configured path against an absolute `server_dir`.
    ///
    /// A relative `server_dir` is anchored at [`install_root`], never at the
    /// caller's working directory: every invocation must find the same
    /// registry file.
    pub fn paths(&self) -> ResolvedPaths {
        let dir = &if self.server_dir.is_absolute() {
            self.server_dir.clone()
        } else {
            install_root().join(&self.server_dir)
        };
        ResolvedPaths {
            server_dir: dir.clone(),
            pid_file: dir.join(&self.pid_file),
            log_file: dir.join(&self.log_file),
            native_binary: dir.join(&self.native_binary),
            venv_dir: dir.join(&self.venv_dir),
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }

    pub fn health_timeout(&self) -> Duration {
        Duration::from_millis(self.health_timeout_ms)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_timeout_ms)
    }

    /// How long a live process may fail health checks before it counts as unresponsive.
    pub fn readiness_window(&self) -> Duration {
        self.poll_interval() * self.poll_attempts
    }
}

/// Directory relative config paths resolve against.
///
/// The directory holding the running executable, or its parent when the
/// executable lives in a `bin/` directory. Falls back to
/// `<local data dir>/fuyao-server` when the executable path is unknown.
pub fn install_root() -> PathBuf {
    let exe_dir = std::env::current_exe()
        .and_then(std::fs::canonicalize)
        .ok()
        .and_then(|exe| exe.parent().map(Path::to_path_buf));
    match exe_dir {
        Some(dir) if dir.file_name().is_some_and(|name| name == "bin") => {
            dir.parent().map(Path::to_path_buf).unwrap_or(dir)
        }
        Some(dir) => dir,
        None => dirs::data_local_dir()
            .unwrap_or_else(std::env::temp_dir)
            .join("fuyao-server"),
    }
}

fn locate_config_file() -> Option<PathBuf> {
    if let Some(explicit) = std::env::var_os(CONFIG_PATH_ENV) {
        return Some(PathBuf::from(explicit));
    }

    let local = Path::new(CONFIG_FILE_NAME);
    if local.exists() {
        return Some(local.to_path_buf());
    }

    let user = dirs::config_dir()?.join("fuyao-server").join(CONFIG_FILE_NAME);
    user.exists().then_some(user)
}
