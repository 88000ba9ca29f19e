//! Error types for supervisor operations.

use std::path::PathBuf;

use thiserror::Error;

/// Main error type for supervisor operations
#[derive(Error, Debug)]
pub enum SupervisorError {
    /// Something other than the managed server already holds the port
    #[error("port {port} on {host} is already in use")]
    PortUnavailable { host: String, port: u16 },

    /// Port 0 would let the OS pick a port nobody can probe
    #[error("invalid port {0}: the server needs a fixed, non-zero port")]
    InvalidPort(u16),

    /// Neither a native artifact nor an interpreter could be found
    #[error("no runtime found: {0}")]
    RuntimeNotFound(String),

    /// The OS refused to start the server process
    #[error("failed to spawn '{program}': {source}")]
    SpawnFailed {
        program: String,
        #[source]
        source: std::io::Error,
    },

    /// Reading or writing the PID registry file failed
    #[error("registry I/O failed for {}: {source}", path.display())]
    RegistryIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Opening or reading the server log failed
    #[error("log I/O failed for {}: {source}", path.display())]
    LogIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A terminate signal could not be delivered
    #[error("failed to signal process {pid}: {reason}")]
    SignalFailed { pid: u32, reason: String },

    /// Configuration values are out of range
    #[error("invalid config: {0}")]
    InvalidConfig(String),

    /// Config file exists but could not be read
    #[error("failed to read config file {}: {source}", path.display())]
    ConfigIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Config file could not be parsed as TOML
    #[error("failed to parse config file {}: {reason}", path.display())]
    ConfigParse { path: PathBuf, reason: String },
}

impl SupervisorError {
    /// Suggested next step for the person at the terminal.
    pub fn hint(&self) -> &'static str {
        match self {
            SupervisorError::PortUnavailable { .. } => "use --port to pick another port",
            SupervisorError::InvalidPort(_) => "pass --port with a value between 1 and 65535",
            SupervisorError::RuntimeNotFound(_) => {
                "install Python 3.8+ or place a prebuilt server binary under dist/"
            }
            SupervisorError::SpawnFailed { .. } => {
                "check that the server executable exists and is executable"
            }
            SupervisorError::RegistryIo { .. } | SupervisorError::LogIo { .. } => {
                "check permissions on the server directory"
            }
            SupervisorError::SignalFailed { .. } => "check the process with `status`",
            SupervisorError::InvalidConfig(_)
            | SupervisorError::ConfigIo { .. }
            | SupervisorError::ConfigParse { .. } => "fix fuyao-server.toml and retry",
        }
    }
}

/// Result type alias for supervisor operations
pub type Result<T> = std::result::Result<T, SupervisorError>;
