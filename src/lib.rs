//! fuyao-supervisor — local supervisor for the Fuyao agent platform server.
//! Starts the server as a detached background process, tracks it across CLI
//! invocations through a PID file, and reports readiness from its `/health`
//! endpoint. What runs inside the server is not this crate's concern.

pub mod config;
pub mod error;
pub mod launcher;
pub mod logsink;
pub mod probe;
pub mod registry;
pub mod supervisor;

pub use config::{install_root, ResolvedPaths, SupervisorConfig, SYSTEM_INTERPRETER_ENV};
pub use error::{Result, SupervisorError};
pub use launcher::{LaunchPlan, Launcher, ManagedProcess, Runtime};
pub use logsink::{LogSink, LogTail};
pub use probe::health::{HealthChecker, HealthReport, HealthStatus};
pub use registry::{is_alive, ProcessRegistry, RegistryRecord};
pub use supervisor::{
    derive_state, ReadinessState, RestartOutcome, StartOutcome, StatusReport, StopOutcome,
    Supervisor,
};
