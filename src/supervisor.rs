//! Supervisor — start, stop, status, and restart for the background server.
//!
//! Nothing survives between CLI invocations except the registry file and
//! the listening port, so every operation re-derives the server's state
//! from (registry record) × (OS liveness of that PID) × (health endpoint).
//!
//! Ordering within `start`: health check → stale-record cleanup → loopback
//! port probe → runtime resolution → spawn → registry save → bounded
//! readiness poll.
//! Readiness is never reported before the spawned process has answered the
//! health endpoint at least once.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::config::SupervisorConfig;
use crate::error::SupervisorError;
use crate::launcher::{self, Launcher, ManagedProcess, Runtime};
use crate::logsink::{LogSink, LogTail};
use crate::probe::health::{HealthChecker, HealthReport, HealthStatus};
use crate::probe::base_url;
use crate::probe::port::{is_available as port_available, LOOPBACK};
use crate::registry::{is_alive, ProcessRegistry, RegistryRecord};

/// How often `stop` re-checks whether the signalled process has exited.
const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Derived lifecycle state of the managed server. Never persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadinessState {
    /// No record, or the recorded process is gone.
    Stopped,
    /// Process alive, health endpoint not answering yet.
    Starting,
    /// Process alive and health endpoint answering 2xx.
    Running,
    /// Process alive but still not answering after the readiness window.
    Unresponsive,
    /// Terminate signal sent, waiting for the process to exit.
    Stopping,
}

impl fmt::Display for ReadinessState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ReadinessState::Stopped => "stopped",
            ReadinessState::Starting => "starting",
            ReadinessState::Running => "running",
            ReadinessState::Unresponsive => "unresponsive",
            ReadinessState::Stopping => "stopping",
        };
        f.write_str(label)
    }
}

/// Derive the state from the three independent observations.
///
/// `record_age` is how long ago the registry record was written; a live
/// process that has not answered within `window` is Unresponsive.
pub fn derive_state(
    has_record: bool,
    process_alive: bool,
    responding: bool,
    record_age: Duration,
    window: Duration,
) -> ReadinessState {
    match (has_record && process_alive, responding) {
        (false, _) => ReadinessState::Stopped,
        (true, true) => ReadinessState::Running,
        (true, false) if record_age <= window => ReadinessState::Starting,
        (true, false) => ReadinessState::Unresponsive,
    }
}

/// Result of `start`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartOutcome {
    /// Something already answers the health endpoint; nothing was spawned.
    AlreadyRunning {
        port: u16,
        /// Recorded PID, when the registry points at a live process.
        pid: Option<u32>,
    },
    /// A recorded process is alive but not answering on this port; nothing was spawned.
    AlreadyTracked(ManagedProcess),
    /// Spawned and answered the health endpoint within the poll budget.
    Ready {
        process: ManagedProcess,
        runtime: Runtime,
        health: HealthReport,
    },
    /// Spawned and still alive, but not answering yet.
    StillStarting {
        process: ManagedProcess,
        runtime: Runtime,
    },
    /// Spawned but exited before answering; its record has been removed.
    ExitedDuringStartup { pid: u32 },
}

/// Result of `stop`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopOutcome {
    /// No record or no live process; no signal was sent.
    AlreadyStopped,
    /// The registry was cleared after signalling `pid`.
    Stopped {
        pid: u32,
        /// Why signal delivery failed, if it did.
        signal_error: Option<String>,
        /// Whether the process was seen to exit within the stop timeout.
        exited: bool,
    },
}

/// Result of `restart`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestartOutcome {
    pub stop: StopOutcome,
    pub start: StartOutcome,
}

/// Point-in-time observation of the managed server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusReport {
    /// PID read from the registry file, if any.
    pub pid: Option<u32>,
    pub process_alive: bool,
    pub responding: bool,
    pub host: String,
    pub port: u16,
    /// Body of the health response, when responding.
    pub health: Option<HealthReport>,
    pub state: ReadinessState,
    pub started_at: Option<DateTime<Utc>>,
}

/// Single context object for one CLI invocation.
///
/// Built once from a validated config; owns no process handles, only paths.
#[derive(Debug, Clone)]
pub struct Supervisor {
    config: SupervisorConfig,
    registry: ProcessRegistry,
    logs: LogSink,
    health: HealthChecker,
    launcher: Launcher,
}

impl Supervisor {
    pub fn new(config: SupervisorConfig) -> crate::Result<Self> {
        config.validate()?;
        let paths = config.paths();
        Ok(Self {
            registry: ProcessRegistry::new(paths.pid_file),
            logs: LogSink::new(paths.log_file),
            health: HealthChecker::new(config.health_timeout()),
            launcher: Launcher::from_config(&config),
            config,
        })
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.config
    }

    pub fn registry(&self) -> &ProcessRegistry {
        &self.registry
    }

    pub fn log_sink(&self) -> &LogSink {
        &self.logs
    }

    /// Start the server on `host:port` unless it is already up.
    pub async fn start(&self, host: &str, port: u16) -> crate::Result<StartOutcome> {
        ensure_port(port)?;
        let url = base_url(host, port);

        if self.health.probe(&url).await.is_ready() {
            let pid = self.live_record().await.map(|record| record.pid);
            tracing::info!(port = port, pid = ?pid, "server already answering health checks");
            return Ok(StartOutcome::AlreadyRunning { port, pid });
        }

        if let Some(record) = self.registry.load_record().await {
            if !has_exited(record.pid) {
                tracing::warn!(
                    pid = record.pid,
                    port = port,
                    "recorded server is alive but not answering; not spawning another"
                );
                return Ok(StartOutcome::AlreadyTracked(ManagedProcess {
                    pid: record.pid,
                    host: host.to_string(),
                    port,
                    started_at: record.saved_at,
                }));
            }
            tracing::info!(pid = record.pid, "removing stale registry record");
            self.registry.clear().await?;
        }

        if !port_available(LOOPBACK, port).await {
            return Err(SupervisorError::PortUnavailable {
                host: LOOPBACK.to_string(),
                port,
            });
        }

        let runtime = self.launcher.resolve().await?;
        tracing::info!(runtime = %runtime.describe(), "resolved server runtime");

        let plan = self.launcher.plan(&runtime, host, port);
        let process = self.launcher.spawn(&plan, &self.logs, host, port)?;

        if let Err(e) = self.registry.save(process.pid).await {
            // An untracked server could never be stopped by a later invocation
            if let Err(kill_err) = launcher::terminate(process.pid) {
                tracing::warn!(pid = process.pid, error = %kill_err, "failed to stop untracked server");
            }
            return Err(e);
        }

        for attempt in 1..=self.config.poll_attempts {
            tokio::time::sleep(self.config.poll_interval()).await;

            if let HealthStatus::Ready(health) = self.health.probe(&url).await {
                tracing::info!(pid = process.pid, attempt = attempt, "server is ready");
                return Ok(StartOutcome::Ready {
                    process,
                    runtime,
                    health,
                });
            }

            if has_exited(process.pid) {
                tracing::warn!(pid = process.pid, attempt = attempt, "server exited during startup");
                self.registry.clear().await?;
                return Ok(StartOutcome::ExitedDuringStartup { pid: process.pid });
            }

            tracing::debug!(pid = process.pid, attempt = attempt, "server not ready yet");
        }

        tracing::info!(
            pid = process.pid,
            attempts = self.config.poll_attempts,
            "server still starting after poll budget"
        );
        Ok(StartOutcome::StillStarting { process, runtime })
    }

    /// Stop the recorded server, clearing the registry whether or not the
    /// signal could be delivered.
    pub async fn stop(&self) -> crate::Result<StopOutcome> {
        let pid = match self.registry.load().await {
            Some(pid) if !has_exited(pid) => pid,
            stale => {
                if let Some(pid) = stale {
                    tracing::info!(pid = pid, "recorded server is not running");
                }
                // Also removes an unparsable file
                self.registry.clear().await?;
                return Ok(StopOutcome::AlreadyStopped);
            }
        };

        tracing::info!(pid = pid, state = %ReadinessState::Stopping, "sending terminate signal");
        let signal_error = match launcher::terminate(pid) {
            Ok(()) => None,
            Err(e) => {
                tracing::warn!(pid = pid, error = %e, "terminate signal failed");
                Some(e.to_string())
            }
        };

        let exited = signal_error.is_none() && self.wait_for_exit(pid).await;
        if signal_error.is_none() && !exited {
            tracing::warn!(
                pid = pid,
                timeout_ms = self.config.stop_timeout_ms,
                "server did not exit within the stop timeout"
            );
        }

        self.registry.clear().await?;
        Ok(StopOutcome::Stopped {
            pid,
            signal_error,
            exited,
        })
    }

    /// Observe the server without changing anything.
    pub async fn status(&self, host: &str, port: u16) -> crate::Result<StatusReport> {
        ensure_port(port)?;
        let record = self.registry.load_record().await;
        let process_alive = record.is_some_and(|r| is_alive(r.pid));
        let health = self.health.probe(&base_url(host, port)).await;

        let record_age = record
            .and_then(|r| (Utc::now() - r.saved_at).to_std().ok())
            .unwrap_or_default();
        let state = derive_state(
            record.is_some(),
            process_alive,
            health.is_ready(),
            record_age,
            self.config.readiness_window(),
        );

        Ok(StatusReport {
            pid: record.map(|r| r.pid),
            process_alive,
            responding: health.is_ready(),
            host: host.to_string(),
            port,
            health: health.report().cloned(),
            state,
            started_at: record.map(|r| r.saved_at),
        })
    }

    /// Stop, wait the settle delay, then start. Not atomic.
    pub async fn restart(&self, host: &str, port: u16) -> crate::Result<RestartOutcome> {
        let stop = self.stop().await?;
        tokio::time::sleep(self.config.settle_delay()).await;
        let start = self.start(host, port).await?;
        Ok(RestartOutcome { stop, start })
    }

    /// Last `lines` lines of the server log.
    pub async fn logs(&self, lines: usize) -> crate::Result<LogTail> {
        self.logs.tail(lines).await
    }

    async fn live_record(&self) -> Option<RegistryRecord> {
        self.registry
            .load_record()
            .await
            .filter(|record| is_alive(record.pid))
    }

    async fn wait_for_exit(&self, pid: u32) -> bool {
        let deadline = tokio::time::Instant::now() + self.config.stop_timeout();
        loop {
            if has_exited(pid) {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(EXIT_POLL_INTERVAL).await;
        }
    }
}

fn ensure_port(port: u16) -> crate::Result<()> {
    if port == 0 {
        return Err(SupervisorError::InvalidPort(port));
    }
    Ok(())
}

/// Reaps `pid` first when it is our own child, so a crashed server does not
/// linger as a zombie that still reads as alive.
fn has_exited(pid: u32) -> bool {
    launcher::reap_exited(pid) || !is_alive(pid)
}
