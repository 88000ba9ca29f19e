//! Launcher — picks a runnable artifact and starts it as a detached process.
//!
//! Resolution order:
//! 1. a prebuilt native server binary under the server directory;
//! 2. the project virtualenv interpreter, unless the system interpreter is forced;
//! 3. the first configured interpreter command that answers `--version`.
//!
//! The spawned process runs in its own session, so it outlives the CLI
//! invocation that started it. Its stdout and stderr go to the [`LogSink`].

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use chrono::{DateTime, Utc};

use crate::config::SupervisorConfig;
use crate::error::SupervisorError;
use crate::logsink::LogSink;

/// The one server instance the supervisor tracks.
///
/// Only `pid` is persisted; host and port come from the invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManagedProcess {
    pub pid: u32,
    pub host: String,
    pub port: u16,
    pub started_at: DateTime<Utc>,
}

/// What will be executed to run the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Runtime {
    /// Self-contained server executable.
    Native(PathBuf),
    /// Interpreter running the server module (path or bare command name).
    Interpreter(OsString),
}

impl Runtime {
    pub fn program(&self) -> &std::ffi::OsStr {
        match self {
            Runtime::Native(path) => path.as_os_str(),
            Runtime::Interpreter(cmd) => cmd.as_os_str(),
        }
    }

    pub fn describe(&self) -> String {
        match self {
            Runtime::Native(path) => format!("native binary {}", path.display()),
            Runtime::Interpreter(cmd) => format!("interpreter {}", cmd.to_string_lossy()),
        }
    }
}

/// Fully resolved command line for one launch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchPlan {
    pub program: OsString,
    pub args: Vec<String>,
    pub workdir: PathBuf,
    /// Added on top of the inherited environment.
    pub env: Vec<(String, String)>,
}

/// Resolves the runtime and spawns the server.
#[derive(Debug, Clone)]
pub struct Launcher {
    server_dir: PathBuf,
    native_binary: PathBuf,
    venv_dir: PathBuf,
    interpreters: Vec<String>,
    entry_args: Vec<String>,
    use_system_interpreter: bool,
}

impl Launcher {
    pub fn from_config(config: &SupervisorConfig) -> Self {
        let paths = config.paths();
        Self {
            server_dir: paths.server_dir,
            native_binary: paths.native_binary,
            venv_dir: paths.venv_dir,
            interpreters: config.interpreters.clone(),
            entry_args: config.entry_args.clone(),
            use_system_interpreter: config.use_system_interpreter,
        }
    }

    /// Pick the runtime to launch, or fail with `RuntimeNotFound`.
    pub async fn resolve(&self) -> crate::Result<Runtime> {
        if self.native_binary.is_file() {
            tracing::debug!(path = %self.native_binary.display(), "using native server binary");
            return Ok(Runtime::Native(self.native_binary.clone()));
        }

        if !self.use_system_interpreter {
            let venv_python = venv_interpreter(&self.venv_dir);
            if venv_python.is_file() {
                tracing::debug!(path = %venv_python.display(), "using virtualenv interpreter");
                return Ok(Runtime::Interpreter(venv_python.into_os_string()));
            }
        }

        for candidate in &self.interpreters {
            if answers_version_query(candidate).await {
                tracing::debug!(interpreter = %candidate, "using system interpreter");
                return Ok(Runtime::Interpreter(OsString::from(candidate)));
            }
        }

        Err(SupervisorError::RuntimeNotFound(format!(
            "no server binary at {} and none of [{}] answered --version",
            self.native_binary.display(),
            self.interpreters.join(", ")
        )))
    }

    /// Build the command line for `runtime` serving on `host:port`.
    pub fn plan(&self, runtime: &Runtime, host: &str, port: u16) -> LaunchPlan {
        let mut args = Vec::new();
        let mut env = Vec::new();
        if let Runtime::Interpreter(_) = runtime {
            args.extend(self.entry_args.iter().cloned());
            env.push(("PYTHONUNBUFFERED".to_string(), "1".to_string()));
        }
        args.extend([
            "--host".to_string(),
            host.to_string(),
            "--port".to_string(),
            port.to_string(),
        ]);
        LaunchPlan {
            program: runtime.program().to_os_string(),
            args,
            workdir: self.server_dir.clone(),
            env,
        }
    }

    /// Spawn `plan` detached, appending its output to `log`.
    ///
    /// The supervisor's own log handle is released before this returns; the
    /// child keeps its duplicates until it exits.
    #[allow(unsafe_code)] // SAFETY: pre_exec only calls setsid, which is async-signal-safe
    pub fn spawn(
        &self,
        plan: &LaunchPlan,
        log: &LogSink,
        host: &str,
        port: u16,
    ) -> crate::Result<ManagedProcess> {
        let handle = log.open()?;
        let (stdout, stderr) = handle.child_stdio()?;

        let mut cmd = Command::new(&plan.program);
        cmd.args(&plan.args)
            .current_dir(&plan.workdir)
            .envs(plan.env.iter().map(|(k, v)| (k, v)))
            .stdin(Stdio::null())
            .stdout(stdout)
            .stderr(stderr);

        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;

            unsafe {
                cmd.pre_exec(|| {
                    nix::unistd::setsid().map_err(std::io::Error::from)?;
                    Ok(())
                });
            }
        }

        #[cfg(windows)]
        {
            use std::os::windows::process::CommandExt;

            const CREATE_NEW_PROCESS_GROUP: u32 = 0x0000_0200;
            const DETACHED_PROCESS: u32 = 0x0000_0008;
            cmd.creation_flags(CREATE_NEW_PROCESS_GROUP | DETACHED_PROCESS);
        }

        let child = cmd.spawn().map_err(|source| SupervisorError::SpawnFailed {
            program: plan.program.to_string_lossy().into_owned(),
            source,
        })?;
        let pid = child.id();

        // Dropping Child closes our handle only; the process keeps running
        drop(child);
        drop(handle);

        tracing::info!(
            pid = pid,
            host = %host,
            port = port,
            log = %log.path().display(),
            "spawned server process"
        );

        Ok(ManagedProcess {
            pid,
            host: host.to_string(),
            port,
            started_at: Utc::now(),
        })
    }
}

/// Send the platform's terminate request to `pid`.
///
/// Unix gets SIGTERM so the server can shut down on its own terms. Windows
/// has no equivalent for detached console processes and is killed outright.
pub fn terminate(pid: u32) -> crate::Result<()> {
    if pid == 0 || pid > i32::MAX as u32 {
        return Err(SupervisorError::SignalFailed {
            pid,
            reason: "invalid pid".to_string(),
        });
    }

    #[cfg(unix)]
    {
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;

        kill(Pid::from_raw(pid as i32), Signal::SIGTERM).map_err(|e| {
            SupervisorError::SignalFailed {
                pid,
                reason: e.to_string(),
            }
        })
    }

    #[cfg(windows)]
    {
        use std::os::windows::process::CommandExt;

        let status = Command::new("taskkill")
            .args(["/PID", &pid.to_string(), "/F"])
            .creation_flags(0x0800_0000) // CREATE_NO_WINDOW
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .map_err(|e| SupervisorError::SignalFailed {
                pid,
                reason: e.to_string(),
            })?;
        if status.success() {
            Ok(())
        } else {
            Err(SupervisorError::SignalFailed {
                pid,
                reason: format!("taskkill exited with {}", status),
            })
        }
    }
}

/// Collect the exit status of `pid` if it is a child of this process that
/// has already exited. Returns true once the child is gone.
///
/// A server that crashes while the launching invocation is still polling
/// stays a zombie until its parent waits on it, and a zombie still answers
/// signal 0. Processes that are not our children, or are still running,
/// return false.
pub fn reap_exited(pid: u32) -> bool {
    if pid == 0 || pid > i32::MAX as u32 {
        return false;
    }

    #[cfg(unix)]
    {
        use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
        use nix::unistd::Pid;

        match waitpid(Pid::from_raw(pid as i32), Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::StillAlive) => false,
            Ok(status) => {
                tracing::debug!(pid = pid, status = ?status, "reaped exited server process");
                true
            }
            // ECHILD: spawned by an earlier invocation, nothing to reap
            Err(_) => false,
        }
    }

    #[cfg(windows)]
    {
        false
    }
}

fn venv_interpreter(venv_dir: &Path) -> PathBuf {
    if cfg!(windows) {
        venv_dir.join("Scripts").join("python.exe")
    } else {
        venv_dir.join("bin").join("python")
    }
}

async fn answers_version_query(command: &str) -> bool {
    tokio::process::Command::new(command)
        .arg("--version")
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await
        .map(|status| status.success())
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config_in(dir: &Path) -> SupervisorConfig {
        SupervisorConfig {
            server_dir: dir.to_path_buf(),
            ..SupervisorConfig::default()
        }
    }

    #[cfg(unix)]
    fn write_executable(path: &Path, body: &str) {
        use std::os::unix::fs::PermissionsExt;

        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, body).unwrap();
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755)).unwrap();
    }

    #[tokio::test]
    async fn test_native_binary_wins() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_in(dir.path());
        let native = config.paths().native_binary;
        std::fs::create_dir_all(native.parent().unwrap()).unwrap();
        std::fs::write(&native, "").unwrap();

        let runtime = Launcher::from_config(&config).resolve().await.unwrap();
        assert_eq!(runtime, Runtime::Native(native));
    }

    #[tokio::test]
    async fn test_venv_interpreter_preferred_over_system() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_in(dir.path());
        let venv_python = venv_interpreter(&config.paths().venv_dir);
        std::fs::create_dir_all(venv_python.parent().unwrap()).unwrap();
        std::fs::write(&venv_python, "").unwrap();

        let runtime = Launcher::from_config(&config).resolve().await.unwrap();
        assert_eq!(runtime, Runtime::Interpreter(venv_python.into_os_string()));
    }

    #[tokio::test]
    #[cfg(unix)]
    async fn test_system_override_skips_venv() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config_in(dir.path());
        config.use_system_interpreter = true;
        let venv_python = venv_interpreter(&config.paths().venv_dir);
        std::fs::create_dir_all(venv_python.parent().unwrap()).unwrap();
        std::fs::write(&venv_python, "").unwrap();

        let answering = dir.path().join("fake-python");
        write_executable(&answering, "#!/bin/sh\necho 'Python 3.12.0'\n");
        config.interpreters = vec![answering.to_string_lossy().into_owned()];

        let runtime = Launcher::from_config(&config).resolve().await.unwrap();
        assert_eq!(runtime, Runtime::Interpreter(answering.into_os_string()));
    }

    #[tokio::test]
    #[cfg(unix)]
    async fn test_first_answering_interpreter_is_chosen() {
        let dir = tempfile::tempdir().unwrap();
        let failing = dir.path().join("broken-python");
        let answering = dir.path().join("good-python");
        write_executable(&failing, "#!/bin/sh\nexit 1\n");
        write_executable(&answering, "#!/bin/sh\necho 'Python 3.11.4'\n");

        let mut config = config_in(dir.path());
        config.interpreters = vec![
            dir.path().join("missing-python").to_string_lossy().into_owned(),
            failing.to_string_lossy().into_owned(),
            answering.to_string_lossy().into_owned(),
        ];

        let runtime = Launcher::from_config(&config).resolve().await.unwrap();
        assert_eq!(runtime, Runtime::Interpreter(answering.into_os_string()));
    }

    #[tokio::test]
    async fn test_no_runtime_found() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config_in(dir.path());
        config.interpreters = vec!["/this/interpreter/does/not/exist-fuyao".to_string()];

        let result = Launcher::from_config(&config).resolve().await;
        assert!(matches!(result, Err(SupervisorError::RuntimeNotFound(_))));
    }

    #[test]
    fn test_plan_for_native_binary() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_in(dir.path());
        let launcher = Launcher::from_config(&config);
        let native = config.paths().native_binary;

        let plan = launcher.plan(&Runtime::Native(native.clone()), "0.0.0.0", 9000);
        assert_eq!(plan.program, native.into_os_string());
        assert_eq!(plan.args, vec!["--host", "0.0.0.0", "--port", "9000"]);
        assert_eq!(plan.workdir, dir.path());
        assert!(plan.env.is_empty());
    }

    #[test]
    fn test_plan_for_interpreter() {
        let dir = tempfile::tempdir().unwrap();
        let launcher = Launcher::from_config(&config_in(dir.path()));

        let plan = launcher.plan(&Runtime::Interpreter("python3".into()), "127.0.0.1", 8000);
        assert_eq!(plan.program, OsString::from("python3"));
        assert_eq!(
            plan.args,
            vec!["-m", "uvicorn", "server:app", "--host", "127.0.0.1", "--port", "8000"]
        );
        assert_eq!(
            plan.env,
            vec![("PYTHONUNBUFFERED".to_string(), "1".to_string())]
        );
    }

    #[test]
    fn test_spawn_missing_program_is_spawn_failure() {
        let dir = tempfile::tempdir().unwrap();
        let launcher = Launcher::from_config(&config_in(dir.path()));
        let sink = LogSink::new(dir.path().join("server.log"));
        let plan = LaunchPlan {
            program: OsString::from("/this/command/does/not/exist-fuyao"),
            args: vec![],
            workdir: dir.path().to_path_buf(),
            env: vec![],
        };

        let result = launcher.spawn(&plan, &sink, "127.0.0.1", 8000);
        assert!(
            matches!(result, Err(SupervisorError::SpawnFailed { ref source, .. }) if source.kind() == std::io::ErrorKind::NotFound)
        );
    }

    #[tokio::test]
    #[cfg(unix)]
    async fn test_spawn_writes_output_to_log_and_detaches() {
        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("server.sh");
        write_executable(&script, "#!/bin/sh\necho \"out $2:$4\"\necho err >&2\n");

        let launcher = Launcher::from_config(&config_in(dir.path()));
        let sink = LogSink::new(dir.path().join("server.log"));
        let plan = launcher.plan(&Runtime::Native(script), "127.0.0.1", 8123);

        let process = launcher.spawn(&plan, &sink, "127.0.0.1", 8123).unwrap();
        assert!(process.pid > 0);
        assert_eq!(process.port, 8123);

        // The child runs in its own session
        let sid = nix::unistd::getsid(Some(nix::unistd::Pid::from_raw(process.pid as i32)));
        if let Ok(sid) = sid {
            assert_eq!(sid.as_raw(), process.pid as i32);
        }

        let mut content = String::new();
        for _ in 0..50 {
            content = std::fs::read_to_string(sink.path()).unwrap_or_default();
            if content.contains("err") {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        }
        assert!(content.contains("out 127.0.0.1:8123"));
        assert!(content.contains("err"));
    }

    #[tokio::test]
    #[cfg(unix)]
    async fn test_reap_exited_collects_crashed_child() {
        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("crash.sh");
        write_executable(&script, "#!/bin/sh\nexit 3\n");

        let launcher = Launcher::from_config(&config_in(dir.path()));
        let sink = LogSink::new(dir.path().join("server.log"));
        let plan = launcher.plan(&Runtime::Native(script), "127.0.0.1", 8124);
        let process = launcher.spawn(&plan, &sink, "127.0.0.1", 8124).unwrap();

        let mut reaped = false;
        for _ in 0..100 {
            if reap_exited(process.pid) {
                reaped = true;
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }
        assert!(reaped);
        assert!(!crate::registry::is_alive(process.pid));
        // Already collected; a second call finds nothing
        assert!(!reap_exited(process.pid));
    }

    #[tokio::test]
    #[cfg(unix)]
    async fn test_reap_exited_leaves_running_child_alone() {
        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("server.sh");
        write_executable(&script, "#!/bin/sh\nexec sleep 30\n");

        let launcher = Launcher::from_config(&config_in(dir.path()));
        let sink = LogSink::new(dir.path().join("server.log"));
        let plan = launcher.plan(&Runtime::Native(script), "127.0.0.1", 8125);
        let process = launcher.spawn(&plan, &sink, "127.0.0.1", 8125).unwrap();

        assert!(!reap_exited(process.pid));
        assert!(crate::registry::is_alive(process.pid));

        terminate(process.pid).unwrap();
        let mut reaped = false;
        for _ in 0..100 {
            if reap_exited(process.pid) {
                reaped = true;
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }
        assert!(reaped);
    }

    #[test]
    fn test_reap_exited_ignores_non_children() {
        assert!(!reap_exited(0));
        assert!(!reap_exited(std::process::id()));
    }

    #[test]
    fn test_terminate_rejects_pid_zero() {
        assert!(matches!(
            terminate(0),
            Err(SupervisorError::SignalFailed { pid: 0, .. })
        ));
    }
}
