//! fuyao-server — manage the Fuyao agent platform server from the terminal.
//!
//! Commands:
//! - `start [--port P] [--host H]`: launch the server in the background and wait for it
//! - `stop`: signal the recorded server and forget it
//! - `status [--port P]`: PID file, process liveness, and HTTP health side by side
//! - `logs [--lines N]`: tail the server log
//! - `restart [--port P] [--host H]`: stop, settle, start
//!
//! Numeric flags that fail to parse, or parse to zero, fall back to the
//! configured defaults.

use std::process::ExitCode;
use std::str::FromStr;

use anyhow::Result;
use clap::error::ErrorKind;
use clap::{CommandFactory, Parser, Subcommand};
use fuyao_supervisor::probe::base_url;
use fuyao_supervisor::{
    LogTail, StartOutcome, StatusReport, StopOutcome, Supervisor, SupervisorConfig,
    SupervisorError,
};
use tracing_subscriber::EnvFilter;

/// fuyao-server — Fuyao agent platform server management
#[derive(Parser)]
#[command(
    name = "fuyao-server",
    version,
    about = "fuyao-server — Fuyao agent platform server management"
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the server in the background
    Start {
        /// Port to serve on [default: 8000]
        #[arg(long)]
        port: Option<String>,
        /// Address to bind [default: 0.0.0.0]
        #[arg(long)]
        host: Option<String>,
    },
    /// Stop the server
    Stop,
    /// Show server status
    Status {
        /// Port to probe [default: 8000]
        #[arg(long)]
        port: Option<String>,
    },
    /// Show recent server log lines
    Logs {
        /// Number of lines [default: 50]
        #[arg(long)]
        lines: Option<String>,
    },
    /// Restart the server
    Restart {
        /// Port to serve on [default: 8000]
        #[arg(long)]
        port: Option<String>,
        /// Address to bind [default: 0.0.0.0]
        #[arg(long)]
        host: Option<String>,
    },
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    // Initialize tracing with env filter (RUST_LOG controls verbosity)
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            match e.kind() {
                ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => {
                    let _ = e.print();
                }
                ErrorKind::InvalidSubcommand => {
                    let unknown = std::env::args().nth(1).unwrap_or_default();
                    println!("Unknown command: {}\n", unknown);
                    print_help();
                }
                _ => print_help(),
            }
            return ExitCode::SUCCESS;
        }
    };

    let Some(command) = cli.command else {
        print_help();
        return ExitCode::SUCCESS;
    };

    match run(command).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("✗ {}", e);
            if let Some(err) = e.downcast_ref::<SupervisorError>() {
                eprintln!("  {}", err.hint());
            }
            ExitCode::FAILURE
        }
    }
}

async fn run(command: Commands) -> Result<()> {
    let config = SupervisorConfig::load()?;
    tracing::debug!(server_dir = %config.server_dir.display(), "config loaded");
    let supervisor = Supervisor::new(config)?;
    let defaults = supervisor.config().clone();

    match command {
        Commands::Start { port, host } => {
            let port = numeric_or(port.as_deref(), defaults.port);
            let host = host.unwrap_or(defaults.host);
            println!("Starting fuyao-server...\n");
            let outcome = supervisor.start(&host, port).await?;
            report_start(&outcome, &host, port)?;
        }
        Commands::Stop => {
            println!("Stopping fuyao-server...\n");
            report_stop(&supervisor.stop().await?);
        }
        Commands::Status { port } => {
            let port = numeric_or(port.as_deref(), defaults.port);
            report_status(&supervisor.status(&defaults.host, port).await?);
        }
        Commands::Logs { lines } => {
            let lines = numeric_or(lines.as_deref(), defaults.log_lines);
            report_logs(&supervisor.logs(lines).await?, lines);
        }
        Commands::Restart { port, host } => {
            let port = numeric_or(port.as_deref(), defaults.port);
            let host = host.unwrap_or(defaults.host);
            println!("Restarting fuyao-server...\n");
            let outcome = supervisor.restart(&host, port).await?;
            report_stop(&outcome.stop);
            report_start(&outcome.start, &host, port)?;
        }
    }

    Ok(())
}

/// Parse a numeric flag, keeping `default` when absent, malformed, or zero.
fn numeric_or<T: FromStr + Default + PartialEq>(raw: Option<&str>, default: T) -> T {
    raw.and_then(|value| value.trim().parse().ok())
        .filter(|value| *value != T::default())
        .unwrap_or(default)
}

fn print_help() {
    let _ = Cli::command().print_help();
    println!();
}

fn report_start(outcome: &StartOutcome, host: &str, port: u16) -> Result<()> {
    match outcome {
        StartOutcome::AlreadyRunning { port, pid } => match pid {
            Some(pid) => println!("✓ Server already running (port {}, PID {})", port, pid),
            None => println!("✓ Server already running (port {})", port),
        },
        StartOutcome::AlreadyTracked(process) => {
            println!(
                "⚠ Server process {} is running but not answering on port {}",
                process.pid, port
            );
            println!("  Check it with: fuyao-server status --port {}", port);
            println!("  Or stop it first: fuyao-server stop");
        }
        StartOutcome::Ready {
            process,
            runtime,
            health,
        } => {
            let url = base_url(host, port);
            println!("✓ Using {}", runtime.describe());
            println!("✓ Started (PID {})", process.pid);
            println!("\n✅ Server ready!");
            println!("   URL:  {}", url);
            println!("   Docs: {}/docs", url);
            if let Some(cwd) = &health.cwd {
                println!("   Workdir: {}", cwd);
            }
        }
        StartOutcome::StillStarting { process, runtime } => {
            println!("✓ Using {}", runtime.describe());
            println!("✓ Started (PID {})", process.pid);
            println!("\n⚠ Server is still starting, check later with: fuyao-server status");
        }
        StartOutcome::ExitedDuringStartup { pid } => {
            anyhow::bail!(
                "server process {} exited during startup; see `fuyao-server logs`",
                pid
            );
        }
    }
    Ok(())
}

fn report_stop(outcome: &StopOutcome) {
    match outcome {
        StopOutcome::AlreadyStopped => println!("ℹ Server is not running"),
        StopOutcome::Stopped {
            pid,
            signal_error: Some(reason),
            ..
        } => {
            println!("⚠ Could not stop process {}: {}", pid, reason);
            println!("  No longer tracking it; check with: fuyao-server status");
        }
        StopOutcome::Stopped {
            pid, exited: true, ..
        } => println!("✓ Stopped server (PID {})", pid),
        StopOutcome::Stopped { pid, .. } => {
            println!("⚠ Sent stop signal to PID {}, but it has not exited yet", pid);
            println!("  No longer tracking it; check with: fuyao-server status");
        }
    }
}

fn report_status(report: &StatusReport) {
    let mark = |ok: bool, yes: &str, no: &str| {
        if ok {
            format!("✓ {}", yes)
        } else {
            format!("✗ {}", no)
        }
    };

    println!("Server status\n");
    println!(
        "PID file: {}",
        report
            .pid
            .map(|pid| pid.to_string())
            .unwrap_or_else(|| "none".to_string())
    );
    println!(
        "Process:  {}",
        mark(report.process_alive, "running", "not running")
    );
    println!(
        "HTTP:     {}",
        mark(report.responding, "responding", "not responding")
    );
    println!("Port:     {}", report.port);
    println!("State:    {}", report.state);
    if let Some(started_at) = report.started_at {
        println!("Since:    {}", started_at.format("%Y-%m-%d %H:%M:%S UTC"));
    }
    if let Some(cwd) = report.health.as_ref().and_then(|h| h.cwd.as_deref()) {
        println!("Workdir:  {}", cwd);
    }
    println!();

    if !report.responding {
        println!("Start the server with: fuyao-server start");
    }
}

fn report_logs(tail: &LogTail, requested: usize) {
    match tail {
        LogTail::NoLogYet => println!("ℹ No logs yet"),
        LogTail::Lines(lines) => {
            println!("Last {} log lines:\n", requested);
            for line in lines {
                println!("{}", line);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_numeric_or_parses_valid_values() {
        assert_eq!(numeric_or(Some("9000"), 8000u16), 9000);
        assert_eq!(numeric_or(Some(" 100 "), 50usize), 100);
    }

    #[test]
    fn test_numeric_or_falls_back_silently() {
        assert_eq!(numeric_or(None, 8000u16), 8000);
        assert_eq!(numeric_or(Some("abc"), 8000u16), 8000);
        assert_eq!(numeric_or(Some("70000"), 8000u16), 8000);
        assert_eq!(numeric_or(Some("-5"), 50usize), 50);
    }

    #[test]
    fn test_numeric_or_treats_zero_as_missing() {
        assert_eq!(numeric_or(Some("0"), 8000u16), 8000);
        assert_eq!(numeric_or(Some(" 0 "), 8000u16), 8000);
        assert_eq!(numeric_or(Some("0"), 50usize), 50);
    }

    #[test]
    fn test_parse_start_flags() {
        let cli = Cli::try_parse_from([
            "fuyao-server",
            "start",
            "--port",
            "9000",
            "--host",
            "127.0.0.1",
        ])
        .unwrap();
        match cli.command {
            Some(Commands::Start { port, host }) => {
                assert_eq!(port.as_deref(), Some("9000"));
                assert_eq!(host.as_deref(), Some("127.0.0.1"));
            }
            _ => panic!("expected start"),
        }
    }

    #[test]
    fn test_malformed_port_still_parses() {
        let cli = Cli::try_parse_from(["fuyao-server", "status", "--port", "eighty"]).unwrap();
        assert!(matches!(cli.command, Some(Commands::Status { port: Some(_) })));
    }

    #[test]
    fn test_unknown_command_is_invalid_subcommand() {
        let err = Cli::try_parse_from(["fuyao-server", "launch"])
            .err()
            .expect("unknown command rejected");
        assert_eq!(err.kind(), ErrorKind::InvalidSubcommand);
    }

    #[test]
    fn test_no_command() {
        let cli = Cli::try_parse_from(["fuyao-server"]).unwrap();
        assert!(cli.command.is_none());
    }

    #[test]
    fn test_help_subcommand_displays_help() {
        let err = Cli::try_parse_from(["fuyao-server", "help"])
            .err()
            .expect("help short-circuits parsing");
        assert_eq!(err.kind(), ErrorKind::DisplayHelp);
    }

    #[test]
    fn test_stop_rejects_flags() {
        assert!(Cli::try_parse_from(["fuyao-server", "stop", "--port", "1"]).is_err());
    }
}
