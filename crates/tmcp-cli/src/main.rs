#![deny(unsafe_code)]
//! `task-mcp` — the thin CLI shell around the stdio transport.
//!
//! Exit codes: 0 success, 1 user/validation error, 2 internal/IO error.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::fs;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use tmcp_archive::ArchiveConfig;
use tmcp_change::FsTemplater;
use tmcp_config::ServerConfig;
use tmcp_ops::Operations;
use tmcp_protocol::StdioServer;
use tmcp_sandbox::Sandbox;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Exit code for user or validation errors.
const EXIT_USER_ERROR: u8 = 1;
/// Exit code for internal or IO errors.
const EXIT_INTERNAL_ERROR: u8 = 2;

#[derive(Parser, Debug)]
#[command(name = "task-mcp", version, about = "Task MCP change-management server")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Manage the stdio transport.
    Stdio {
        #[command(subcommand)]
        command: StdioCommands,
    },
}

#[derive(Subcommand, Debug)]
enum StdioCommands {
    /// Serve line-framed JSON-RPC on stdin/stdout.
    Start {
        /// Sandbox root (defaults to WORKING_DIRECTORY, then the CWD).
        #[arg(long)]
        working_directory: Option<PathBuf>,

        /// Log level: debug | info | warn | error.
        #[arg(long)]
        log_level: Option<String>,

        /// Development mode: debug logging.
        #[arg(long)]
        dev: bool,

        /// Detach into the background and return immediately.
        #[arg(long)]
        background: bool,

        /// Record the serving process's pid here.
        #[arg(long)]
        pid_file: Option<PathBuf>,
    },

    /// Stop a background server via its pid file.
    Stop {
        /// Pid file written by `stdio start`.
        #[arg(long)]
        pid_file: Option<PathBuf>,
    },

    /// Report whether a background server is running.
    Status {
        /// Pid file written by `stdio start`.
        #[arg(long)]
        pid_file: Option<PathBuf>,
    },
}

/// Default pid-file location relative to the working directory.
const DEFAULT_PID_FILE: &str = ".task-mcp.pid";

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    match cli.command {
        Commands::Stdio { command } => match command {
            StdioCommands::Start {
                working_directory,
                log_level,
                dev,
                background,
                pid_file,
            } => cmd_start(working_directory, log_level, dev, background, pid_file).await,
            StdioCommands::Stop { pid_file } => cmd_stop(pid_file),
            StdioCommands::Status { pid_file } => cmd_status(pid_file),
        },
    }
}

async fn cmd_start(
    working_directory: Option<PathBuf>,
    log_level: Option<String>,
    dev: bool,
    background: bool,
    pid_file: Option<PathBuf>,
) -> ExitCode {
    let config = match ServerConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("task-mcp: {e}");
            return ExitCode::from(EXIT_USER_ERROR);
        }
    };
    let working_directory = working_directory.unwrap_or_else(|| config.working_directory.clone());
    let level = if dev {
        "debug".to_string()
    } else {
        log_level.unwrap_or_else(|| config.log_level.clone())
    };

    if background {
        return match spawn_background(&working_directory, &level, pid_file.as_deref()) {
            Ok(pid) => {
                println!("started (pid {pid})");
                ExitCode::SUCCESS
            }
            Err(e) => {
                eprintln!("task-mcp: cannot start background server: {e:#}");
                ExitCode::from(EXIT_INTERNAL_ERROR)
            }
        };
    }

    // Logs go to stderr; stdout belongs to the protocol.
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(format!("tmcp={level}")))
        .with_writer(std::io::stderr)
        .init();

    match serve(&working_directory, &config, pid_file.as_deref()).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("task-mcp: {e:#}");
            ExitCode::from(EXIT_INTERNAL_ERROR)
        }
    }
}

async fn serve(
    working_directory: &Path,
    config: &ServerConfig,
    pid_file: Option<&Path>,
) -> Result<()> {
    let sandbox = Sandbox::new(working_directory)
        .with_context(|| format!("open sandbox at {}", working_directory.display()))?;
    let archive_config = ArchiveConfig {
        task_mcp_version: config.task_mcp_version.clone(),
        ..ArchiveConfig::default()
    };
    let ops = Arc::new(Operations::new(
        sandbox,
        Arc::new(FsTemplater::new()),
        archive_config,
    ));

    let _pid_guard = pid_file
        .map(|path| PidFile::write(path))
        .transpose()
        .context("write pid file")?;

    info!(sandbox = %working_directory.display(), "stdio server ready");
    StdioServer::new(ops, config.max_response_bytes())
        .run_stdio()
        .await
        .context("stdio transport")?;
    Ok(())
}

/// Re-exec this binary detached, minus `--background`.
fn spawn_background(
    working_directory: &Path,
    level: &str,
    pid_file: Option<&Path>,
) -> Result<u32> {
    let exe = std::env::current_exe().context("locate current executable")?;
    let pid_path = pid_file
        .map(Path::to_path_buf)
        .unwrap_or_else(|| working_directory.join(DEFAULT_PID_FILE));

    let mut command = std::process::Command::new(exe);
    command
        .arg("stdio")
        .arg("start")
        .arg("--working-directory")
        .arg(working_directory)
        .arg("--log-level")
        .arg(level)
        .arg("--pid-file")
        .arg(&pid_path)
        .stdin(std::process::Stdio::inherit())
        .stdout(std::process::Stdio::inherit())
        .stderr(std::process::Stdio::inherit());

    let child = command.spawn().context("spawn background server")?;
    Ok(child.id())
}

fn cmd_stop(pid_file: Option<PathBuf>) -> ExitCode {
    let path = pid_path_or_default(pid_file);
    let Some(pid) = read_pid(&path) else {
        eprintln!("task-mcp: no server recorded at {}", path.display());
        return ExitCode::from(EXIT_USER_ERROR);
    };

    if !signal_process(pid, true) {
        eprintln!("task-mcp: pid {pid} is not running; removing stale pid file");
        let _ = fs::remove_file(&path);
        return ExitCode::from(EXIT_USER_ERROR);
    }
    let _ = fs::remove_file(&path);
    println!("stopped (pid {pid})");
    ExitCode::SUCCESS
}

fn cmd_status(pid_file: Option<PathBuf>) -> ExitCode {
    let path = pid_path_or_default(pid_file);
    let Some(pid) = read_pid(&path) else {
        println!("not running");
        return ExitCode::from(EXIT_USER_ERROR);
    };
    if signal_process(pid, false) {
        println!("running (pid {pid})");
        ExitCode::SUCCESS
    } else {
        println!("not running (stale pid file for {pid})");
        ExitCode::from(EXIT_USER_ERROR)
    }
}

fn pid_path_or_default(pid_file: Option<PathBuf>) -> PathBuf {
    pid_file.unwrap_or_else(|| PathBuf::from(DEFAULT_PID_FILE))
}

fn read_pid(path: &Path) -> Option<i32> {
    fs::read_to_string(path).ok()?.trim().parse().ok()
}

/// Signal `pid`: SIGTERM when `terminate`, else the null signal (existence
/// probe). Returns whether the process was reachable.
#[cfg(unix)]
fn signal_process(pid: i32, terminate: bool) -> bool {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;
    let signal = terminate.then_some(Signal::SIGTERM);
    kill(Pid::from_raw(pid), signal).is_ok()
}

#[cfg(not(unix))]
fn signal_process(_pid: i32, _terminate: bool) -> bool {
    false
}

/// Writes the current pid on creation and removes the file on drop.
struct PidFile {
    path: PathBuf,
}

impl PidFile {
    fn write(path: &Path) -> Result<Self> {
        fs::write(path, format!("{}\n", std::process::id()))
            .with_context(|| format!("write {}", path.display()))?;
        Ok(Self {
            path: path.to_path_buf(),
        })
    }
}

impl Drop for PidFile {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}
