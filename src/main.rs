mod config;
mod data_dir;
mod logging;
mod report;
mod retry;
mod session;
mod signals;
mod status;
mod supervisor;

use clap::{Parser, Subcommand};
use config::{HarnessConfig, Overrides};
use data_dir::DataDir;
use report::StatusReport;
use session::SessionManager;
use std::path::PathBuf;
use std::process::ExitCode;
use supervisor::Supervisor;
use tokio_util::sync::CancellationToken;

/// Keeps the replay capture pipeline's workers alive and drives each
/// replay from the queue through launch, play and archival.
#[derive(Parser, Debug)]
#[command(name = "nexus-harness", version, about)]
pub struct Cli {
    /// Config file path
    #[arg(short, long, default_value = "nexus.toml", global = true)]
    config: PathBuf,

    /// Validate config and print resolved settings, don't run
    #[arg(long, global = true)]
    dry_run: bool,

    /// Root of the queue/active/completed/corrupt/state layout
    #[arg(long, env = "NEXUS_BASE_DIR", global = true)]
    base_dir: Option<PathBuf>,

    /// Comma-separated names of the children to spawn (default: all)
    #[arg(long, env = "ORCH_SPAWN", value_delimiter = ',', global = true)]
    spawn: Option<Vec<String>>,

    /// Append child stdout/stderr to state/logs/
    #[arg(long, env = "ORCH_CHILD_LOGS", value_parser = clap::builder::BoolishValueParser::new(), global = true)]
    child_logs: Option<bool>,

    /// Consecutive capture successes needed to call a launch good
    #[arg(long, env = "SESSION_LAUNCH_SUCCESS_FRAMES", global = true)]
    launch_success_frames: Option<u32>,

    /// Seconds a launch may take before it is aborted
    #[arg(long, env = "SESSION_LAUNCH_TIMEOUT", global = true)]
    launch_timeout: Option<f64>,

    /// Seconds a session stays ACTIVE
    #[arg(long, env = "SESSION_ACTIVE_MAX", global = true)]
    active_duration: Option<f64>,

    /// Log verbosity (trace, debug, info, warn/warning, error/critical, off)
    #[arg(long, env = "LOG_LEVEL", global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug, Clone, Copy, PartialEq, Eq)]
enum Command {
    /// Run the process supervisor
    Supervise,
    /// Run the session lifecycle manager
    Session,
    /// Print the persisted fleet and session state and exit
    Status {
        /// Print the raw documents as JSON
        #[arg(long)]
        json: bool,
    },
}

impl Command {
    /// Name used for the service's log file.
    fn service(self) -> Option<&'static str> {
        match self {
            Command::Supervise => Some("orchestrator"),
            Command::Session => Some("session-manager"),
            Command::Status { .. } => None,
        }
    }
}

impl Cli {
    fn overrides(&self) -> Overrides {
        Overrides {
            base_dir: self.base_dir.clone(),
            spawn: self.spawn.clone(),
            capture_child_output: self.child_logs,
            launch_success_frames: self.launch_success_frames,
            launch_timeout_secs: self.launch_timeout,
            active_duration_secs: self.active_duration,
            log_level: self.log_level.clone(),
        }
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let mut config = match HarnessConfig::load(&cli.config) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Error: {e}");
            return ExitCode::FAILURE;
        }
    };
    config.apply(cli.overrides());
    let data_dir = DataDir::new(config.storage.base_dir.clone());

    if let Command::Status { json } = cli.command {
        return print_status(&data_dir, json);
    }
    let service = cli.command.service().unwrap_or("nexus-harness");

    let log_file = if cli.dry_run {
        None
    } else {
        if let Err(e) = data_dir.init() {
            eprintln!(
                "Error: failed to create state directories under {}: {e}",
                data_dir.root().display()
            );
            return ExitCode::FAILURE;
        }
        Some(data_dir.service_log(service))
    };
    logging::init(&config.logging, log_file.as_deref());
    tracing::debug!(?cli, "parsed CLI arguments");

    if let Err(e) = config.validate() {
        tracing::error!(error = %e, "startup failed");
        return ExitCode::FAILURE;
    }

    if cli.dry_run {
        print_settings(&config, cli.command);
        return ExitCode::SUCCESS;
    }

    let cancel = CancellationToken::new();
    let _signals = signals::install(cancel.clone());

    match cli.command {
        Command::Supervise => {
            Supervisor::from_config(&config, &data_dir).run(cancel).await;
            ExitCode::SUCCESS
        }
        Command::Session => {
            let manager = match SessionManager::from_config(&config.session, data_dir) {
                Ok(m) => m,
                Err(e) => {
                    tracing::error!(error = %e, "invalid session.queue_pattern");
                    return ExitCode::FAILURE;
                }
            };
            match manager.run(cancel).await {
                Ok(()) => ExitCode::SUCCESS,
                Err(e) => {
                    tracing::error!(error = %e, "session manager startup failed");
                    ExitCode::FAILURE
                }
            }
        }
        Command::Status { .. } => ExitCode::SUCCESS,
    }
}

fn print_status(data_dir: &DataDir, json: bool) -> ExitCode {
    let report = StatusReport::load(data_dir);
    if json {
        match report.to_json() {
            Ok(s) => println!("{s}"),
            Err(e) => {
                eprintln!("Error: {e}");
                return ExitCode::FAILURE;
            }
        }
    } else {
        print!("{}", report.render(status::now_ts()));
    }
    ExitCode::SUCCESS
}

fn print_settings(config: &HarnessConfig, command: Command) {
    println!("nexus-harness v{}", env!("CARGO_PKG_VERSION"));
    println!("Base dir: {}", config.storage.base_dir.display());
    println!("Log level: {} ({:?})", config.logging.level, config.logging.format);
    match command {
        Command::Supervise => {
            let sup = &config.supervisor;
            println!(
                "Restarts: max {}, backoff {}s x{} up to {}s",
                sup.max_restarts, sup.base_backoff_secs, sup.backoff_factor, sup.max_backoff_secs
            );
            println!("Tick: {}s, shutdown grace {}s", sup.interval_secs, sup.shutdown_grace_secs);
            for child in config.selected_children() {
                println!(
                    "  {:<16} {} (cwd {})",
                    child.name,
                    child.command.join(" "),
                    config.child_cwd(&child).display()
                );
            }
        }
        Command::Session => {
            let s = &config.session;
            println!("Queue pattern: {}", s.queue_pattern);
            println!(
                "Launch: {} success frames within {}s, unrecoverable {:?}",
                s.launch_success_frames, s.launch_timeout_secs, s.unrecoverable_reasons
            );
            println!(
                "Active {}s, ended delay {}s, poll {}s",
                s.active_duration_secs, s.ended_delay_secs, s.poll_interval_secs
            );
            println!("Launcher: {}", s.launcher.join(" "));
        }
        Command::Status { .. } => {}
    }
    println!("Dry run mode, config validated, not running.");
}
