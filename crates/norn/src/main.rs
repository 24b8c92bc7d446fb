//! # norn: process-per-task interval scheduler
//!
//! Usage:
//!   norn monitor                               # supervise one worker per enabled task
//!   norn register norn.echo --interval-secs 60 # schedule a registered function
//!   norn list                                  # show tasks of the environment
//!   norn logs 3                                # show retained execution logs
//!
//! `norn worker <id>` is what the monitor spawns; it is rarely run by hand.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use norn_core::config::NornConfig;
use norn_scheduler::{
    run_once, CommandLauncher, Monitor, Store, SystemClock, Worker, WorkerSettings,
};
use tracing::{error, info, warn};

mod commands;
mod tasks;

#[derive(Parser)]
#[command(name = "norn", version, about = "Process-per-task interval scheduler")]
struct Cli {
    /// Config file (default: ~/.norn/norn.toml)
    #[arg(long, global = true, env = "NORN_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start and supervise one worker process per enabled task
    Monitor,
    /// Run the worker loop for a single task
    Worker { task_id: i64 },
    /// Schedule a registered function
    Register {
        function: String,
        /// Seconds between executions
        #[arg(long)]
        interval_secs: u64,
        /// Display name (defaults to one derived from the function key)
        #[arg(long)]
        name: Option<String>,
        /// Create the task disabled
        #[arg(long)]
        disabled: bool,
    },
    /// List tasks of the configured environment
    List {
        #[arg(long)]
        json: bool,
    },
    Enable { task_id: i64 },
    Disable { task_id: i64 },
    /// Ask a task's worker to release its lease
    Stop { task_id: i64 },
    /// Show the retained execution logs of a task
    Logs {
        task_id: i64,
        #[arg(long)]
        json: bool,
    },
    /// Execute a function once, now, outside the schedule
    Run { function: String },
    /// List registered functions
    Functions,
}

impl Command {
    fn runs_scheduler(&self) -> bool {
        matches!(self, Command::Monitor | Command::Worker { .. })
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "norn=info,norn_scheduler=info".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    // load config: --config > NORN_CONFIG env > ~/.norn/norn.toml
    let config_path = cli.config.as_ref().map(|p| p.to_string_lossy().into_owned());
    let config = match NornConfig::load(config_path.as_deref()) {
        Ok(config) => config,
        // Defaults could point the scheduler at another environment's tasks.
        Err(e) if cli.command.runs_scheduler() => {
            error!(code = e.code(), "Config load failed: {e}");
            return Err(e.into());
        }
        Err(e) => {
            warn!(code = e.code(), "Config load failed ({}), using defaults", e);
            NornConfig::default()
        }
    };

    config.database.ensure_parent_dir()?;
    let registry = Arc::new(tasks::builtin_registry());
    let env = config.environment.clone();
    let mut stdout = std::io::stdout();

    match cli.command {
        Command::Monitor => run_monitor(config, cli.config).await?,
        Command::Worker { task_id } => {
            let settings = WorkerSettings::from(&config.scheduler);
            let outcome = tokio::task::spawn_blocking(move || {
                let store = Store::open(&config.database)?;
                let mut worker = Worker::load(
                    &store,
                    registry,
                    Arc::new(SystemClock),
                    settings,
                    task_id,
                    &config.environment,
                )?;
                worker.run()
            })
            .await?;

            // Scheduler exits all share one code; an Err here means a broken setup.
            match outcome {
                Ok(exit) => std::process::exit(exit.code()),
                Err(e) => {
                    error!(task_id, "worker failed: {e}");
                    return Err(e.into());
                }
            }
        }
        Command::Register {
            function,
            interval_secs,
            name,
            disabled,
        } => {
            let store = Store::open(&config.database)?;
            commands::register(
                &mut stdout,
                &store,
                &registry,
                &env,
                &function,
                interval_secs,
                name,
                disabled,
            )?;
        }
        Command::List { json } => {
            let store = Store::open(&config.database)?;
            commands::list(&mut stdout, &store, &env, json)?;
        }
        Command::Enable { task_id } => {
            let store = Store::open(&config.database)?;
            commands::set_disabled(&mut stdout, &store, &env, task_id, false)?;
        }
        Command::Disable { task_id } => {
            let store = Store::open(&config.database)?;
            commands::set_disabled(&mut stdout, &store, &env, task_id, true)?;
        }
        Command::Stop { task_id } => {
            let store = Store::open(&config.database)?;
            commands::stop(&mut stdout, &store, &env, task_id)?;
        }
        Command::Logs { task_id, json } => {
            let store = Store::open(&config.database)?;
            commands::logs(&mut stdout, &store, &env, task_id, json)?;
        }
        Command::Run { function } => {
            let store = Store::open(&config.database)?;
            let run = run_once(
                &store,
                registry,
                Arc::new(SystemClock),
                &env,
                config.scheduler.keep_logs,
                &function,
                &mut stdout,
            )?;
            if let Some(message) = run.error {
                anyhow::bail!("{function} failed: {message}");
            }
        }
        Command::Functions => commands::functions(&mut stdout, &registry)?,
    }

    Ok(())
}

async fn run_monitor(config: NornConfig, config_path: Option<PathBuf>) -> anyhow::Result<()> {
    info!(path = %config.database.path, environment = %config.environment, "opening SQLite database");
    let store = Store::open(&config.database)?;
    let launcher = CommandLauncher::current_exe(config_path)?;
    let monitor = Monitor::new(
        store,
        Box::new(launcher),
        config.environment.clone(),
        config.scheduler.monitor_tick(),
    );

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let monitor_task = tokio::spawn(monitor.run(shutdown_rx));

    shutdown_signal().await;
    let _ = shutdown_tx.send(true);
    monitor_task.await?;
    Ok(())
}

/// Resolves on Ctrl+C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("cannot listen for Ctrl+C: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!("cannot listen for SIGTERM: {e}");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C"),
        _ = terminate => info!("Received SIGTERM"),
    }
}
