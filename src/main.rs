//! `armctl`: runs the arm controller or feeds it tasks.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use liquid_arm::channel::{open_output, CommandChannel, RecordingChannel};
use liquid_arm::client::{load_task_file, send_tasks};
use liquid_arm::config::{Settings, DEFAULT_CONFIG_PATH};
use liquid_arm::executor::{ExecutionLoop, ExecutionSummary};
use liquid_arm::queue::task_queue;
use liquid_arm::resolver::PlateRegistry;
use liquid_arm::server::spawn_server;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// Liquid-handling arm controller
#[derive(Parser)]
#[command(name = "armctl")]
#[command(about = "Queue, ingest and execute robot arm tasks", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the ingestion server and the execution loop
    Serve {
        /// Configuration file
        #[arg(long, default_value = DEFAULT_CONFIG_PATH)]
        config: PathBuf,

        /// Keep motion commands in memory instead of writing them to hardware
        #[arg(long)]
        dry_run: bool,
    },

    /// Send task records from a JSON file to a running server
    Send {
        /// Server address, host:port
        #[arg(long, default_value = "127.0.0.1:4500")]
        addr: String,

        /// JSON file holding one task record or an array of them
        file: PathBuf,
    },

    /// Load and validate the configuration, then print it
    CheckConfig {
        /// Configuration file
        #[arg(long, default_value = DEFAULT_CONFIG_PATH)]
        config: PathBuf,
    },
}

// RUST_LOG wins over the configured level
fn init_tracing(default_level: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Serve { config, dry_run } => {
            let settings = Settings::load_from(&config)
                .with_context(|| format!("Failed to load configuration from {}", config.display()))?;
            init_tracing(&settings.application.log_level);
            serve(settings, dry_run).await
        }
        Commands::Send { addr, file } => {
            init_tracing("info");
            let tasks = load_task_file(&file)
                .await
                .with_context(|| format!("Failed to read tasks from {}", file.display()))?;
            let sent = send_tasks(&addr, &tasks)
                .await
                .with_context(|| format!("Failed to send tasks to {}", addr))?;
            info!(sent, addr = %addr, "Tasks sent");
            Ok(())
        }
        Commands::CheckConfig { config } => {
            let settings = Settings::load_from(&config)
                .with_context(|| format!("Invalid configuration in {}", config.display()))?;
            let rendered =
                toml::to_string_pretty(&settings).context("Failed to render configuration")?;
            println!("{}", rendered);
            println!(
                "# OK: {} plate(s), listening on {}",
                settings.plates.len(),
                settings.server.bind
            );
            Ok(())
        }
    }
}

async fn serve(settings: Settings, dry_run: bool) -> Result<()> {
    info!(name = %settings.application.name, "Starting arm controller");

    let registry = Arc::new(PlateRegistry::from_layouts(settings.plates.clone()));
    let recorder = RecordingChannel::new();
    let channel: Box<dyn CommandChannel> = if dry_run {
        info!("Dry run: motion commands are recorded, not sent");
        Box::new(recorder.clone())
    } else {
        open_output(&settings.hardware)
            .await
            .context("Failed to open command output")?
    };

    let (sender, mut receiver) = task_queue(settings.queue.capacity);
    let mut executor = ExecutionLoop::new(settings.home(), registry, channel);
    let (addr, shutdown, server) = spawn_server(&settings.server, settings.wire_limits(), sender)
        .await
        .context("Failed to start ingestion server")?;
    info!(%addr, "Accepting tasks");

    let mut execution = tokio::spawn(async move { executor.run(&mut receiver).await });

    let outcome = tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            signal.context("Failed to listen for Ctrl-C")?;
            info!("Shutdown requested; no longer accepting connections");
            let _ = shutdown.send(());
            server.await.context("Ingestion server task failed")?;
            tokio::select! {
                done = &mut execution => done,
                _ = tokio::signal::ctrl_c() => {
                    info!("Second Ctrl-C; abandoning queued tasks");
                    execution.abort();
                    return Ok(());
                }
            }
        }
        done = &mut execution => {
            let _ = shutdown.send(());
            done
        }
    };

    let summary: ExecutionSummary = match outcome.context("Execution loop panicked")? {
        Ok(summary) => summary,
        Err(e) => {
            error!(error = %e, "Execution stopped");
            return Err(e.into());
        }
    };

    if dry_run {
        for line in recorder.lines() {
            info!(command = %line, "Dry-run command");
        }
    }
    info!(
        completed = summary.completed,
        failed = summary.failed,
        commands = summary.commands_written,
        "Arm controller stopped"
    );
    Ok(())
}
