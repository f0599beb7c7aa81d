use std::path::PathBuf;

/// Reset SIGPIPE to default behavior so piping (e.g. `oxcore volume orphans | jq`)
/// exits cleanly instead of panicking on broken pipe.
#[cfg(unix)]
fn reset_sigpipe() {
    unsafe {
        libc::signal(libc::SIGPIPE, libc::SIG_DFL);
    }
}

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use oxcore::config::RuntimeConfig;
use oxcore::state::models::{container_type, ContainerMetadata};
use oxcore::Core;

/// oxcore - resource lifecycle core for a CI control plane
#[derive(Parser)]
#[command(name = "oxcore", version, about, long_about = None)]
struct Cli {
    /// Path to a YAML config file; falls back to defaults and OXCORE_* env vars.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the garbage collector in the foreground until interrupted.
    Serve,

    /// Manage worker registration.
    Worker {
        #[command(subcommand)]
        command: WorkerCommands,
    },

    /// Container lifecycle operations.
    Container {
        #[command(subcommand)]
        command: ContainerCommands,
    },

    /// Volume lifecycle operations.
    Volume {
        #[command(subcommand)]
        command: VolumeCommands,
    },

    /// Run garbage collection once and report what was reaped.
    Gc,

    /// Named symmetric secrets (CSRF signing, etc.).
    Key {
        #[command(subcommand)]
        command: KeyCommands,
    },
}

#[derive(Subcommand)]
enum KeyCommands {
    /// Return the key's value, generating a fresh one if it doesn't exist yet.
    GetOrCreate { name: String },
}

#[derive(Subcommand)]
enum WorkerCommands {
    /// Record a heartbeat from a worker, as if it just checked in.
    Heartbeat {
        name: String,
        address: String,
        #[arg(long, default_value = "linux")]
        platform: String,
        #[arg(long)]
        tags: Vec<String>,
        #[arg(long)]
        team: Option<i64>,
    },
    /// List known workers.
    List,
}

#[derive(Subcommand)]
enum ContainerCommands {
    /// Find an existing container for this (worker, team, step) or create one.
    FindOrCreate {
        worker: String,
        team: i64,
        #[arg(long)]
        step: String,
        #[arg(long, default_value = "task")]
        container_type: String,
        #[arg(long)]
        build: Option<i64>,
    },
    /// Mark a container as reusable until its final TTL elapses.
    Release { id: i64 },
}

#[derive(Subcommand)]
enum VolumeCommands {
    /// Find or create the mount volume for a container.
    FindOrCreate {
        worker: String,
        team: i64,
        container: i64,
        mount_path: String,
    },
    /// Look up a volume by its handle.
    Get { handle: String },
    /// List volumes with no parent reference — garbage collector candidates.
    Orphans,
}

#[tokio::main]
async fn main() -> Result<()> {
    #[cfg(unix)]
    reset_sigpipe();

    let cli = Cli::parse();

    let filter = if cli.verbose { EnvFilter::new("debug") } else { EnvFilter::new("info") };
    tracing_subscriber::fmt().with_env_filter(filter).with_target(false).init();

    let config = RuntimeConfig::load(cli.config.as_deref()).context("loading configuration")?;
    let core = Core::connect(config).await.context("connecting to store")?;

    match cli.command {
        Commands::Serve => cmd_serve(&core).await,
        Commands::Worker { command } => cmd_worker(&core, command).await,
        Commands::Container { command } => cmd_container(&core, command).await,
        Commands::Volume { command } => cmd_volume(&core, command).await,
        Commands::Gc => cmd_gc(&core).await,
        Commands::Key { command } => cmd_key(&core, command).await,
    }
}

async fn cmd_serve(core: &Core) -> Result<()> {
    println!("{}", "starting garbage collector".bold().cyan());
    let cancel = CancellationToken::new();
    let collector = core.collector();
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::select! {
        _ = collector.run(cancel.clone()) => {}
        _ = ctrl_c => {
            println!("\n{}", "shutting down".yellow());
            cancel.cancel();
        }
    }
    Ok(())
}

async fn cmd_worker(core: &Core, command: WorkerCommands) -> Result<()> {
    match command {
        WorkerCommands::Heartbeat { name, address, platform, tags, team } => {
            let expires = chrono::Utc::now()
                + chrono::Duration::from_std(core.config.worker_stall_after).unwrap_or_default();
            let worker = core.backend.heartbeat_worker(&name, &address, &platform, &tags, team, expires).await?;
            println!("{} worker '{}' is now {}", "✓".green(), worker.name.bold(), worker.state);
        }
        WorkerCommands::List => {
            let workers = core.backend.list_workers().await?;
            if workers.is_empty() {
                println!("{}", "no workers registered".dimmed());
            }
            for w in workers {
                println!("  {} {} [{}] {}", "-".blue(), w.name.bold(), w.state, w.address.unwrap_or_default());
            }
        }
    }
    Ok(())
}

async fn cmd_container(core: &Core, command: ContainerCommands) -> Result<()> {
    match command {
        ContainerCommands::FindOrCreate { worker, team, step, container_type: ctype, build } => {
            let metadata = ContainerMetadata {
                container_type: normalize_container_type(&ctype),
                step_name: step,
                pipeline_id: None,
                job_id: None,
                attempt: 1,
            };
            let container =
                core.find_or_create_container_for_step(&worker, team, build, None, None, &metadata).await?;
            println!(
                "{} container {} [{}] on {}",
                "✓".green(),
                container.id,
                container.state,
                container.worker_name
            );
        }
        ContainerCommands::Release { id } => {
            core.release_container(id).await?;
            println!("{} container {} released", "✓".green(), id);
        }
    }
    Ok(())
}

async fn cmd_volume(core: &Core, command: VolumeCommands) -> Result<()> {
    match command {
        VolumeCommands::FindOrCreate { worker, team, container, mount_path } => {
            let cancel = CancellationToken::new();
            let volume =
                core.find_or_create_volume_for_mount(&worker, team, container, &mount_path, &cancel).await?;
            println!("{} volume {} [{}] handle={}", "✓".green(), volume.id, volume.state, volume.handle);
        }
        VolumeCommands::Get { handle } => match core.get_volume_by_handle(&handle).await? {
            Some(v) => println!("{} volume {} [{}]", "✓".green(), v.id, v.state),
            None => println!("{}", "no such volume".yellow()),
        },
        VolumeCommands::Orphans => {
            let orphans = core.list_orphaned_volumes().await?;
            if orphans.is_empty() {
                println!("{}", "no orphaned volumes".dimmed());
            }
            for v in orphans {
                println!("  {} {} [{}]", "-".yellow(), v.id, v.state);
            }
        }
    }
    Ok(())
}

async fn cmd_gc(core: &Core) -> Result<()> {
    let cancel = CancellationToken::new();
    core.collector().tick(&cancel).await;
    println!("{}", "garbage collection pass complete".green());
    Ok(())
}

async fn cmd_key(core: &Core, command: KeyCommands) -> Result<()> {
    match command {
        KeyCommands::GetOrCreate { name } => {
            let key = core.get_or_create_key(&name).await?;
            println!("{} {}", "✓".green(), key.value_base64);
        }
    }
    Ok(())
}

fn normalize_container_type(raw: &str) -> String {
    match raw {
        "get" => container_type::GET.to_string(),
        "put" => container_type::PUT.to_string(),
        "check" => container_type::CHECK.to_string(),
        _ => container_type::TASK.to_string(),
    }
}
