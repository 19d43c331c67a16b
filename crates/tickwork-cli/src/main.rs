mod demo;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tickwork_core::config::TickworkConfig;
use tickwork_scheduler::{
    FunctionRegistry, MemoryStore, Scheduler, SqliteStore, StoreBridge, TaskId, TaskStore,
};
use tracing::info;

#[derive(Parser)]
#[command(name = "tickwork", about = "Persistent in-process task scheduler")]
struct Cli {
    /// Config file (overrides TICKWORK_CONFIG and ~/.tickwork/tickwork.toml)
    #[arg(short, long, global = true)]
    config: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Schedule the demo tasks and run until interrupted
    Run {
        /// Stop after this long (e.g. "45s", "2m")
        #[arg(long, value_parser = humantime::parse_duration)]
        run_for: Option<Duration>,
    },
    /// Print persisted tasks
    List,
    /// Cancel one persisted task by id
    Cancel { id: String },
    /// Cancel every persisted task
    Clear,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tickwork=info,tickwork_scheduler=info".into()),
        )
        .init();

    let cli = Cli::parse();

    // load config: --config > TICKWORK_CONFIG env > ~/.tickwork/tickwork.toml
    let config_path = cli.config.or_else(|| std::env::var("TICKWORK_CONFIG").ok());
    let config = TickworkConfig::load(config_path.as_deref()).unwrap_or_else(|e| {
        tracing::warn!(code = e.code(), "Config load failed ({}), using defaults", e);
        TickworkConfig::default()
    });

    let store = open_store(&config)?;
    let registry = Arc::new(FunctionRegistry::new());
    demo::register(&registry)?;
    let scheduler = Scheduler::new(Arc::clone(&store), registry, &config.scheduler);

    match cli.command {
        Commands::Run { run_for } => {
            scheduler.start()?;
            demo::schedule(&scheduler)?;
            info!(tasks = scheduler.len(), "demo tasks scheduled");

            let stopper = scheduler.clone();
            tokio::spawn(async move {
                match run_for {
                    Some(limit) => {
                        tokio::select! {
                            _ = shutdown_signal() => {},
                            _ = tokio::time::sleep(limit) => info!("run time elapsed"),
                        }
                    }
                    None => shutdown_signal().await,
                }
                if let Err(e) = stopper.stop() {
                    tracing::warn!(code = e.code(), error = %e, "stop failed");
                }
            });

            scheduler.wait().await;
        }
        Commands::List => {
            let snapshot = StoreBridge::new(store).fetch()?;
            let mut tasks = snapshot.tasks;
            tasks.sort_by(|a, b| a.task.schedule.next_run.cmp(&b.task.schedule.next_run));
            for stored in &tasks {
                let schedule = &stored.task.schedule;
                let kind = if schedule.is_recurring {
                    format!("every {}", humantime::format_duration(schedule.interval))
                } else {
                    "once".to_string()
                };
                println!(
                    "{}  {}({})  {}  next {}",
                    stored.hash,
                    stored.task.function,
                    stored.task.params.join(", "),
                    kind,
                    schedule.next_run.to_rfc3339_opts(chrono::SecondsFormat::Secs, true),
                );
            }
            println!("{} task(s)", tasks.len());
            scheduler.stop()?;
        }
        Commands::Cancel { id } => {
            scheduler.reconcile()?;
            scheduler.cancel(&TaskId::new(id.clone()))?;
            println!("canceled {}", id);
            scheduler.stop()?;
        }
        Commands::Clear => {
            scheduler.reconcile()?;
            let count = scheduler.clear();
            println!("cleared {} task(s)", count);
            scheduler.stop()?;
        }
    }

    info!("tickwork exited cleanly");
    Ok(())
}

fn open_store(config: &TickworkConfig) -> anyhow::Result<Arc<dyn TaskStore>> {
    if config.database.in_memory {
        info!("using in-memory task store");
        return Ok(Arc::new(MemoryStore::new()));
    }
    config.database.ensure_parent_dir()?;
    let store = SqliteStore::open(Path::new(&config.database.path))?;
    Ok(Arc::new(store))
}

/// Wait for SIGINT or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        let mut sigterm =
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(sigterm) => sigterm,
                Err(e) => {
                    tracing::warn!(error = %e, "SIGTERM handler unavailable, waiting for Ctrl-C");
                    let _ = ctrl_c.await;
                    return;
                }
            };
        tokio::select! {
            _ = ctrl_c => {},
            _ = sigterm.recv() => {},
        }
    }

    #[cfg(not(unix))]
    {
        let _ = ctrl_c.await;
    }
}
