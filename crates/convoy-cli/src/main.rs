//! Convoy daemon and admin CLI.

use std::sync::Arc;

use clap::{Parser, Subcommand};
use convoy_batcher::{BatchSweeper, CommitResolver, Deduplicator, GitVcs, Ingestor};
use convoy_config::SystemConfig;
use convoy_core::ResourceId;
use convoy_core::event::OutboundEvent;
use convoy_core::job::RequestedAction;
use convoy_db::{
    JobStore, PgBundleStore, PgHostStore, PgJobStore, PgSourceStore, PgTriggerStore, create_pool,
    run_migrations,
};
use convoy_scheduler::{HostRunner, StatusReporter};
use sqlx::PgPool;
use tokio::sync::mpsc;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "convoyd")]
#[command(about = "Convoy CI orchestrator", long_about = None)]
struct Cli {
    /// Path to the system configuration file
    #[arg(long, env = "CONVOY_CONFIG", default_value = "convoy.kdl")]
    config: String,

    /// Database connection string, overrides the configuration file
    #[arg(long, env = "DATABASE_URL")]
    database_url: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run database migrations
    Migrate,
    /// Run the batch sweeper loop
    Batcher,
    /// Run a host scheduling loop
    Host {
        /// Host name to register and schedule under
        #[arg(long, env = "HOSTNAME")]
        name: String,
    },
    /// Show hosts and the jobs they own
    Status {
        /// Also show batch states for a bundle id
        #[arg(long)]
        bundle: Option<String>,
    },
    /// Open a batch for a bundle even when builds are disabled
    ForceBuild {
        /// Bundle id
        bundle: String,
    },
    /// Rebuild a slot's job from the same inputs
    Rebuild {
        /// Job slot id
        slot: String,
    },
    /// Flag a job for kill on its host's next loop turn
    Kill {
        /// Job id
        job: String,
    },
    /// Bring a stopped job back up
    WakeUp {
        /// Job id
        job: String,
    },
    /// Validate a configuration file
    Validate {
        #[arg(default_value = "convoy.kdl")]
        path: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let mut config = SystemConfig::load(&cli.config)?;
    if let Some(database_url) = cli.database_url.clone() {
        config.database_url = database_url;
    }

    match cli.command {
        Commands::Migrate => {
            let pool = create_pool(&config.database_url).await?;
            run_migrations(&pool).await?;
            info!("migrations applied");
        }
        Commands::Batcher => {
            let pool = create_pool(&config.database_url).await?;
            let sweeper = build_sweeper(&pool, &config);
            sweeper.run().await;
        }
        Commands::Host { name } => {
            let pool = create_pool(&config.database_url).await?;
            let runner = HostRunner::new(
                name,
                Arc::new(PgJobStore::new(pool.clone())),
                Arc::new(PgBundleStore::new(pool.clone())),
                Arc::new(PgHostStore::new(pool)),
                config.host.clone(),
                config.scheduler.clone(),
                spawn_event_logger(),
            );
            runner.run().await;
        }
        Commands::Status { bundle } => {
            let pool = create_pool(&config.database_url).await?;
            let reporter = StatusReporter::new(
                Arc::new(PgBundleStore::new(pool.clone())),
                Arc::new(PgJobStore::new(pool.clone())),
                Arc::new(PgHostStore::new(pool)),
                config.scheduler.sticky_retain,
            );
            for host in reporter.hosts().await? {
                let flags = if host.degraded { " [degraded]" } else { "" };
                println!("{} (workers={}){}", host.name, host.nb_workers, flags);
                for job in reporter.host_jobs(&host.name).await? {
                    println!("  {} {}", job.id, job.state.as_str());
                }
                for job in reporter.eviction_candidates(&host.name).await? {
                    println!("  {} eviction candidate", job.id);
                }
            }
            if let Some(bundle) = bundle {
                let bundle_id: ResourceId = bundle.parse()?;
                for batch in reporter.bundle_batches(bundle_id).await? {
                    println!("batch {} {}", batch.id, batch.state.as_str());
                }
            }
        }
        Commands::Rebuild { slot } => {
            let pool = create_pool(&config.database_url).await?;
            let sweeper = build_sweeper(&pool, &config);
            let slot_id: ResourceId = slot.parse()?;
            match sweeper.rebuild(slot_id, chrono::Utc::now()).await? {
                Some(job_id) => info!(job = %job_id, "rebuild created"),
                None => info!("slot has no job to rebuild"),
            }
        }
        Commands::ForceBuild { bundle } => {
            let pool = create_pool(&config.database_url).await?;
            let ingestor = Ingestor::new(
                Arc::new(PgSourceStore::new(pool.clone())),
                Arc::new(PgBundleStore::new(pool)),
            );
            let bundle_id: ResourceId = bundle.parse()?;
            ingestor.force_build(bundle_id, chrono::Utc::now()).await?;
        }
        Commands::Kill { job } => {
            let pool = create_pool(&config.database_url).await?;
            let job_id: ResourceId = job.parse()?;
            PgJobStore::new(pool).request_action(job_id, RequestedAction::Kill).await?;
            info!(job = %job_id, "kill requested");
        }
        Commands::WakeUp { job } => {
            let pool = create_pool(&config.database_url).await?;
            let job_id: ResourceId = job.parse()?;
            PgJobStore::new(pool).request_action(job_id, RequestedAction::WakeUp).await?;
            info!(job = %job_id, "wake-up requested");
        }
        Commands::Validate { path } => {
            let config = SystemConfig::load(&path)?;
            println!("configuration ok");
            println!("  database {}", config.database_url);
            println!("  quiet window {}s", config.batch.quiet_window_secs);
            println!(
                "  host defaults: workers={} running-max={}",
                config.host.workers, config.host.running_max
            );
        }
    }

    Ok(())
}

fn build_sweeper(pool: &PgPool, config: &SystemConfig) -> BatchSweeper {
    let source = Arc::new(PgSourceStore::new(pool.clone()));
    let bundles = Arc::new(PgBundleStore::new(pool.clone()));
    let triggers = Arc::new(PgTriggerStore::new(pool.clone()));
    let jobs = Arc::new(PgJobStore::new(pool.clone()));
    let vcs = Arc::new(GitVcs::new(config.vcs.root.clone(), source.clone()));
    let resolver = CommitResolver::new(source, bundles.clone(), vcs);
    let dedup = Deduplicator::new(jobs.clone());
    BatchSweeper::new(
        bundles,
        triggers,
        jobs,
        resolver,
        dedup,
        config.batch.clone(),
        spawn_event_logger(),
    )
}

/// Outbound events are consumed by external collaborators; the daemon just
/// surfaces them in the log.
fn spawn_event_logger() -> mpsc::Sender<OutboundEvent> {
    let (tx, mut rx) = mpsc::channel(256);
    tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            match event {
                OutboundEvent::JobReady { job_id, params } => {
                    info!(job = %job_id, fingerprint = %params.fingerprint(), "job ready");
                }
                OutboundEvent::HostAssignment { job_id, host } => {
                    info!(job = %job_id, host = %host, "job assigned");
                }
            }
        }
    });
    tx
}
