//! Scheduler process entry point.
//!
//! No argument: daemon mode with cron triggers. `--test`: the same jobs on
//! short intervals for CI. `--once`: one reconciliation plus a report, then
//! exit. SIGINT/SIGTERM start a graceful shutdown with a bounded wait for
//! the in-flight job.

use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, warn};

use bookwatch::config::Config;
use bookwatch::scheduler::{SchedulerMode, SchedulerService};
use bookwatch::store::Store;

/// How long a shutdown waits for an in-flight job before forcing exit.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

#[derive(Parser, Debug)]
#[command(name = "bookwatch", about = "Catalog mirror scheduler and change detector")]
struct Args {
    /// Run jobs on short intervals (2/4/10/15 minutes) instead of cron.
    #[arg(long)]
    test: bool,

    /// Run one reconciliation and report, then exit.
    #[arg(long)]
    once: bool,
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut term = match signal(SignalKind::terminate()) {
            Ok(term) => term,
            Err(e) => {
                warn!(error = %e, "failed to install SIGTERM handler");
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = term.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let config = Config::from_env().context("invalid configuration")?;
    bookwatch::logging::init(&config)?;

    let args = Args::parse();
    let mode = if args.once {
        SchedulerMode::Once
    } else if args.test {
        SchedulerMode::TestInterval
    } else {
        SchedulerMode::Daemon
    };

    info!(?mode, database = %config.database_path.display(), "bookwatch starting");

    let store = Store::open(&config.database_path).context("failed to open store")?;
    let service = SchedulerService::new(config, store)?;

    if mode != SchedulerMode::Once {
        let shutdown_service = service.clone();
        tokio::spawn(async move {
            shutdown_signal().await;
            shutdown_service.shutdown();
            // Bounded wait: if a job is still draining after the grace
            // period, leave anyway.
            tokio::time::sleep(SHUTDOWN_GRACE).await;
            warn!("shutdown grace period elapsed, exiting");
            std::process::exit(0);
        });
    }

    service.run(mode).await?;
    info!("bookwatch stopped");
    Ok(())
}
