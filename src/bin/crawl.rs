//! Full-catalog crawl harness: first-run ingest and bulk restore.

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{error, info};

use bookwatch::config::Config;
use bookwatch::crawler::Crawler;
use bookwatch::fetcher::{BookFetcher, CancelToken};
use bookwatch::store::Store;

#[derive(Parser, Debug)]
#[command(name = "bookwatch-crawl", about = "Walk the full catalog into the mirror")]
struct Args {
    /// Ignore any existing crawl state and start from page 1.
    #[arg(long)]
    no_resume: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let mut config = Config::from_env().context("invalid configuration")?;
    bookwatch::logging::init(&config)?;

    let args = Args::parse();
    if args.no_resume {
        config.resume_on_failure = false;
    }

    let store = Store::open(&config.database_path).context("failed to open store")?;
    let cancel = CancelToken::new();
    let fetcher = Arc::new(BookFetcher::new(&config, cancel.clone())?);

    let signal_cancel = cancel.clone();
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        info!("interrupt received, checkpointing and stopping");
        signal_cancel.cancel();
    });

    let mut crawler = Crawler::new(store, fetcher, &config, cancel);
    let result = crawler.crawl_all_books().await;

    info!(
        success = result.success,
        books = result.books_crawled,
        errors = result.errors.len(),
        duration_secs = result.duration_seconds,
        "crawl summary"
    );
    for message in result.errors.iter().take(20) {
        error!("{message}");
    }

    if result.success {
        Ok(())
    } else {
        std::process::exit(1);
    }
}
