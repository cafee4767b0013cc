//! Fingerprint maintenance utility: inspect, verify, and clean up the
//! fingerprint collection without running a full reconciliation.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use bookwatch::config::Config;
use bookwatch::detection::reconciler::cleanup_orphan_fingerprints;
use bookwatch::fingerprint;
use bookwatch::store::Store;

#[derive(Parser, Debug)]
#[command(name = "bookwatch-fingerprints", about = "Inspect and maintain content fingerprints")]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List every stored fingerprint.
    List,
    /// Show the fingerprint for one book URL.
    Find { url: String },
    /// Delete fingerprints whose book row no longer exists.
    Cleanup,
    /// Show coverage statistics for books vs fingerprints.
    Stats,
}

fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let config = Config::from_env().context("invalid configuration")?;
    bookwatch::logging::init(&config)?;

    let store = Store::open(&config.database_path).context("failed to open store")?;

    match Args::parse().command {
        Command::List => {
            let fingerprints = store.all_fingerprints()?;
            println!("{} fingerprints", fingerprints.len());
            for fp in fingerprints {
                println!(
                    "{}  content={}  updated={}",
                    fp.book_id,
                    &fp.content_hash[..16],
                    fp.updated_at.format("%Y-%m-%d %H:%M:%S")
                );
            }
        }
        Command::Find { url } => {
            let book_id = fingerprint::book_id(&url);
            match store.get_fingerprint(&book_id)? {
                Some(fp) => {
                    println!("book_id:           {}", fp.book_id);
                    println!("source_url:        {}", fp.source_url);
                    println!("content_hash:      {}", fp.content_hash);
                    println!("price_hash:        {}", fp.price_hash);
                    println!("availability_hash: {}", fp.availability_hash);
                    println!("metadata_hash:     {}", fp.metadata_hash);
                    println!("created_at:        {}", fp.created_at.to_rfc3339());
                    println!("updated_at:        {}", fp.updated_at.to_rfc3339());
                }
                None => {
                    println!("no fingerprint for {url} ({book_id})");
                    std::process::exit(1);
                }
            }
        }
        Command::Cleanup => {
            let removed = cleanup_orphan_fingerprints(&store)?;
            println!("removed {removed} orphaned fingerprints");
        }
        Command::Stats => {
            let books = store.count_books()?;
            let fingerprints = store.all_fingerprints()?;
            let mut orphaned = 0u64;
            for fp in &fingerprints {
                if !store.book_exists_by_url(&fp.source_url)? {
                    orphaned += 1;
                }
            }
            let covered = fingerprints.len() as u64 - orphaned;
            println!("books:                 {books}");
            println!("fingerprints:          {}", fingerprints.len());
            println!("books with fingerprint: {covered}");
            println!("orphaned fingerprints:  {orphaned}");
            if books > 0 {
                println!("coverage:              {:.1}%", covered as f64 / books as f64 * 100.0);
            }
            if orphaned > 0 {
                println!("run `bookwatch-fingerprints cleanup` to remove orphans");
            }
        }
    }
    Ok(())
}
