//! Full-catalog crawler for first-run ingest and bulk restore.
//!
//! The walk is checkpointed to a JSON state file so a crashed crawl resumes
//! from its last processed page instead of page 1. The state file has a
//! single writer (this module) and is always replaced atomically
//! (write-temp + rename), so readers observe either the old state or the
//! new one, never a torn write.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use thiserror::Error;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::fetcher::{BookSource, CancelToken, FetchError};
use crate::fingerprint;
use crate::models::{CrawlResult, CrawlState};
use crate::store::{Store, StoreError};

/// Page-level crawl failure: either the catalog fetch or a store write that
/// cannot be attributed to a single book.
#[derive(Debug, Error)]
enum PageError {
    #[error("{0}")]
    Fetch(#[from] FetchError),
    #[error("store failure: {0}")]
    Store(#[from] StoreError),
}

impl PageError {
    fn is_connection_class(&self) -> bool {
        match self {
            PageError::Fetch(e) => e.is_connection_class(),
            PageError::Store(e) => e.is_connection(),
        }
    }
}

/// Where the crawl currently is. Transitions:
/// Idle → ProbingPageCount → Crawling(k) → Checkpointed(k) → Crawling(k+1)
/// → … → Done | Failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CrawlPhase {
    Idle,
    ProbingPageCount,
    Crawling(u32),
    Checkpointed(u32),
    Done,
    Failed,
}

/// Load crawl state from disk; any unreadable file resets to defaults.
pub fn load_state(path: &Path) -> CrawlState {
    match std::fs::read_to_string(path) {
        Ok(raw) => match serde_json::from_str(&raw) {
            Ok(state) => state,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "crawl state unreadable, resetting");
                CrawlState::default()
            }
        },
        Err(_) => CrawlState::default(),
    }
}

/// Atomically persist crawl state: serialize to a sibling temp file, then
/// rename over the target.
pub fn save_state(path: &Path, state: &CrawlState) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let tmp = path.with_extension("json.tmp");
    let payload = serde_json::to_string_pretty(state)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    std::fs::write(&tmp, payload)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

pub struct Crawler {
    store: Store,
    source: Arc<dyn BookSource>,
    state_path: PathBuf,
    resume: bool,
    checkpoint_interval: u32,
    max_consecutive_empty_pages: u32,
    cancel: CancelToken,
    phase: CrawlPhase,
}

impl Crawler {
    pub fn new(
        store: Store,
        source: Arc<dyn BookSource>,
        config: &crate::config::Config,
        cancel: CancelToken,
    ) -> Self {
        Self {
            store,
            source,
            state_path: config.state_file.clone(),
            resume: config.resume_on_failure,
            checkpoint_interval: config.checkpoint_interval,
            max_consecutive_empty_pages: config.max_consecutive_page_errors,
            cancel,
            phase: CrawlPhase::Idle,
        }
    }

    pub fn phase(&self) -> CrawlPhase {
        self.phase
    }

    /// Walk every catalog page from the checkpointed cursor to completion.
    pub async fn crawl_all_books(&mut self) -> CrawlResult {
        let start_time = Utc::now();
        let started = std::time::Instant::now();

        let mut state = if self.resume && self.state_path.exists() {
            let state = load_state(&self.state_path);
            info!(
                page = state.last_processed_page,
                books = state.books_processed,
                "resuming crawl from checkpoint"
            );
            state
        } else {
            CrawlState::default()
        };

        self.phase = CrawlPhase::ProbingPageCount;
        let total_pages = match self.source.count_pages().await {
            Ok(total) => total,
            Err(e) => {
                self.phase = CrawlPhase::Failed;
                let message = format!("failed to probe page count: {e}");
                warn!("{message}");
                state.errors.push(message.clone());
                let _ = save_state(&self.state_path, &state);
                return CrawlResult {
                    success: false,
                    books_crawled: state.books_processed,
                    errors: state.errors,
                    duration_seconds: started.elapsed().as_secs_f64(),
                    start_time,
                    end_time: Utc::now(),
                };
            }
        };
        state.total_pages = Some(total_pages);
        info!(total_pages, "catalog size probed");

        let mut consecutive_empty = 0u32;
        let mut page = state.last_processed_page;

        while page <= total_pages {
            if self.cancel.is_cancelled() {
                info!(page, "crawl cancelled, checkpointing");
                break;
            }
            if consecutive_empty > self.max_consecutive_empty_pages {
                warn!(consecutive_empty, "too many consecutive empty pages, stopping");
                break;
            }

            self.phase = CrawlPhase::Crawling(page);
            match self.crawl_page(page, &mut state).await {
                Ok(0) => consecutive_empty += 1,
                Ok(_) => consecutive_empty = 0,
                Err(e) => {
                    let message = format!("failed to crawl page {page}: {e}");
                    state.errors.push(message.clone());
                    warn!(page, "{message}");
                    // A run of connection-class errors backs off before
                    // hammering the site again.
                    if e.is_connection_class() {
                        sleep(Duration::from_secs(5)).await;
                    }
                }
            }

            state.last_processed_page = page;
            state.last_update_time = Utc::now();

            if page % self.checkpoint_interval == 0 {
                if let Err(e) = save_state(&self.state_path, &state) {
                    warn!(error = %e, "failed to checkpoint crawl state");
                } else {
                    self.phase = CrawlPhase::Checkpointed(page);
                    debug!(page, "checkpointed");
                }
            }

            info!(
                page,
                total_pages,
                books = state.books_processed,
                "crawl progress"
            );
            page += 1;
        }

        // Graceful exit always checkpoints.
        if let Err(e) = save_state(&self.state_path, &state) {
            warn!(error = %e, "failed to save final crawl state");
        }

        let success = state.errors.is_empty();
        self.phase = if success { CrawlPhase::Done } else { CrawlPhase::Failed };

        let result = CrawlResult {
            success,
            books_crawled: state.books_processed,
            errors: state.errors.clone(),
            duration_seconds: started.elapsed().as_secs_f64(),
            start_time,
            end_time: Utc::now(),
        };
        info!(
            books = result.books_crawled,
            errors = result.errors.len(),
            duration_secs = result.duration_seconds,
            "crawl finished"
        );
        result
    }

    /// Process one catalog page; returns how many book URLs it listed.
    async fn crawl_page(&self, page: u32, state: &mut CrawlState) -> Result<usize, PageError> {
        let urls = self.source.fetch_catalog_page(page).await?;

        for url in &urls {
            if self.cancel.is_cancelled() {
                break;
            }

            let book = match self.source.fetch_book(url).await {
                Ok(book) => book,
                Err(FetchError::Cancelled) => break,
                Err(e) => {
                    state.errors.push(format!("book extraction failed for {url}: {e}"));
                    continue;
                }
            };

            match self.store.insert_book(&book) {
                Ok(()) => {
                    // Fingerprint follows a successful first write.
                    if let Err(e) = self
                        .store
                        .update_fingerprint(&fingerprint::fingerprint(&book))
                    {
                        state.errors.push(format!(
                            "fingerprint write failed for {url}: {e}"
                        ));
                        continue;
                    }
                    state.books_processed += 1;
                }
                // Duplicates are expected on resumed crawls.
                Err(StoreError::Duplicate(_)) => {
                    state.books_processed += 1;
                    debug!(%url, "already mirrored");
                }
                Err(StoreError::Invariant(reason)) => {
                    state.errors.push(format!("book rejected for {url}: {reason}"));
                }
                Err(e) => return Err(e.into()),
            }
            state.last_processed_url = Some(url.clone());
        }

        Ok(urls.len())
    }
}
