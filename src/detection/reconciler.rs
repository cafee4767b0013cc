//! The reconciliation loop.
//!
//! One run walks four phases in order: orphan-fingerprint cleanup, restore
//! of missing books, discovery of new books, and a batched concurrent diff
//! of every mirrored book against the live site. Batches are barriers: the
//! next one starts only after the previous has drained. A per-book failure
//! is captured into the run's error list; a store connection failure aborts
//! the remaining batches and fails the run.

use std::sync::Arc;
use std::time::Instant;

use futures_util::stream::{self, StreamExt};
use tracing::{debug, error, info, warn};

use crate::fetcher::{BookSource, CancelToken, FetchError};
use crate::fingerprint;
use crate::models::{
    Book, BookStatus, ChangeRecord, ChangeSeverity, ChangeType, DetectionRun,
};
use crate::store::{BookFilter, Store, StoreError};

/// Knobs for a reconciliation run, copied out of [`crate::config::Config`].
#[derive(Debug, Clone)]
pub struct ReconcilerSettings {
    pub batch_size: usize,
    pub max_concurrent_books: usize,
    pub expected_catalog_size: u64,
    pub restore_max_pages: u32,
    pub discovery_max_pages: u32,
    pub max_consecutive_page_errors: u32,
}

impl ReconcilerSettings {
    pub fn from_config(config: &crate::config::Config) -> Self {
        Self {
            batch_size: config.batch_size,
            max_concurrent_books: config.max_concurrent_books,
            expected_catalog_size: config.expected_catalog_size,
            restore_max_pages: config.restore_max_pages,
            discovery_max_pages: config.discovery_max_pages,
            max_consecutive_page_errors: config.max_consecutive_page_errors,
        }
    }
}

/// Outcome of diffing one stored book against the live site.
enum BookOutcome {
    Unchanged,
    FingerprintCreated,
    Updated(Vec<ChangeRecord>),
    Removed,
    Cancelled,
    /// `fatal` marks run-level failures (store connection loss); everything
    /// else is captured per book and the batch continues.
    Failed { message: String, fatal: bool },
}

pub struct Reconciler {
    store: Store,
    source: Arc<dyn BookSource>,
    settings: ReconcilerSettings,
    cancel: CancelToken,
}

impl Reconciler {
    pub fn new(
        store: Store,
        source: Arc<dyn BookSource>,
        settings: ReconcilerSettings,
        cancel: CancelToken,
    ) -> Self {
        Self {
            store,
            source,
            settings,
            cancel,
        }
    }

    /// Run one full reconciliation and persist its summary.
    pub async fn reconcile(&self, max_books: Option<usize>, verbose: bool) -> DetectionRun {
        let mut run = DetectionRun::started_now();
        let started = Instant::now();

        if verbose {
            info!(
                detection_id = %run.detection_id,
                batch_size = self.settings.batch_size,
                ?max_books,
                "starting reconciliation"
            );
        }

        // Phase A: orphan fingerprint cleanup.
        match self.cleanup_orphan_fingerprints() {
            Ok(count) => {
                run.orphan_fingerprints_removed = count;
                if count > 0 {
                    info!(removed = count, "cleaned up orphan fingerprints");
                }
            }
            Err(e) => run.errors.push(format!("fingerprint cleanup failed: {e}")),
        }

        // Phase B: restore missing books when the mirror is below the
        // expected floor.
        match self.restore_missing_books(verbose).await {
            Ok(restored) => {
                run.restored_books = restored;
                if restored > 0 {
                    info!(restored, "restored missing books");
                }
            }
            Err(e) => run.errors.push(format!("restore phase failed: {e}")),
        }

        // Phase C: discover books the mirror has never seen.
        match self.discover_new_books(verbose).await {
            Ok(discovered) => {
                run.new_books = run.restored_books + discovered;
                if discovered > 0 {
                    info!(discovered, "discovered new books");
                }
            }
            Err(e) => {
                run.new_books = run.restored_books;
                run.errors.push(format!("discovery phase failed: {e}"));
            }
        }

        // Phase D: diff the mirrored set in sequential batches.
        let stored_books = match self.store.iter_books(&BookFilter::default(), max_books) {
            Ok(books) => books,
            Err(e) => {
                run.errors.push(format!("failed to load stored books: {e}"));
                return self.finish(run, started);
            }
        };

        if stored_books.is_empty() {
            warn!("no stored books found for change detection");
            return self.finish(run, started);
        }
        run.total_books_checked = stored_books.len() as u64;

        'batches: for (batch_index, batch) in
            stored_books.chunks(self.settings.batch_size).enumerate()
        {
            if self.cancel.is_cancelled() {
                run.errors.push("reconciliation cancelled".to_string());
                break;
            }

            let outcomes: Vec<BookOutcome> = stream::iter(batch.iter().cloned())
                .map(|book| self.process_book(book))
                .buffer_unordered(self.settings.max_concurrent_books)
                .collect()
                .await;

            let mut batch_changes = 0u64;
            for outcome in outcomes {
                match outcome {
                    BookOutcome::Unchanged | BookOutcome::FingerprintCreated => {}
                    BookOutcome::Updated(changes) => {
                        run.updated_books += 1;
                        run.changes_detected += changes.len() as u64;
                        batch_changes += changes.len() as u64;
                        for change in &changes {
                            *run.changes_by_type.entry(change.change_type).or_insert(0) += 1;
                            *run.changes_by_severity.entry(change.severity).or_insert(0) += 1;
                        }
                    }
                    BookOutcome::Removed => {
                        run.removed_books += 1;
                        run.changes_detected += 1;
                        batch_changes += 1;
                        *run.changes_by_type.entry(ChangeType::BookRemoved).or_insert(0) += 1;
                        *run
                            .changes_by_severity
                            .entry(ChangeSeverity::High)
                            .or_insert(0) += 1;
                    }
                    BookOutcome::Cancelled => {
                        run.errors.push("reconciliation cancelled".to_string());
                        break 'batches;
                    }
                    BookOutcome::Failed { message, fatal } => {
                        run.errors.push(message);
                        if fatal {
                            // Remaining batches are abandoned.
                            break 'batches;
                        }
                    }
                }
            }

            let processed =
                ((batch_index + 1) * self.settings.batch_size).min(stored_books.len());
            if verbose {
                info!(
                    batch = batch_index,
                    processed,
                    total = stored_books.len(),
                    changes_in_batch = batch_changes,
                    "processed batch"
                );
            } else {
                debug!(processed, total = stored_books.len(), "progress");
            }
        }

        self.finish(run, started)
    }

    fn finish(&self, mut run: DetectionRun, started: Instant) -> DetectionRun {
        let now = chrono::Utc::now();
        run.completed_at = Some(now);
        run.detection_duration_seconds = started.elapsed().as_secs_f64();
        run.average_book_processing_time = if run.total_books_checked > 0 {
            run.detection_duration_seconds / run.total_books_checked as f64
        } else {
            0.0
        };
        run.success = run.errors.is_empty();

        if let Err(e) = self.store.append_detection_run(&run) {
            error!(error = %e, "failed to persist detection run");
        }

        info!(
            detection_id = %run.detection_id,
            total_books = run.total_books_checked,
            changes = run.changes_detected,
            new_books = run.new_books,
            updated = run.updated_books,
            removed = run.removed_books,
            restored = run.restored_books,
            errors = run.errors.len(),
            duration_secs = run.detection_duration_seconds,
            "reconciliation completed"
        );
        run
    }

    /// Phase A. Also runs standalone as the scheduler's fingerprint-cleanup
    /// job.
    pub fn cleanup_orphan_fingerprints(&self) -> Result<u64, StoreError> {
        cleanup_orphan_fingerprints(&self.store)
    }

    /// Phase B. Walks catalog pages inserting unknown books until the gap
    /// to `expected_catalog_size` is filled.
    async fn restore_missing_books(&self, verbose: bool) -> Result<u64, StoreError> {
        let current = self.store.count_books()?;
        if current >= self.settings.expected_catalog_size {
            debug!(count = current, "book count at or above expected floor");
            return Ok(0);
        }
        let missing = self.settings.expected_catalog_size - current;
        if verbose {
            info!(missing, current, "mirror below expected size, restoring");
        }
        self.ingest_from_pages(
            self.settings.restore_max_pages,
            Some(missing),
            "book_restored",
        )
        .await
    }

    /// Phase C. Same walk as B without a fill target, over fewer pages.
    async fn discover_new_books(&self, verbose: bool) -> Result<u64, StoreError> {
        if verbose {
            info!(
                max_pages = self.settings.discovery_max_pages,
                "checking catalog for new books"
            );
        }
        self.ingest_from_pages(self.settings.discovery_max_pages, None, "new_book")
            .await
    }

    /// Shared page walk for phases B and C: fetch each catalog page, insert
    /// any unknown book with its fingerprint and a `new_book` change record.
    /// Stops at the page budget, the optional fill target, or after too many
    /// consecutive empty/failing pages.
    async fn ingest_from_pages(
        &self,
        max_pages: u32,
        target: Option<u64>,
        field_name: &str,
    ) -> Result<u64, StoreError> {
        let mut inserted = 0u64;
        let mut consecutive_errors = 0u32;

        'pages: for page in 1..=max_pages {
            if self.cancel.is_cancelled() {
                break;
            }
            if consecutive_errors >= self.settings.max_consecutive_page_errors {
                warn!(consecutive_errors, "stopping page walk");
                break;
            }
            if let Some(target) = target {
                if inserted >= target {
                    break;
                }
            }

            let urls = match self.source.fetch_catalog_page(page).await {
                Ok(urls) if urls.is_empty() => {
                    consecutive_errors += 1;
                    debug!(page, consecutive_errors, "catalog page empty");
                    continue;
                }
                Ok(urls) => {
                    consecutive_errors = 0;
                    urls
                }
                Err(FetchError::Cancelled) => break,
                Err(e) => {
                    consecutive_errors += 1;
                    warn!(page, error = %e, consecutive_errors, "catalog page failed");
                    continue;
                }
            };

            for url in urls {
                if let Some(target) = target {
                    if inserted >= target {
                        break 'pages;
                    }
                }
                if self.store.book_exists_by_url(&url)? {
                    continue;
                }

                let book = match self.source.fetch_book(&url).await {
                    Ok(book) => book,
                    Err(FetchError::Cancelled) => break 'pages,
                    Err(e) => {
                        warn!(%url, error = %e, "failed to fetch new book");
                        continue;
                    }
                };

                match self.store.insert_book(&book) {
                    Ok(()) => {}
                    Err(StoreError::Duplicate(_)) => continue,
                    Err(StoreError::Invariant(reason)) => {
                        warn!(%url, %reason, "new book rejected by invariants");
                        continue;
                    }
                    Err(e) => return Err(e),
                }

                // Fingerprint after a successful book write, then the
                // discovery record.
                self.store
                    .update_fingerprint(&fingerprint::fingerprint(&book))?;
                let summary = if field_name == "book_restored" {
                    format!("Book restored: {}", book.name)
                } else {
                    format!("New book discovered: {}", book.name)
                };
                self.store.append_change(&ChangeRecord::new(
                    fingerprint::book_id(&book.source_url),
                    book.source_url.clone(),
                    ChangeType::NewBook,
                    ChangeSeverity::Medium,
                    field_name.to_string(),
                    None,
                    Some(book.name.clone()),
                    summary,
                ))?;

                inserted += 1;
                debug!(url = %book.source_url, name = %book.name, "ingested book");
            }
        }

        Ok(inserted)
    }

    /// Phase D worker: fetch the live state of one stored book and apply
    /// whatever the diff requires.
    async fn process_book(&self, stored: Book) -> BookOutcome {
        if self.cancel.is_cancelled() {
            return BookOutcome::Cancelled;
        }

        let current = match self.source.fetch_book(&stored.source_url).await {
            Ok(book) => book,
            Err(FetchError::NotFound(_)) => {
                return self.handle_removed_book(&stored);
            }
            Err(FetchError::Cancelled) => return BookOutcome::Cancelled,
            Err(e) => {
                return BookOutcome::Failed {
                    message: format!("error processing book {}: {e}", stored.name),
                    fatal: false,
                };
            }
        };

        let book_id = fingerprint::book_id(&current.source_url);
        let stored_fingerprint = match self.store.get_fingerprint(&book_id) {
            Ok(fp) => fp,
            Err(e) => return self.store_failure(&stored, e),
        };

        let changes = super::differ::diff_books(&stored, &current, stored_fingerprint.as_ref());

        if !changes.is_empty() {
            for change in &changes {
                if let Err(e) = self.store.append_change(change) {
                    return self.store_failure(&stored, e);
                }
            }

            // Copy current onto the mirror, preserving the creation time.
            let mut updated = current.clone();
            updated.created_at = stored.created_at;
            updated.updated_at = chrono::Utc::now();
            if let Err(e) = self.store.upsert_book(&updated) {
                return self.store_failure(&stored, e);
            }
            if let Err(e) = self
                .store
                .update_fingerprint(&fingerprint::fingerprint(&current))
            {
                return self.store_failure(&stored, e);
            }

            debug!(book = %current.name, changes = changes.len(), "book updated");
            BookOutcome::Updated(changes)
        } else if stored_fingerprint.is_none() {
            // Book exists without a fingerprint (e.g. a partial earlier
            // write); create it without emitting a change.
            match self
                .store
                .update_fingerprint(&fingerprint::fingerprint(&current))
            {
                Ok(()) => {
                    debug!(book = %current.name, "created missing fingerprint");
                    BookOutcome::FingerprintCreated
                }
                Err(e) => self.store_failure(&stored, e),
            }
        } else {
            BookOutcome::Unchanged
        }
    }

    fn handle_removed_book(&self, stored: &Book) -> BookOutcome {
        if stored.status == BookStatus::Removed {
            // Already soft-marked; a second run emits nothing.
            return BookOutcome::Unchanged;
        }

        let record = ChangeRecord::new(
            fingerprint::book_id(&stored.source_url),
            stored.source_url.clone(),
            ChangeType::BookRemoved,
            ChangeSeverity::High,
            "book".to_string(),
            Some(stored.name.clone()),
            None,
            format!("Book '{}' has been removed from the site", stored.name),
        );
        if let Err(e) = self.store.append_change(&record) {
            return self.store_failure(stored, e);
        }
        if let Err(e) = self.store.soft_mark_removed(&stored.source_url) {
            return self.store_failure(stored, e);
        }
        info!(book = %stored.name, url = %stored.source_url, "book removed upstream");
        BookOutcome::Removed
    }

    fn store_failure(&self, book: &Book, error: StoreError) -> BookOutcome {
        if error.is_connection() {
            BookOutcome::Failed {
                message: format!(
                    "store connection lost while processing {}: {error}",
                    book.source_url
                ),
                fatal: true,
            }
        } else {
            BookOutcome::Failed {
                message: format!("error processing book {}: {error}", book.name),
                fatal: false,
            }
        }
    }
}

/// Delete fingerprints whose book row is gone entirely. Soft-removed books
/// keep theirs: the row still exists and the change log still refers to it.
pub fn cleanup_orphan_fingerprints(store: &Store) -> Result<u64, StoreError> {
    let mut removed = 0;
    for fp in store.all_fingerprints()? {
        if !store.book_exists_by_url(&fp.source_url)? && store.delete_fingerprint(&fp.book_id)? {
            removed += 1;
            debug!(book_id = %fp.book_id, "removed orphan fingerprint");
        }
    }
    Ok(removed)
}
