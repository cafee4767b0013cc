//! End-to-end reconciliation scenarios over an in-memory site and store.

mod common;

use std::sync::Arc;

use common::{make_book, FakeSite};

use bookwatch::detection::{Reconciler, ReconcilerSettings};
use bookwatch::fetcher::CancelToken;
use bookwatch::fingerprint;
use bookwatch::models::{BookStatus, ChangeSeverity, ChangeType};
use bookwatch::store::{ChangeFilter, Store};

fn settings(expected_catalog_size: u64) -> ReconcilerSettings {
    ReconcilerSettings {
        batch_size: 3,
        max_concurrent_books: 4,
        expected_catalog_size,
        restore_max_pages: 10,
        discovery_max_pages: 5,
        max_consecutive_page_errors: 3,
    }
}

fn reconciler(store: &Store, site: &Arc<FakeSite>, expected: u64) -> Reconciler {
    Reconciler::new(
        store.clone(),
        Arc::clone(site) as Arc<dyn bookwatch::fetcher::BookSource>,
        settings(expected),
        CancelToken::new(),
    )
}

/// Mirror the fake site's current state into the store, fingerprints
/// included.
fn mirror_site(store: &Store, count: usize) {
    for index in 0..count {
        let book = make_book(index);
        store.insert_book(&book).unwrap();
        store
            .update_fingerprint(&fingerprint::fingerprint(&book))
            .unwrap();
    }
}

#[tokio::test]
async fn price_change_emits_one_high_severity_record_and_updates_mirror() {
    let store = Store::in_memory().unwrap();
    let site = Arc::new(FakeSite::new());
    site.seed(3);
    mirror_site(&store, 3);

    let url = FakeSite::url(1);
    let old_fp = store
        .get_fingerprint(&fingerprint::book_id(&url))
        .unwrap()
        .unwrap();
    site.set_price(&url, "24.99");

    let run = reconciler(&store, &site, 3).reconcile(None, false).await;

    assert!(run.success, "errors: {:?}", run.errors);
    assert_eq!(run.changes_detected, 1);
    assert_eq!(run.updated_books, 1);
    assert_eq!(run.changes_by_type[&ChangeType::PriceChange], 1);

    let changes = store
        .changes_filtered(&ChangeFilter::default(), None)
        .unwrap();
    let price_changes: Vec<_> = changes
        .iter()
        .filter(|c| c.change_type == ChangeType::PriceChange)
        .collect();
    assert_eq!(price_changes.len(), 1);
    let including = price_changes[0];
    assert_eq!(including.field_name, "price_including_tax");
    assert_eq!(including.severity, ChangeSeverity::High);
    assert_eq!(including.old_value.as_deref(), Some("19.99"));
    assert_eq!(including.new_value.as_deref(), Some("24.99"));

    let updated = store.get_book_by_url(&url).unwrap().unwrap();
    assert_eq!(updated.price_including_tax.to_string(), "24.99");

    let new_fp = store
        .get_fingerprint(&fingerprint::book_id(&url))
        .unwrap()
        .unwrap();
    assert_ne!(new_fp.price_hash, old_fp.price_hash);
    assert_ne!(new_fp.content_hash, old_fp.content_hash);
}

#[tokio::test]
async fn removed_book_is_soft_marked_once() {
    let store = Store::in_memory().unwrap();
    let site = Arc::new(FakeSite::new());
    site.seed(3);
    mirror_site(&store, 3);

    let url = FakeSite::url(2);
    site.remove(&url);

    let run = reconciler(&store, &site, 2).reconcile(None, false).await;
    assert_eq!(run.removed_books, 1);

    let removals: Vec<_> = store
        .changes_filtered(&ChangeFilter::default(), None)
        .unwrap()
        .into_iter()
        .filter(|c| c.change_type == ChangeType::BookRemoved)
        .collect();
    assert_eq!(removals.len(), 1);
    assert_eq!(removals[0].severity, ChangeSeverity::High);

    // The row remains, soft-marked.
    let book = store.get_book_by_url(&url).unwrap().unwrap();
    assert_eq!(book.status, BookStatus::Removed);
    // Its fingerprint is retained: the book is soft-removed, not deleted.
    assert!(store
        .get_fingerprint(&fingerprint::book_id(&url))
        .unwrap()
        .is_some());

    // A second run emits no further removal records.
    let run2 = reconciler(&store, &site, 2).reconcile(None, false).await;
    assert_eq!(run2.removed_books, 0);
    let removals_after: Vec<_> = store
        .changes_filtered(&ChangeFilter::default(), None)
        .unwrap()
        .into_iter()
        .filter(|c| c.change_type == ChangeType::BookRemoved)
        .collect();
    assert_eq!(removals_after.len(), 1);
}

#[tokio::test]
async fn discovery_ingests_unknown_book_with_fingerprint_and_record() {
    let store = Store::in_memory().unwrap();
    let site = Arc::new(FakeSite::new());
    site.seed(2);
    // Mirror only the first book; the second is unknown to the store.
    mirror_site(&store, 1);

    let run = reconciler(&store, &site, 1).reconcile(None, false).await;
    assert!(run.success, "errors: {:?}", run.errors);
    assert_eq!(run.new_books, 1);

    let url = FakeSite::url(1);
    let book = store.get_book_by_url(&url).unwrap().unwrap();
    assert_eq!(book.name, "Book 001");
    assert!(!book.description.is_empty());
    assert!(store
        .get_fingerprint(&fingerprint::book_id(&url))
        .unwrap()
        .is_some());

    let new_books: Vec<_> = store
        .changes_filtered(&ChangeFilter::default(), None)
        .unwrap()
        .into_iter()
        .filter(|c| c.change_type == ChangeType::NewBook)
        .collect();
    assert_eq!(new_books.len(), 1);
    assert_eq!(new_books[0].severity, ChangeSeverity::Medium);
    assert_eq!(new_books[0].new_value.as_deref(), Some("Book 001"));
}

#[tokio::test]
async fn restore_fills_the_gap_to_the_expected_floor() {
    let store = Store::in_memory().unwrap();
    let site = Arc::new(FakeSite::new());
    site.seed(3);
    mirror_site(&store, 1);

    // Expected floor of 3 with one mirrored book: two books to restore.
    let run = reconciler(&store, &site, 3).reconcile(None, false).await;
    assert_eq!(run.restored_books, 2);
    assert_eq!(run.new_books, 2);
    assert_eq!(store.count_books().unwrap(), 3);
}

#[tokio::test]
async fn back_to_back_runs_against_unchanged_upstream_are_no_ops() {
    let store = Store::in_memory().unwrap();
    let site = Arc::new(FakeSite::new());
    site.seed(6);
    mirror_site(&store, 6);

    let first = reconciler(&store, &site, 6).reconcile(None, false).await;
    assert!(first.success);
    assert_eq!(first.changes_detected, 0);

    let second = reconciler(&store, &site, 6).reconcile(None, false).await;
    assert!(second.success);
    assert_eq!(second.changes_detected, 0);
    assert_eq!(second.new_books, 0);
    assert_eq!(second.updated_books, 0);
    assert_eq!(second.removed_books, 0);
    assert_eq!(
        store
            .changes_filtered(&ChangeFilter::default(), None)
            .unwrap()
            .len(),
        0
    );
}

#[tokio::test]
async fn deleted_fingerprint_is_recreated_without_change_records() {
    let store = Store::in_memory().unwrap();
    let site = Arc::new(FakeSite::new());
    site.seed(2);
    mirror_site(&store, 2);

    let book_id = fingerprint::book_id(&FakeSite::url(0));
    assert!(store.delete_fingerprint(&book_id).unwrap());

    let run = reconciler(&store, &site, 2).reconcile(None, false).await;
    assert!(run.success);
    // The book row did not change, so recreating the fingerprint is silent.
    assert_eq!(run.changes_detected, 0);
    assert!(store.get_fingerprint(&book_id).unwrap().is_some());
}

#[tokio::test]
async fn orphan_fingerprints_are_cleaned_up() {
    let store = Store::in_memory().unwrap();
    let site = Arc::new(FakeSite::new());
    site.seed(1);
    mirror_site(&store, 1);

    // A fingerprint whose book row never existed.
    let ghost = make_book(77);
    store
        .update_fingerprint(&fingerprint::fingerprint(&ghost))
        .unwrap();

    let run = reconciler(&store, &site, 1).reconcile(None, false).await;
    assert_eq!(run.orphan_fingerprints_removed, 1);
    assert!(store
        .get_fingerprint(&fingerprint::book_id(&ghost.source_url))
        .unwrap()
        .is_none());
    // The live book's fingerprint survived.
    assert!(store
        .get_fingerprint(&fingerprint::book_id(&FakeSite::url(0)))
        .unwrap()
        .is_some());
}

#[tokio::test]
async fn per_book_failure_is_captured_without_failing_other_books() {
    let store = Store::in_memory().unwrap();
    let site = Arc::new(FakeSite::new());
    site.seed(4);
    mirror_site(&store, 4);

    // Give the failing book a title that mentions a store connection; a
    // per-book network failure must stay per-book no matter what the
    // scraped name says.
    let mut trap = store.get_book_by_url(&FakeSite::url(0)).unwrap().unwrap();
    trap.name = "The Store Connection Manual".to_string();
    store.upsert_book(&trap).unwrap();
    store
        .update_fingerprint(&bookwatch::fingerprint::fingerprint(&trap))
        .unwrap();

    site.fail(&FakeSite::url(0));
    site.set_price(&FakeSite::url(3), "25.00");

    let run = reconciler(&store, &site, 4).reconcile(None, false).await;

    // The failing book lands in the error list and fails the run...
    assert!(!run.success);
    assert_eq!(run.errors.len(), 1);
    assert!(
        run.errors[0].contains("The Store Connection Manual"),
        "errors: {:?}",
        run.errors
    );
    // ...but the price change on another book in the same pass still lands:
    // the batch was not abandoned.
    assert_eq!(run.updated_books, 1);
    let book = store.get_book_by_url(&FakeSite::url(3)).unwrap().unwrap();
    assert_eq!(book.price_including_tax.to_string(), "25.00");
    // No store mutation for the failing book.
    let untouched = store.get_book_by_url(&FakeSite::url(0)).unwrap().unwrap();
    assert_eq!(untouched.price_including_tax.to_string(), "19.99");
}

#[tokio::test]
async fn store_connection_loss_fails_the_run_and_abandons_later_batches() {
    // File-backed store so a second connection can hold the write lock,
    // making every store write fail with SQLITE_BUSY while reads keep
    // working under WAL.
    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("bookwatch.db");
    let store = Store::open(&db_path).unwrap();

    let site = Arc::new(FakeSite::new());
    site.seed(6);
    for index in 0..6 {
        let book = make_book(index);
        store.insert_book(&book).unwrap();
        store
            .update_fingerprint(&fingerprint::fingerprint(&book))
            .unwrap();
    }
    // A price change in the first batch (batch_size = 3) forces a store
    // write mid-batch.
    site.set_price(&FakeSite::url(1), "24.99");

    let blocker = rusqlite::Connection::open(&db_path).unwrap();
    blocker.execute_batch("BEGIN IMMEDIATE").unwrap();

    let run = reconciler(&store, &site, 6).reconcile(None, false).await;
    drop(blocker);

    // The run is marked failed with a connection-class error...
    assert!(!run.success);
    assert!(
        run.errors
            .iter()
            .any(|e| e.contains("store connection lost")),
        "errors: {:?}",
        run.errors
    );
    // ...and the second batch was never started: only the first batch's
    // books were fetched.
    let fetched = site.fetched_books.lock().unwrap().clone();
    assert_eq!(fetched.len(), 3, "fetched: {fetched:?}");
    for index in 3..6 {
        assert!(
            !fetched.contains(&FakeSite::url(index)),
            "batch 2 book {index} was fetched after the connection loss"
        );
    }
}

#[tokio::test]
async fn cancellation_stops_the_run_and_records_it() {
    let store = Store::in_memory().unwrap();
    let site = Arc::new(FakeSite::new());
    site.seed(5);
    mirror_site(&store, 5);

    let cancel = CancelToken::new();
    cancel.cancel();
    let reconciler = Reconciler::new(
        store.clone(),
        Arc::clone(&site) as Arc<dyn bookwatch::fetcher::BookSource>,
        settings(5),
        cancel,
    );

    let run = reconciler.reconcile(None, false).await;
    assert!(!run.success);
    assert!(run
        .errors
        .iter()
        .any(|e| e.contains("cancelled")), "errors: {:?}", run.errors);
}

#[tokio::test]
async fn detection_run_is_persisted() {
    let store = Store::in_memory().unwrap();
    let site = Arc::new(FakeSite::new());
    site.seed(2);
    mirror_site(&store, 2);

    let run = reconciler(&store, &site, 2).reconcile(None, false).await;

    let from = run.run_timestamp - chrono::Duration::minutes(1);
    let to = run.run_timestamp + chrono::Duration::minutes(1);
    let stored_runs = store.detection_runs_in_range(from, to).unwrap();
    assert_eq!(stored_runs.len(), 1);
    assert_eq!(stored_runs[0].detection_id, run.detection_id);
    assert_eq!(stored_runs[0].total_books_checked, 2);
}
