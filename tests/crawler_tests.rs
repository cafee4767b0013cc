//! Crawler resume and checkpoint behavior over the in-memory site.

mod common;

use std::sync::Arc;

use common::{make_book, FakeSite, PAGE_SIZE};

use bookwatch::config::Config;
use bookwatch::crawler::{load_state, save_state, Crawler};
use bookwatch::fetcher::CancelToken;
use bookwatch::fingerprint;
use bookwatch::models::CrawlState;
use bookwatch::store::Store;

fn test_config(dir: &std::path::Path, resume: bool) -> Config {
    // Environment-independent config for crawler tests.
    let mut config = config_defaults();
    config.state_file = dir.join("crawl_state.json");
    config.resume_on_failure = resume;
    config.checkpoint_interval = 2;
    config
}

fn config_defaults() -> Config {
    Config {
        database_path: std::path::PathBuf::from(":memory:"),
        base_url: "https://books.example".to_string(),
        rate_limit_per_second: 10.0,
        request_timeout_secs: 30,
        retry_attempts: 0,
        retry_delay_secs: 0.1,
        max_concurrent_requests: 4,
        max_concurrent_books: 4,
        batch_size: 10,
        expected_catalog_size: 0,
        restore_max_pages: 5,
        discovery_max_pages: 5,
        max_consecutive_page_errors: 3,
        state_file: std::path::PathBuf::from("crawl_state.json"),
        resume_on_failure: true,
        checkpoint_interval: 2,
        schedule_hour: 2,
        schedule_minute: 0,
        timezone: "UTC".to_string(),
        enable_change_detection: true,
        generate_daily_reports: true,
        report_format: bookwatch::config::ReportFormat::Json,
        report_retention_days: 30,
        reports_dir: std::path::PathBuf::from("reports"),
        log_level: "info".to_string(),
        log_format: bookwatch::config::LogFormat::Console,
        log_file: None,
        debug: false,
        api_host: "127.0.0.1".to_string(),
        api_port: 8000,
        api_key: None,
    }
}

#[tokio::test]
async fn full_crawl_mirrors_every_book_with_fingerprints() {
    let dir = tempfile::tempdir().unwrap();
    let store = Store::in_memory().unwrap();
    let site = Arc::new(FakeSite::new());
    site.seed(10); // 3 pages at PAGE_SIZE = 4

    let config = test_config(dir.path(), false);
    let mut crawler = Crawler::new(
        store.clone(),
        Arc::clone(&site) as Arc<dyn bookwatch::fetcher::BookSource>,
        &config,
        CancelToken::new(),
    );
    let result = crawler.crawl_all_books().await;

    assert!(result.success, "errors: {:?}", result.errors);
    assert_eq!(result.books_crawled, 10);
    assert_eq!(store.count_books().unwrap(), 10);
    for index in 0..10 {
        let id = fingerprint::book_id(&FakeSite::url(index));
        assert!(store.get_fingerprint(&id).unwrap().is_some(), "book {index}");
    }

    // Graceful exit checkpoints the cursor.
    let state = load_state(&config.state_file);
    assert_eq!(state.books_processed, 10);
    assert_eq!(state.total_pages, Some(3));
}

#[tokio::test]
async fn resume_starts_from_the_checkpointed_page() {
    let dir = tempfile::tempdir().unwrap();
    let store = Store::in_memory().unwrap();
    let site = Arc::new(FakeSite::new());
    site.seed(20); // 5 pages

    // Simulate a crawl that crashed after checkpointing page 3 with the
    // first two pages' books already mirrored.
    let config = test_config(dir.path(), true);
    let mut state = CrawlState::default();
    state.last_processed_page = 3;
    state.books_processed = (2 * PAGE_SIZE) as u64;
    save_state(&config.state_file, &state).unwrap();
    for index in 0..2 * PAGE_SIZE {
        let book = make_book(index);
        store.insert_book(&book).unwrap();
        store
            .update_fingerprint(&fingerprint::fingerprint(&book))
            .unwrap();
    }

    let mut crawler = Crawler::new(
        store.clone(),
        Arc::clone(&site) as Arc<dyn bookwatch::fetcher::BookSource>,
        &config,
        CancelToken::new(),
    );
    let result = crawler.crawl_all_books().await;

    // The first catalog page fetched on resume is 3, not 1.
    let pages = site.fetched_pages.lock().unwrap().clone();
    assert_eq!(pages.first().copied(), Some(3));

    // Counter continues from the checkpoint; duplicates on the refetched
    // page are counted as processed, not as errors.
    assert!(result.success, "errors: {:?}", result.errors);
    assert_eq!(result.books_crawled, 20);
    assert_eq!(store.count_books().unwrap(), 20);
}

#[tokio::test]
async fn without_resume_the_crawl_starts_at_page_one() {
    let dir = tempfile::tempdir().unwrap();
    let store = Store::in_memory().unwrap();
    let site = Arc::new(FakeSite::new());
    site.seed(8);

    let config = test_config(dir.path(), false);
    let mut stale = CrawlState::default();
    stale.last_processed_page = 2;
    save_state(&config.state_file, &stale).unwrap();

    let mut crawler = Crawler::new(
        store,
        Arc::clone(&site) as Arc<dyn bookwatch::fetcher::BookSource>,
        &config,
        CancelToken::new(),
    );
    crawler.crawl_all_books().await;

    let pages = site.fetched_pages.lock().unwrap().clone();
    assert_eq!(pages.first().copied(), Some(1));
}

#[tokio::test]
async fn failed_book_fetches_are_recorded_but_do_not_stop_the_crawl() {
    let dir = tempfile::tempdir().unwrap();
    let store = Store::in_memory().unwrap();
    let site = Arc::new(FakeSite::new());
    site.seed(4);
    site.fail(&FakeSite::url(1));

    let config = test_config(dir.path(), false);
    let mut crawler = Crawler::new(
        store.clone(),
        Arc::clone(&site) as Arc<dyn bookwatch::fetcher::BookSource>,
        &config,
        CancelToken::new(),
    );
    let result = crawler.crawl_all_books().await;

    assert!(!result.success);
    assert_eq!(result.books_crawled, 3);
    assert_eq!(store.count_books().unwrap(), 3);
    assert!(result.errors.iter().any(|e| e.contains("book-001")));
}
