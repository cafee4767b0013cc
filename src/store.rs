//! Embedded document store for the catalog mirror.
//!
//! Each collection is a table holding the document as a JSON payload column
//! plus the columns the collection is indexed on. Reads deserialize the
//! payload, so the indexed columns are projections only. One shared
//! connection behind a `parking_lot::Mutex`; WAL mode keeps readers cheap
//! while the reconciler writes.

use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, SecondsFormat, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, ErrorCode, OpenFlags};
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::models::{
    Book, BookStatus, ChangeRecord, ChangeSeverity, ChangeType, DailyReport, DetectionRun,
    Fingerprint,
};

#[derive(Debug, Error)]
pub enum StoreError {
    /// Unique-index conflict on insert. Expected on resumed crawls.
    #[error("document already exists: {0}")]
    Duplicate(String),
    /// Write rejected because the document violates a model invariant.
    #[error("invariant violation: {0}")]
    Invariant(String),
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("stored document failed to decode: {0}")]
    Decode(String),
}

impl StoreError {
    /// Connection-class failures are retriable at the run level, not the
    /// book level; the reconciler aborts remaining batches on these.
    pub fn is_connection(&self) -> bool {
        match self {
            StoreError::Database(rusqlite::Error::SqliteFailure(err, _)) => matches!(
                err.code,
                ErrorCode::DatabaseBusy
                    | ErrorCode::DatabaseLocked
                    | ErrorCode::CannotOpen
                    | ErrorCode::SystemIoFailure
            ),
            _ => false,
        }
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

const SCHEMA_SQL: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;
PRAGMA foreign_keys = ON;

CREATE TABLE IF NOT EXISTS books (
    source_url TEXT PRIMARY KEY,
    book_id TEXT NOT NULL,
    category TEXT NOT NULL,
    availability TEXT NOT NULL,
    price_including_tax REAL NOT NULL,
    rating INTEGER,
    status TEXT NOT NULL,
    last_crawled_at TEXT NOT NULL,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    payload_json TEXT NOT NULL
) WITHOUT ROWID;

CREATE INDEX IF NOT EXISTS idx_books_book_id ON books(book_id);
CREATE INDEX IF NOT EXISTS idx_books_category ON books(category);
CREATE INDEX IF NOT EXISTS idx_books_availability ON books(availability);
CREATE INDEX IF NOT EXISTS idx_books_price ON books(price_including_tax);
CREATE INDEX IF NOT EXISTS idx_books_rating ON books(rating);
CREATE INDEX IF NOT EXISTS idx_books_crawled_at ON books(last_crawled_at);
CREATE INDEX IF NOT EXISTS idx_books_category_availability
    ON books(category, availability);

CREATE TABLE IF NOT EXISTS fingerprints (
    book_id TEXT PRIMARY KEY,
    source_url TEXT NOT NULL,
    content_hash TEXT NOT NULL,
    price_hash TEXT NOT NULL,
    availability_hash TEXT NOT NULL,
    metadata_hash TEXT NOT NULL,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
) WITHOUT ROWID;

CREATE INDEX IF NOT EXISTS idx_fingerprints_source_url ON fingerprints(source_url);
CREATE INDEX IF NOT EXISTS idx_fingerprints_updated_at ON fingerprints(updated_at);

-- rowid doubles as insertion order: readers sorting by detected_at break
-- ties on id, which matches append order within one process.
CREATE TABLE IF NOT EXISTS change_logs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    change_id TEXT NOT NULL UNIQUE,
    book_id TEXT NOT NULL,
    source_url TEXT NOT NULL,
    change_type TEXT NOT NULL,
    severity TEXT NOT NULL,
    field_name TEXT NOT NULL,
    old_value TEXT,
    new_value TEXT,
    change_summary TEXT NOT NULL,
    detected_at TEXT NOT NULL,
    confidence_score REAL NOT NULL,
    processed INTEGER NOT NULL DEFAULT 0,
    processed_at TEXT
);

CREATE INDEX IF NOT EXISTS idx_change_logs_book_id ON change_logs(book_id);
CREATE INDEX IF NOT EXISTS idx_change_logs_detected_at ON change_logs(detected_at, id);
CREATE INDEX IF NOT EXISTS idx_change_logs_type ON change_logs(change_type, detected_at);
CREATE INDEX IF NOT EXISTS idx_change_logs_severity ON change_logs(severity, detected_at);

CREATE TABLE IF NOT EXISTS detection_results (
    detection_id TEXT PRIMARY KEY,
    run_timestamp TEXT NOT NULL,
    payload_json TEXT NOT NULL
) WITHOUT ROWID;

CREATE INDEX IF NOT EXISTS idx_detection_results_timestamp
    ON detection_results(run_timestamp);

CREATE TABLE IF NOT EXISTS daily_reports (
    report_id TEXT PRIMARY KEY,
    report_date TEXT NOT NULL,
    payload_json TEXT NOT NULL
) WITHOUT ROWID;

CREATE INDEX IF NOT EXISTS idx_daily_reports_date ON daily_reports(report_date);
"#;

/// Fixed-width UTC timestamp so lexicographic range scans match time order.
fn ts_to_sql(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn ts_from_sql(s: &str) -> StoreResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StoreError::Decode(format!("{s}: {e}")))
}

/// Filter for book listings. Empty filter matches everything.
#[derive(Debug, Clone, Default)]
pub struct BookFilter {
    pub category: Option<String>,
    pub availability: Option<String>,
    pub min_price: Option<f64>,
    pub max_price: Option<f64>,
    pub rating: Option<u8>,
    pub status: Option<BookStatus>,
}

/// Per-outcome counts of an unordered batch insert.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BatchOutcome {
    pub inserted: u64,
    pub duplicates: u64,
    pub rejected: u64,
}

/// Filter for the change-log listing endpoints.
#[derive(Debug, Clone, Default)]
pub struct ChangeFilter {
    pub change_type: Option<ChangeType>,
    pub severity: Option<ChangeSeverity>,
    pub book_id: Option<String>,
    pub since: Option<DateTime<Utc>>,
}

#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

impl Store {
    pub fn open(path: &Path) -> StoreResult<Self> {
        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_CREATE;
        let conn = Connection::open_with_flags(path, flags)?;
        Self::from_connection(conn, &path.display().to_string())
    }

    /// Scratch store backed by memory only; used by tests.
    pub fn in_memory() -> StoreResult<Self> {
        let conn = Connection::open_in_memory()?;
        Self::from_connection(conn, ":memory:")
    }

    fn from_connection(conn: Connection, label: &str) -> StoreResult<Self> {
        conn.execute_batch(SCHEMA_SQL)?;

        let journal_mode: String = conn
            .query_row("PRAGMA journal_mode", [], |row| row.get(0))
            .unwrap_or_default();
        if journal_mode.to_lowercase() != "wal" && label != ":memory:" {
            warn!(%journal_mode, "WAL mode not active");
        }

        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM books", [], |row| row.get(0))
            .unwrap_or(0);
        info!(path = label, books = count, "store opened");

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    // ---- books ---------------------------------------------------------

    /// Insert a book; `Duplicate` if its source URL is already mirrored.
    /// Never overwrites.
    pub fn insert_book(&self, book: &Book) -> StoreResult<()> {
        book.validate().map_err(StoreError::Invariant)?;
        let payload = serde_json::to_string(book)?;
        let conn = self.conn.lock();
        let result = conn.execute(
            "INSERT INTO books (source_url, book_id, category, availability,
                 price_including_tax, rating, status, last_crawled_at,
                 created_at, updated_at, payload_json)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                book.source_url,
                crate::fingerprint::book_id(&book.source_url),
                book.category,
                book.availability.as_str(),
                price_as_f64(book),
                book.rating,
                book.status.as_str(),
                ts_to_sql(book.last_crawled_at),
                ts_to_sql(book.created_at),
                ts_to_sql(book.updated_at),
                payload,
            ],
        );
        match result {
            Ok(_) => Ok(()),
            Err(e) if is_unique_violation(&e) => Err(StoreError::Duplicate(book.source_url.clone())),
            Err(e) => Err(e.into()),
        }
    }

    /// Unordered batch insert: a duplicate or invalid row mid-batch does not
    /// abort the rest.
    pub fn insert_books_batch(&self, books: &[Book]) -> StoreResult<BatchOutcome> {
        let mut outcome = BatchOutcome::default();
        for book in books {
            match self.insert_book(book) {
                Ok(()) => outcome.inserted += 1,
                Err(StoreError::Duplicate(_)) => outcome.duplicates += 1,
                Err(StoreError::Invariant(reason)) => {
                    warn!(url = %book.source_url, %reason, "batch insert rejected book");
                    outcome.rejected += 1;
                }
                Err(e) => return Err(e),
            }
        }
        debug!(
            inserted = outcome.inserted,
            duplicates = outcome.duplicates,
            rejected = outcome.rejected,
            "batch insert finished"
        );
        Ok(outcome)
    }

    /// Insert-or-replace the mirrored state of a book.
    pub fn upsert_book(&self, book: &Book) -> StoreResult<()> {
        book.validate().map_err(StoreError::Invariant)?;
        let payload = serde_json::to_string(book)?;
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO books (source_url, book_id, category, availability,
                 price_including_tax, rating, status, last_crawled_at,
                 created_at, updated_at, payload_json)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
             ON CONFLICT(source_url) DO UPDATE SET
                 category = excluded.category,
                 availability = excluded.availability,
                 price_including_tax = excluded.price_including_tax,
                 rating = excluded.rating,
                 status = excluded.status,
                 last_crawled_at = excluded.last_crawled_at,
                 updated_at = excluded.updated_at,
                 payload_json = excluded.payload_json",
            params![
                book.source_url,
                crate::fingerprint::book_id(&book.source_url),
                book.category,
                book.availability.as_str(),
                price_as_f64(book),
                book.rating,
                book.status.as_str(),
                ts_to_sql(book.last_crawled_at),
                ts_to_sql(book.created_at),
                ts_to_sql(book.updated_at),
                payload,
            ],
        )?;
        Ok(())
    }

    pub fn get_book_by_url(&self, source_url: &str) -> StoreResult<Option<Book>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached("SELECT payload_json FROM books WHERE source_url = ?1")?;
        let mut rows = stmt.query(params![source_url])?;
        match rows.next()? {
            Some(row) => {
                let payload: String = row.get(0)?;
                Ok(Some(serde_json::from_str(&payload)?))
            }
            None => Ok(None),
        }
    }

    /// Look up a book by its derived identifier.
    pub fn get_book_by_book_id(&self, book_id: &str) -> StoreResult<Option<Book>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached("SELECT payload_json FROM books WHERE book_id = ?1")?;
        let mut rows = stmt.query(params![book_id])?;
        match rows.next()? {
            Some(row) => {
                let payload: String = row.get(0)?;
                Ok(Some(serde_json::from_str(&payload)?))
            }
            None => Ok(None),
        }
    }

    pub fn book_exists_by_url(&self, source_url: &str) -> StoreResult<bool> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached("SELECT 1 FROM books WHERE source_url = ?1")?;
        Ok(stmt.exists(params![source_url])?)
    }

    /// Soft delete: keep the row, flip its status. Returns false when the
    /// book is unknown.
    pub fn soft_mark_removed(&self, source_url: &str) -> StoreResult<bool> {
        let Some(mut book) = self.get_book_by_url(source_url)? else {
            return Ok(false);
        };
        if book.status == BookStatus::Removed {
            return Ok(true);
        }
        book.status = BookStatus::Removed;
        book.updated_at = Utc::now();
        self.upsert_book(&book)?;
        Ok(true)
    }

    pub fn iter_books(&self, filter: &BookFilter, limit: Option<usize>) -> StoreResult<Vec<Book>> {
        self.iter_books_page(filter, limit, 0)
    }

    pub fn iter_books_page(
        &self,
        filter: &BookFilter,
        limit: Option<usize>,
        offset: usize,
    ) -> StoreResult<Vec<Book>> {
        let mut sql = String::from("SELECT payload_json FROM books WHERE 1=1");
        let mut args: Vec<Box<dyn rusqlite::types::ToSql>> = Vec::new();
        if let Some(category) = &filter.category {
            sql.push_str(" AND category = ?");
            args.push(Box::new(category.clone()));
        }
        if let Some(availability) = &filter.availability {
            sql.push_str(" AND availability = ?");
            args.push(Box::new(availability.clone()));
        }
        if let Some(min) = filter.min_price {
            sql.push_str(" AND price_including_tax >= ?");
            args.push(Box::new(min));
        }
        if let Some(max) = filter.max_price {
            sql.push_str(" AND price_including_tax <= ?");
            args.push(Box::new(max));
        }
        if let Some(rating) = filter.rating {
            sql.push_str(" AND rating = ?");
            args.push(Box::new(rating));
        }
        if let Some(status) = filter.status {
            sql.push_str(" AND status = ?");
            args.push(Box::new(status.as_str().to_string()));
        }
        sql.push_str(" ORDER BY source_url");
        if let Some(limit) = limit {
            sql.push_str(&format!(" LIMIT {limit} OFFSET {offset}"));
        }

        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(rusqlite::params_from_iter(args.iter().map(|a| a.as_ref())), |row| {
            row.get::<_, String>(0)
        })?;
        let mut books = Vec::new();
        for payload in rows {
            books.push(serde_json::from_str(&payload?)?);
        }
        Ok(books)
    }

    pub fn count_books(&self) -> StoreResult<u64> {
        let conn = self.conn.lock();
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM books", [], |row| row.get(0))?;
        Ok(count as u64)
    }

    pub fn count_books_with_status(&self, status: BookStatus) -> StoreResult<u64> {
        let conn = self.conn.lock();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM books WHERE status = ?1",
            params![status.as_str()],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    pub fn count_categories(&self) -> StoreResult<u64> {
        let conn = self.conn.lock();
        let count: i64 =
            conn.query_row("SELECT COUNT(DISTINCT category) FROM books", [], |row| row.get(0))?;
        Ok(count as u64)
    }

    // ---- fingerprints --------------------------------------------------

    pub fn insert_fingerprint(&self, fp: &Fingerprint) -> StoreResult<()> {
        let conn = self.conn.lock();
        let result = conn.execute(
            "INSERT INTO fingerprints (book_id, source_url, content_hash, price_hash,
                 availability_hash, metadata_hash, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                fp.book_id,
                fp.source_url,
                fp.content_hash,
                fp.price_hash,
                fp.availability_hash,
                fp.metadata_hash,
                ts_to_sql(fp.created_at),
                ts_to_sql(fp.updated_at),
            ],
        );
        match result {
            Ok(_) => Ok(()),
            Err(e) if is_unique_violation(&e) => Err(StoreError::Duplicate(fp.book_id.clone())),
            Err(e) => Err(e.into()),
        }
    }

    /// Upsert: create when absent, otherwise replace hashes and bump
    /// updated_at, preserving created_at.
    pub fn update_fingerprint(&self, fp: &Fingerprint) -> StoreResult<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO fingerprints (book_id, source_url, content_hash, price_hash,
                 availability_hash, metadata_hash, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
             ON CONFLICT(book_id) DO UPDATE SET
                 source_url = excluded.source_url,
                 content_hash = excluded.content_hash,
                 price_hash = excluded.price_hash,
                 availability_hash = excluded.availability_hash,
                 metadata_hash = excluded.metadata_hash,
                 updated_at = excluded.updated_at",
            params![
                fp.book_id,
                fp.source_url,
                fp.content_hash,
                fp.price_hash,
                fp.availability_hash,
                fp.metadata_hash,
                ts_to_sql(fp.created_at),
                ts_to_sql(fp.updated_at),
            ],
        )?;
        Ok(())
    }

    pub fn delete_fingerprint(&self, book_id: &str) -> StoreResult<bool> {
        let conn = self.conn.lock();
        let deleted = conn.execute("DELETE FROM fingerprints WHERE book_id = ?1", params![book_id])?;
        Ok(deleted > 0)
    }

    pub fn get_fingerprint(&self, book_id: &str) -> StoreResult<Option<Fingerprint>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT book_id, source_url, content_hash, price_hash, availability_hash,
                    metadata_hash, created_at, updated_at
             FROM fingerprints WHERE book_id = ?1",
        )?;
        let mut rows = stmt.query(params![book_id])?;
        match rows.next()? {
            Some(row) => Ok(Some(fingerprint_from_row(row)?)),
            None => Ok(None),
        }
    }

    pub fn all_fingerprints(&self) -> StoreResult<Vec<Fingerprint>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT book_id, source_url, content_hash, price_hash, availability_hash,
                    metadata_hash, created_at, updated_at
             FROM fingerprints ORDER BY book_id",
        )?;
        let mut rows = stmt.query([])?;
        let mut fingerprints = Vec::new();
        while let Some(row) = rows.next()? {
            fingerprints.push(fingerprint_from_row(row)?);
        }
        Ok(fingerprints)
    }

    // ---- change log ----------------------------------------------------

    pub fn append_change(&self, record: &ChangeRecord) -> StoreResult<()> {
        let conn = self.conn.lock();
        let result = conn.execute(
            "INSERT INTO change_logs (change_id, book_id, source_url, change_type,
                 severity, field_name, old_value, new_value, change_summary,
                 detected_at, confidence_score, processed, processed_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
            params![
                record.change_id.to_string(),
                record.book_id,
                record.source_url,
                record.change_type.as_str(),
                record.severity.as_str(),
                record.field_name,
                record.old_value,
                record.new_value,
                record.change_summary,
                ts_to_sql(record.detected_at),
                record.confidence_score,
                record.processed as i64,
                record.processed_at.map(ts_to_sql),
            ],
        );
        match result {
            Ok(_) => Ok(()),
            Err(e) if is_unique_violation(&e) => {
                Err(StoreError::Duplicate(record.change_id.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Flip the processed flag on an existing change record. The only
    /// permitted mutation of the change log.
    pub fn mark_change_processed(&self, change_id: Uuid) -> StoreResult<bool> {
        let conn = self.conn.lock();
        let updated = conn.execute(
            "UPDATE change_logs SET processed = 1, processed_at = ?1
             WHERE change_id = ?2 AND processed = 0",
            params![ts_to_sql(Utc::now()), change_id.to_string()],
        )?;
        Ok(updated > 0)
    }

    pub fn changes_filtered(
        &self,
        filter: &ChangeFilter,
        limit: Option<usize>,
    ) -> StoreResult<Vec<ChangeRecord>> {
        let mut sql = String::from(
            "SELECT change_id, book_id, source_url, change_type, severity, field_name,
                    old_value, new_value, change_summary, detected_at, confidence_score,
                    processed, processed_at
             FROM change_logs WHERE 1=1",
        );
        let mut args: Vec<Box<dyn rusqlite::types::ToSql>> = Vec::new();
        if let Some(change_type) = filter.change_type {
            sql.push_str(" AND change_type = ?");
            args.push(Box::new(change_type.as_str().to_string()));
        }
        if let Some(severity) = filter.severity {
            sql.push_str(" AND severity = ?");
            args.push(Box::new(severity.as_str().to_string()));
        }
        if let Some(book_id) = &filter.book_id {
            sql.push_str(" AND book_id = ?");
            args.push(Box::new(book_id.clone()));
        }
        if let Some(since) = filter.since {
            sql.push_str(" AND detected_at >= ?");
            args.push(Box::new(ts_to_sql(since)));
        }
        sql.push_str(" ORDER BY detected_at DESC, id DESC");
        if let Some(limit) = limit {
            sql.push_str(&format!(" LIMIT {limit}"));
        }

        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&sql)?;
        let mut rows = stmt.query(rusqlite::params_from_iter(args.iter().map(|a| a.as_ref())))?;
        let mut records = Vec::new();
        while let Some(row) = rows.next()? {
            records.push(change_from_row(row)?);
        }
        Ok(records)
    }

    /// Change records within [from, to), ascending by detection time with
    /// insertion-order tie-break.
    pub fn changes_in_range(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> StoreResult<Vec<ChangeRecord>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT change_id, book_id, source_url, change_type, severity, field_name,
                    old_value, new_value, change_summary, detected_at, confidence_score,
                    processed, processed_at
             FROM change_logs
             WHERE detected_at >= ?1 AND detected_at < ?2
             ORDER BY detected_at ASC, id ASC",
        )?;
        let mut rows = stmt.query(params![ts_to_sql(from), ts_to_sql(to)])?;
        let mut records = Vec::new();
        while let Some(row) = rows.next()? {
            records.push(change_from_row(row)?);
        }
        Ok(records)
    }

    pub fn count_changes(&self) -> StoreResult<u64> {
        let conn = self.conn.lock();
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM change_logs", [], |row| row.get(0))?;
        Ok(count as u64)
    }

    // ---- detection runs ------------------------------------------------

    pub fn append_detection_run(&self, run: &DetectionRun) -> StoreResult<()> {
        let payload = serde_json::to_string(run)?;
        let conn = self.conn.lock();
        let result = conn.execute(
            "INSERT INTO detection_results (detection_id, run_timestamp, payload_json)
             VALUES (?1, ?2, ?3)",
            params![run.detection_id.to_string(), ts_to_sql(run.run_timestamp), payload],
        );
        match result {
            Ok(_) => Ok(()),
            Err(e) if is_unique_violation(&e) => {
                Err(StoreError::Duplicate(run.detection_id.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    pub fn detection_runs_in_range(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> StoreResult<Vec<DetectionRun>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT payload_json FROM detection_results
             WHERE run_timestamp >= ?1 AND run_timestamp < ?2
             ORDER BY run_timestamp ASC",
        )?;
        let rows = stmt.query_map(params![ts_to_sql(from), ts_to_sql(to)], |row| {
            row.get::<_, String>(0)
        })?;
        let mut runs = Vec::new();
        for payload in rows {
            runs.push(serde_json::from_str(&payload?)?);
        }
        Ok(runs)
    }

    // ---- daily reports -------------------------------------------------

    pub fn insert_daily_report(&self, report: &DailyReport) -> StoreResult<()> {
        let payload = serde_json::to_string(report)?;
        let conn = self.conn.lock();
        let result = conn.execute(
            "INSERT INTO daily_reports (report_id, report_date, payload_json)
             VALUES (?1, ?2, ?3)",
            params![
                report.report_id.to_string(),
                report.report_date.to_string(),
                payload
            ],
        );
        match result {
            Ok(_) => Ok(()),
            Err(e) if is_unique_violation(&e) => {
                Err(StoreError::Duplicate(report.report_id.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    pub fn recent_daily_reports(&self, limit: usize) -> StoreResult<Vec<DailyReport>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT payload_json FROM daily_reports ORDER BY report_date DESC LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![limit as i64], |row| row.get::<_, String>(0))?;
        let mut reports = Vec::new();
        for payload in rows {
            reports.push(serde_json::from_str(&payload?)?);
        }
        Ok(reports)
    }

    /// Delete stored reports older than the cutoff date. Returns the number
    /// removed.
    pub fn delete_reports_before(&self, cutoff: chrono::NaiveDate) -> StoreResult<u64> {
        let conn = self.conn.lock();
        let deleted = conn.execute(
            "DELETE FROM daily_reports WHERE report_date < ?1",
            params![cutoff.to_string()],
        )?;
        Ok(deleted as u64)
    }
}

fn price_as_f64(book: &Book) -> f64 {
    use rust_decimal::prelude::ToPrimitive;
    book.price_including_tax.to_f64().unwrap_or(0.0)
}

fn is_unique_violation(e: &rusqlite::Error) -> bool {
    matches!(
        e,
        rusqlite::Error::SqliteFailure(err, _) if err.code == ErrorCode::ConstraintViolation
    )
}

fn fingerprint_from_row(row: &rusqlite::Row<'_>) -> StoreResult<Fingerprint> {
    Ok(Fingerprint {
        book_id: row.get(0)?,
        source_url: row.get(1)?,
        content_hash: row.get(2)?,
        price_hash: row.get(3)?,
        availability_hash: row.get(4)?,
        metadata_hash: row.get(5)?,
        created_at: ts_from_sql(&row.get::<_, String>(6)?)?,
        updated_at: ts_from_sql(&row.get::<_, String>(7)?)?,
    })
}

fn change_from_row(row: &rusqlite::Row<'_>) -> StoreResult<ChangeRecord> {
    let change_id: String = row.get(0)?;
    let change_type: String = row.get(3)?;
    let severity: String = row.get(4)?;
    Ok(ChangeRecord {
        change_id: Uuid::parse_str(&change_id)
            .map_err(|e| StoreError::Decode(format!("change_id {change_id}: {e}")))?,
        book_id: row.get(1)?,
        source_url: row.get(2)?,
        change_type: ChangeType::parse(&change_type)
            .ok_or_else(|| StoreError::Decode(format!("unknown change_type {change_type}")))?,
        severity: ChangeSeverity::parse(&severity)
            .ok_or_else(|| StoreError::Decode(format!("unknown severity {severity}")))?,
        field_name: row.get(5)?,
        old_value: row.get(6)?,
        new_value: row.get(7)?,
        change_summary: row.get(8)?,
        detected_at: ts_from_sql(&row.get::<_, String>(9)?)?,
        confidence_score: row.get(10)?,
        processed: row.get::<_, i64>(11)? != 0,
        processed_at: row
            .get::<_, Option<String>>(12)?
            .map(|s| ts_from_sql(&s))
            .transpose()?,
    })
}
