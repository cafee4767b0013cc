//! Core domain types shared across the crawler, detection pipeline, store,
//! and API layers.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Stock status as shown on a book's detail page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Availability {
    InStock,
    OutOfStock,
}

impl Availability {
    pub fn as_str(&self) -> &'static str {
        match self {
            Availability::InStock => "in_stock",
            Availability::OutOfStock => "out_of_stock",
        }
    }
}

impl fmt::Display for Availability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle state of a mirrored book row.
///
/// `Removed` is a soft mark: the row stays in the store so the change log
/// keeps a referent, and the fingerprint is retained.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BookStatus {
    Active,
    Removed,
}

impl BookStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BookStatus::Active => "active",
            BookStatus::Removed => "removed",
        }
    }
}

/// A book as mirrored from the upstream catalog.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Book {
    pub name: String,
    pub description: String,
    pub category: String,
    pub price_including_tax: Decimal,
    pub price_excluding_tax: Decimal,
    pub availability: Availability,
    /// 1..=5 stars, absent when the page shows no rating.
    pub rating: Option<u8>,
    pub number_of_reviews: u32,
    pub image_url: String,
    pub source_url: String,
    pub status: BookStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_crawled_at: DateTime<Utc>,
}

impl Book {
    /// Write-side invariants: prices strictly positive, rating in range.
    /// The store rejects rows that fail this check.
    pub fn validate(&self) -> Result<(), String> {
        if self.price_including_tax <= Decimal::ZERO {
            return Err(format!(
                "price_including_tax must be positive, got {}",
                self.price_including_tax
            ));
        }
        if self.price_excluding_tax <= Decimal::ZERO {
            return Err(format!(
                "price_excluding_tax must be positive, got {}",
                self.price_excluding_tax
            ));
        }
        if let Some(r) = self.rating {
            if !(1..=5).contains(&r) {
                return Err(format!("rating must be within 1..=5, got {}", r));
            }
        }
        if self.source_url.is_empty() {
            return Err("source_url must not be empty".to_string());
        }
        Ok(())
    }
}

/// The four stable content hashes that identify a book for change-detection
/// purposes. Keyed by `book_id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fingerprint {
    pub book_id: String,
    pub source_url: String,
    pub content_hash: String,
    pub price_hash: String,
    pub availability_hash: String,
    pub metadata_hash: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Classification of a detected change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeType {
    NewBook,
    PriceChange,
    AvailabilityChange,
    DescriptionChange,
    ImageChange,
    RatingChange,
    ReviewsChange,
    CategoryChange,
    BookRemoved,
}

impl ChangeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeType::NewBook => "new_book",
            ChangeType::PriceChange => "price_change",
            ChangeType::AvailabilityChange => "availability_change",
            ChangeType::DescriptionChange => "description_change",
            ChangeType::ImageChange => "image_change",
            ChangeType::RatingChange => "rating_change",
            ChangeType::ReviewsChange => "reviews_change",
            ChangeType::CategoryChange => "category_change",
            ChangeType::BookRemoved => "book_removed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "new_book" => Some(ChangeType::NewBook),
            "price_change" => Some(ChangeType::PriceChange),
            "availability_change" => Some(ChangeType::AvailabilityChange),
            "description_change" => Some(ChangeType::DescriptionChange),
            "image_change" => Some(ChangeType::ImageChange),
            "rating_change" => Some(ChangeType::RatingChange),
            "reviews_change" => Some(ChangeType::ReviewsChange),
            "category_change" => Some(ChangeType::CategoryChange),
            "book_removed" => Some(ChangeType::BookRemoved),
            _ => None,
        }
    }
}

impl fmt::Display for ChangeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeSeverity {
    Low,
    Medium,
    High,
    Critical,
}

impl ChangeSeverity {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeSeverity::Low => "low",
            ChangeSeverity::Medium => "medium",
            ChangeSeverity::High => "high",
            ChangeSeverity::Critical => "critical",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "low" => Some(ChangeSeverity::Low),
            "medium" => Some(ChangeSeverity::Medium),
            "high" => Some(ChangeSeverity::High),
            "critical" => Some(ChangeSeverity::Critical),
            _ => None,
        }
    }
}

impl fmt::Display for ChangeSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The diff-relevant fields of a book, in the stable order the differ walks
/// them. The first seven are the content-fingerprint subset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiffField {
    Name,
    Description,
    Category,
    PriceIncludingTax,
    Availability,
    Rating,
    NumberOfReviews,
    PriceExcludingTax,
    ImageUrl,
}

impl DiffField {
    pub const ALL: [DiffField; 9] = [
        DiffField::Name,
        DiffField::Description,
        DiffField::Category,
        DiffField::PriceIncludingTax,
        DiffField::Availability,
        DiffField::Rating,
        DiffField::NumberOfReviews,
        DiffField::PriceExcludingTax,
        DiffField::ImageUrl,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            DiffField::Name => "name",
            DiffField::Description => "description",
            DiffField::Category => "category",
            DiffField::PriceIncludingTax => "price_including_tax",
            DiffField::PriceExcludingTax => "price_excluding_tax",
            DiffField::Availability => "availability",
            DiffField::Rating => "rating",
            DiffField::NumberOfReviews => "number_of_reviews",
            DiffField::ImageUrl => "image_url",
        }
    }
}

/// A single field value as it appears in a change record. Rendering uses the
/// same canonical forms as the fingerprint so that downstream consumers of
/// `old_value`/`new_value` never see a second serialization of the same data.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Text(String),
    Price(Decimal),
    Count(u32),
    Rating(Option<u8>),
    Availability(Availability),
}

impl FieldValue {
    /// Canonical string form. Tests pin these exact renderings.
    pub fn canonical(&self) -> String {
        match self {
            FieldValue::Text(s) => crate::fingerprint::canonical_text(s),
            FieldValue::Price(d) => crate::fingerprint::canonical_decimal(*d),
            FieldValue::Count(n) => n.to_string(),
            FieldValue::Rating(Some(r)) => r.to_string(),
            FieldValue::Rating(None) => "null".to_string(),
            FieldValue::Availability(a) => a.as_str().to_string(),
        }
    }
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.canonical())
    }
}

/// Immutable append-only record of one detected change.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeRecord {
    pub change_id: Uuid,
    pub book_id: String,
    pub source_url: String,
    pub change_type: ChangeType,
    pub severity: ChangeSeverity,
    pub field_name: String,
    pub old_value: Option<String>,
    pub new_value: Option<String>,
    pub change_summary: String,
    pub detected_at: DateTime<Utc>,
    pub confidence_score: f64,
    pub processed: bool,
    pub processed_at: Option<DateTime<Utc>>,
}

impl ChangeRecord {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        book_id: String,
        source_url: String,
        change_type: ChangeType,
        severity: ChangeSeverity,
        field_name: String,
        old_value: Option<String>,
        new_value: Option<String>,
        change_summary: String,
    ) -> Self {
        Self {
            change_id: Uuid::new_v4(),
            book_id,
            source_url,
            change_type,
            severity,
            field_name,
            old_value,
            new_value,
            change_summary,
            detected_at: Utc::now(),
            confidence_score: 1.0,
            processed: false,
            processed_at: None,
        }
    }
}

/// Summary document for one reconciliation run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectionRun {
    pub detection_id: Uuid,
    pub run_timestamp: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub total_books_checked: u64,
    pub changes_detected: u64,
    pub new_books: u64,
    pub updated_books: u64,
    pub removed_books: u64,
    pub restored_books: u64,
    pub orphan_fingerprints_removed: u64,
    pub detection_duration_seconds: f64,
    pub average_book_processing_time: f64,
    pub changes_by_type: BTreeMap<ChangeType, u64>,
    pub changes_by_severity: BTreeMap<ChangeSeverity, u64>,
    pub success: bool,
    pub errors: Vec<String>,
}

impl DetectionRun {
    pub fn started_now() -> Self {
        Self {
            detection_id: Uuid::new_v4(),
            run_timestamp: Utc::now(),
            completed_at: None,
            total_books_checked: 0,
            changes_detected: 0,
            new_books: 0,
            updated_books: 0,
            removed_books: 0,
            restored_books: 0,
            orphan_fingerprints_removed: 0,
            detection_duration_seconds: 0.0,
            average_book_processing_time: 0.0,
            changes_by_type: BTreeMap::new(),
            changes_by_severity: BTreeMap::new(),
            success: true,
            errors: Vec::new(),
        }
    }
}

/// Entry in a daily report's new-book list.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewBookEntry {
    pub book_id: String,
    pub name: Option<String>,
    pub detected_at: DateTime<Utc>,
}

/// Aggregation of all detection runs and change records for one UTC day.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DailyReport {
    pub report_id: Uuid,
    pub report_date: NaiveDate,
    pub generated_at: DateTime<Utc>,
    pub total_books_in_system: u64,
    pub active_books: u64,
    pub removed_books_in_system: u64,
    pub total_categories: u64,
    pub books_checked: u64,
    pub changes_detected: u64,
    pub new_books_added: u64,
    pub books_updated: u64,
    pub books_removed: u64,
    pub changes_by_type: BTreeMap<ChangeType, u64>,
    pub changes_by_severity: BTreeMap<ChangeSeverity, u64>,
    pub total_processing_time_seconds: f64,
    pub average_book_processing_time: f64,
    pub significant_changes: Vec<ChangeRecord>,
    pub new_books: Vec<NewBookEntry>,
    pub errors_encountered: Vec<String>,
    pub system_health_score: f64,
}

/// On-disk crawl cursor. Single writer (the crawler); written atomically.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrawlState {
    pub last_processed_page: u32,
    pub total_pages: Option<u32>,
    pub books_processed: u64,
    pub last_processed_url: Option<String>,
    pub crawl_start_time: DateTime<Utc>,
    pub last_update_time: DateTime<Utc>,
    pub errors: Vec<String>,
}

impl Default for CrawlState {
    fn default() -> Self {
        let now = Utc::now();
        Self {
            last_processed_page: 1,
            total_pages: None,
            books_processed: 0,
            last_processed_url: None,
            crawl_start_time: now,
            last_update_time: now,
            errors: Vec::new(),
        }
    }
}

/// Outcome of a full-catalog crawl.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrawlResult {
    pub success: bool,
    pub books_crawled: u64,
    pub errors: Vec<String>,
    pub duration_seconds: f64,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
}
