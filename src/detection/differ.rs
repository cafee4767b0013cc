//! Field-level diff between the stored and freshly fetched state of a book.
//!
//! The stored fingerprint's `content_hash` is checked first: when it matches
//! the freshly computed hash the walk is skipped entirely, which is the
//! common case across a full catalog pass.

use crate::fingerprint;
use crate::models::{
    Book, ChangeRecord, ChangeSeverity, ChangeType, DiffField, FieldValue, Fingerprint,
};

/// One differing field with both values.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldChange {
    pub field: DiffField,
    pub old: FieldValue,
    pub new: FieldValue,
}

fn field_value(book: &Book, field: DiffField) -> FieldValue {
    match field {
        DiffField::Name => FieldValue::Text(book.name.clone()),
        DiffField::Description => FieldValue::Text(book.description.clone()),
        DiffField::Category => FieldValue::Text(book.category.clone()),
        DiffField::PriceIncludingTax => FieldValue::Price(book.price_including_tax),
        DiffField::PriceExcludingTax => FieldValue::Price(book.price_excluding_tax),
        DiffField::Availability => FieldValue::Availability(book.availability),
        DiffField::Rating => FieldValue::Rating(book.rating),
        DiffField::NumberOfReviews => FieldValue::Count(book.number_of_reviews),
        DiffField::ImageUrl => FieldValue::Text(book.image_url.clone()),
    }
}

fn values_equal(old: &FieldValue, new: &FieldValue) -> bool {
    match (old, new) {
        // Exact fixed-point equality; never rounded for comparison.
        (FieldValue::Price(a), FieldValue::Price(b)) => a == b,
        (a, b) => a == b,
    }
}

/// Classify a differing field. Total: every diff field maps to exactly one
/// (type, severity) pair.
pub fn classify_field(field: DiffField) -> (ChangeType, ChangeSeverity) {
    match field {
        DiffField::PriceIncludingTax | DiffField::PriceExcludingTax => {
            (ChangeType::PriceChange, ChangeSeverity::High)
        }
        DiffField::Availability => (ChangeType::AvailabilityChange, ChangeSeverity::Medium),
        DiffField::Rating => (ChangeType::RatingChange, ChangeSeverity::Medium),
        DiffField::NumberOfReviews => (ChangeType::ReviewsChange, ChangeSeverity::Low),
        DiffField::Category => (ChangeType::CategoryChange, ChangeSeverity::Medium),
        DiffField::ImageUrl => (ChangeType::ImageChange, ChangeSeverity::Low),
        DiffField::Description => (ChangeType::DescriptionChange, ChangeSeverity::Low),
        // Renames are rare but important.
        DiffField::Name => (ChangeType::DescriptionChange, ChangeSeverity::High),
    }
}

/// Walk the diff field set in its stable order and collect unequal pairs.
pub fn changed_fields(stored: &Book, current: &Book) -> Vec<FieldChange> {
    DiffField::ALL
        .iter()
        .filter_map(|&field| {
            let old = field_value(stored, field);
            let new = field_value(current, field);
            if values_equal(&old, &new) {
                None
            } else {
                Some(FieldChange { field, old, new })
            }
        })
        .collect()
}

/// Diff the stored record against the current one, producing one change
/// record per differing field. Returns an empty vec on the fingerprint
/// fast path.
pub fn diff_books(
    stored: &Book,
    current: &Book,
    stored_fingerprint: Option<&Fingerprint>,
) -> Vec<ChangeRecord> {
    if let Some(fp) = stored_fingerprint {
        if fp.content_hash == fingerprint::content_hash(current) {
            return Vec::new();
        }
    }

    let book_id = fingerprint::book_id(&current.source_url);
    changed_fields(stored, current)
        .into_iter()
        .map(|change| {
            let (change_type, severity) = classify_field(change.field);
            let old = change.old.canonical();
            let new = change.new.canonical();
            let summary = format!(
                "{} changed from '{}' to '{}'",
                change.field.as_str(),
                old,
                new
            );
            ChangeRecord::new(
                book_id.clone(),
                current.source_url.clone(),
                change_type,
                severity,
                change.field.as_str().to_string(),
                Some(old),
                Some(new),
                summary,
            )
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Availability, BookStatus};
    use chrono::Utc;
    use rust_decimal::Decimal;
    use std::str::FromStr;

    fn book() -> Book {
        let now = Utc::now();
        Book {
            name: "The Grand Design".to_string(),
            description: "A popular-science book.".to_string(),
            category: "Science".to_string(),
            price_including_tax: Decimal::from_str("19.99").unwrap(),
            price_excluding_tax: Decimal::from_str("19.99").unwrap(),
            availability: Availability::InStock,
            rating: Some(3),
            number_of_reviews: 12,
            image_url: "https://books.example/media/grand.jpg".to_string(),
            source_url: "https://books.example/catalogue/the-grand-design_405/index.html"
                .to_string(),
            status: BookStatus::Active,
            created_at: now,
            updated_at: now,
            last_crawled_at: now,
        }
    }

    #[test]
    fn identical_books_produce_no_changes() {
        let changes = diff_books(&book(), &book(), None);
        assert!(changes.is_empty());
    }

    #[test]
    fn fast_path_short_circuits_when_content_hash_matches() {
        let current = book();
        let fp = crate::fingerprint::fingerprint(&current);
        // Stored copy diverges, but the fingerprint says the current content
        // is what we already recorded, so nothing is emitted.
        let mut stale_stored = book();
        stale_stored.number_of_reviews = 999;
        assert!(diff_books(&stale_stored, &current, Some(&fp)).is_empty());
    }

    #[test]
    fn price_change_yields_single_high_severity_record() {
        let stored = book();
        let mut current = book();
        current.price_including_tax = Decimal::from_str("24.99").unwrap();

        let changes = diff_books(&stored, &current, None);
        assert_eq!(changes.len(), 1);
        let change = &changes[0];
        assert_eq!(change.change_type, ChangeType::PriceChange);
        assert_eq!(change.severity, ChangeSeverity::High);
        assert_eq!(change.field_name, "price_including_tax");
        assert_eq!(change.old_value.as_deref(), Some("19.99"));
        assert_eq!(change.new_value.as_deref(), Some("24.99"));
        assert_eq!(
            change.change_summary,
            "price_including_tax changed from '19.99' to '24.99'"
        );
        assert!((change.confidence_score - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn classification_table_is_pinned() {
        use ChangeSeverity::*;
        use ChangeType::*;
        let expected = [
            (DiffField::PriceIncludingTax, PriceChange, High),
            (DiffField::PriceExcludingTax, PriceChange, High),
            (DiffField::Availability, AvailabilityChange, Medium),
            (DiffField::Rating, RatingChange, Medium),
            (DiffField::NumberOfReviews, ReviewsChange, Low),
            (DiffField::Category, CategoryChange, Medium),
            (DiffField::ImageUrl, ImageChange, Low),
            (DiffField::Description, DescriptionChange, Low),
            (DiffField::Name, DescriptionChange, High),
        ];
        for (field, change_type, severity) in expected {
            assert_eq!(classify_field(field), (change_type, severity), "{field:?}");
        }
    }

    #[test]
    fn multiple_changes_emit_in_stable_field_order() {
        let stored = book();
        let mut current = book();
        current.name = "The Grand Design (2nd ed.)".to_string();
        current.price_including_tax = Decimal::from_str("21.00").unwrap();
        current.number_of_reviews = 13;

        let changes = diff_books(&stored, &current, None);
        let fields: Vec<_> = changes.iter().map(|c| c.field_name.as_str()).collect();
        assert_eq!(fields, vec!["name", "price_including_tax", "number_of_reviews"]);
    }

    #[test]
    fn rating_appearing_is_a_rating_change() {
        let mut stored = book();
        stored.rating = None;
        let current = book();

        let changes = diff_books(&stored, &current, None);
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].change_type, ChangeType::RatingChange);
        assert_eq!(changes[0].old_value.as_deref(), Some("null"));
        assert_eq!(changes[0].new_value.as_deref(), Some("3"));
    }

    #[test]
    fn zero_changes_means_every_field_compares_equal() {
        let stored = book();
        let current = book();
        assert!(diff_books(&stored, &current, None).is_empty());
        assert!(changed_fields(&stored, &current).is_empty());
    }

    #[test]
    fn equal_decimals_with_different_scales_do_not_diff() {
        let stored = book();
        let mut current = book();
        current.price_including_tax = Decimal::from_str("19.990").unwrap();
        assert!(diff_books(&stored, &current, None).is_empty());
    }
}
