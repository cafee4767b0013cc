//! Content fingerprinting: stable hashes over a book's diff-relevant fields.
//!
//! Hashes are SHA-256 over canonical JSON and must be bytewise identical
//! across processes and hosts. Canonical form: keys sorted lexicographically,
//! prices as two-fractional-digit decimal strings, absent values as `null`,
//! strings NFC-normalized and untrimmed, counts and ratings as JSON integers,
//! availability in its wire form.

use chrono::Utc;
use rust_decimal::Decimal;
use serde_json::json;
use sha2::{Digest, Sha256};
use unicode_normalization::UnicodeNormalization;

use crate::models::{Book, Fingerprint};

/// Canonical decimal rendering: exactly two fractional digits, no scientific
/// form. `19.9` renders as `"19.90"`, `20` as `"20.00"`.
pub fn canonical_decimal(d: Decimal) -> String {
    let mut d = d.round_dp(2);
    d.rescale(2);
    d.to_string()
}

/// NFC-normalized, untrimmed string form shared by the hashes and the
/// change-record value rendering.
pub fn canonical_text(s: &str) -> String {
    s.nfc().collect()
}

fn sha256_hex(payload: &str) -> String {
    format!("{:x}", Sha256::digest(payload.as_bytes()))
}

/// Derive the stable book identifier from a source URL.
///
/// MD5 is acceptable here: URLs are already unique, the hash only compacts
/// them into a fixed-width correlation key, and the `book_` prefix scopes
/// the namespace.
pub fn book_id(source_url: &str) -> String {
    format!("book_{:x}", md5::compute(source_url.as_bytes()))
}

fn rating_value(rating: Option<u8>) -> serde_json::Value {
    match rating {
        Some(r) => json!(r),
        None => serde_json::Value::Null,
    }
}

/// Canonical JSON for the content subset: name, description, category,
/// price_including_tax, availability, rating, number_of_reviews.
fn content_payload(book: &Book) -> String {
    // serde_json's default map is ordered, so keys serialize sorted.
    json!({
        "availability": book.availability.as_str(),
        "category": canonical_text(&book.category),
        "description": canonical_text(&book.description),
        "name": canonical_text(&book.name),
        "number_of_reviews": book.number_of_reviews,
        "price_including_tax": canonical_decimal(book.price_including_tax),
        "rating": rating_value(book.rating),
    })
    .to_string()
}

fn price_payload(book: &Book) -> String {
    json!({
        "price_excluding_tax": canonical_decimal(book.price_excluding_tax),
        "price_including_tax": canonical_decimal(book.price_including_tax),
    })
    .to_string()
}

fn availability_payload(book: &Book) -> String {
    json!({
        "availability": book.availability.as_str(),
        "number_of_reviews": book.number_of_reviews,
    })
    .to_string()
}

fn metadata_payload(book: &Book) -> String {
    json!({
        "category": canonical_text(&book.category),
        "description": canonical_text(&book.description),
        "image_url": canonical_text(&book.image_url),
        "rating": rating_value(book.rating),
    })
    .to_string()
}

/// Hash of all diff-relevant fields; the differ's fast-path key.
pub fn content_hash(book: &Book) -> String {
    sha256_hex(&content_payload(book))
}

pub fn price_hash(book: &Book) -> String {
    sha256_hex(&price_payload(book))
}

pub fn availability_hash(book: &Book) -> String {
    sha256_hex(&availability_payload(book))
}

pub fn metadata_hash(book: &Book) -> String {
    sha256_hex(&metadata_payload(book))
}

/// Compute the full fingerprint quadruple for a book.
pub fn fingerprint(book: &Book) -> Fingerprint {
    let now = Utc::now();
    Fingerprint {
        book_id: book_id(&book.source_url),
        source_url: book.source_url.clone(),
        content_hash: content_hash(book),
        price_hash: price_hash(book),
        availability_hash: availability_hash(book),
        metadata_hash: metadata_hash(book),
        created_at: now,
        updated_at: now,
    }
}
