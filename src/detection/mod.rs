//! Change detection: field-level diffing and the reconciliation loop.

pub mod differ;
pub mod reconciler;

pub use differ::{classify_field, diff_books, FieldChange};
pub use reconciler::{Reconciler, ReconcilerSettings};
