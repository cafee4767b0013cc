//! Daily report generation: aggregate one UTC day of detection runs and
//! change records into a single document, persist it, and export it to the
//! reports directory as JSON or CSV.

use std::collections::BTreeMap;
use std::path::PathBuf;

use chrono::{DateTime, Duration, NaiveDate, Utc};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::ReportFormat;
use crate::models::{
    ChangeRecord, ChangeSeverity, ChangeType, DailyReport, DetectionRun, NewBookEntry,
};
use crate::store::{Store, StoreError};

/// System health for a day's activity. Success rate dominates; detecting
/// changes earns a small bonus because it shows the pipeline is live.
/// Always within [0, 1], rounded to two decimals.
pub fn health_score(books_checked: u64, changes_detected: u64, errors_count: u64) -> f64 {
    if books_checked == 0 {
        return 0.0;
    }
    let books = books_checked.max(1) as f64;
    let success_rate = 1.0 - (errors_count as f64 / books);
    let change_bonus = (changes_detected as f64 / books).min(0.1);
    let score = (success_rate + change_bonus).min(1.0).max(0.0);
    (score * 100.0).round() / 100.0
}

fn day_bounds(date: NaiveDate) -> (DateTime<Utc>, DateTime<Utc>) {
    let start = date.and_hms_opt(0, 0, 0).expect("midnight is valid").and_utc();
    (start, start + Duration::days(1))
}

pub struct ReportGenerator {
    store: Store,
    reports_dir: PathBuf,
}

impl ReportGenerator {
    pub fn new(store: Store, reports_dir: PathBuf) -> Self {
        Self { store, reports_dir }
    }

    /// Build, persist, and export the report for `date` (default: today).
    pub fn generate_daily_report(
        &self,
        date: Option<NaiveDate>,
        format: ReportFormat,
    ) -> anyhow::Result<DailyReport> {
        let report_date = date.unwrap_or_else(|| Utc::now().date_naive());
        let (from, to) = day_bounds(report_date);

        let runs = self.store.detection_runs_in_range(from, to)?;
        let changes = self.store.changes_in_range(from, to)?;
        let report = self.aggregate(report_date, &runs, &changes)?;

        if let Err(e) = self.store.insert_daily_report(&report) {
            // A second generation for the same day gets a fresh report_id,
            // so duplicates here mean an id collision, not a reissue.
            warn!(error = %e, "failed to persist daily report");
        }

        match format {
            ReportFormat::Json => self.export_json(&report)?,
            ReportFormat::Csv => self.export_csv(&report)?,
        }

        info!(
            report_id = %report.report_id,
            date = %report.report_date,
            changes = report.changes_detected,
            health = report.system_health_score,
            "daily report generated"
        );
        Ok(report)
    }

    fn aggregate(
        &self,
        report_date: NaiveDate,
        runs: &[DetectionRun],
        changes: &[ChangeRecord],
    ) -> Result<DailyReport, StoreError> {
        let mut books_checked = 0u64;
        let mut changes_detected = 0u64;
        let mut new_books_added = 0u64;
        let mut books_updated = 0u64;
        let mut books_removed = 0u64;
        let mut total_processing_time = 0.0f64;
        let mut changes_by_type: BTreeMap<ChangeType, u64> = BTreeMap::new();
        let mut changes_by_severity: BTreeMap<ChangeSeverity, u64> = BTreeMap::new();
        let mut errors = Vec::new();

        for run in runs {
            books_checked += run.total_books_checked;
            changes_detected += run.changes_detected;
            new_books_added += run.new_books;
            books_updated += run.updated_books;
            books_removed += run.removed_books;
            total_processing_time += run.detection_duration_seconds;
            errors.extend(run.errors.iter().cloned());
            for (change_type, count) in &run.changes_by_type {
                *changes_by_type.entry(*change_type).or_insert(0) += count;
            }
            for (severity, count) in &run.changes_by_severity {
                *changes_by_severity.entry(*severity).or_insert(0) += count;
            }
        }

        let significant_changes: Vec<ChangeRecord> = changes
            .iter()
            .filter(|c| matches!(c.severity, ChangeSeverity::High | ChangeSeverity::Medium))
            .cloned()
            .collect();

        let new_books: Vec<NewBookEntry> = changes
            .iter()
            .filter(|c| c.change_type == ChangeType::NewBook)
            .map(|c| NewBookEntry {
                book_id: c.book_id.clone(),
                name: c.new_value.clone(),
                detected_at: c.detected_at,
            })
            .collect();

        let average = if runs.is_empty() {
            0.0
        } else {
            total_processing_time / runs.len() as f64
        };

        Ok(DailyReport {
            report_id: Uuid::new_v4(),
            report_date,
            generated_at: Utc::now(),
            total_books_in_system: self.store.count_books()?,
            active_books: self
                .store
                .count_books_with_status(crate::models::BookStatus::Active)?,
            removed_books_in_system: self
                .store
                .count_books_with_status(crate::models::BookStatus::Removed)?,
            total_categories: self.store.count_categories()?,
            books_checked,
            changes_detected,
            new_books_added,
            books_updated,
            books_removed,
            changes_by_type,
            changes_by_severity,
            total_processing_time_seconds: total_processing_time,
            average_book_processing_time: average,
            significant_changes,
            new_books,
            errors_encountered: errors.clone(),
            system_health_score: health_score(books_checked, changes_detected, errors.len() as u64),
        })
    }

    fn report_path(&self, report: &DailyReport, extension: &str) -> PathBuf {
        self.reports_dir.join(format!(
            "daily_report_{}.{extension}",
            report.report_date.format("%Y%m%d")
        ))
    }

    fn export_json(&self, report: &DailyReport) -> anyhow::Result<()> {
        std::fs::create_dir_all(&self.reports_dir)?;
        let path = self.report_path(report, "json");
        std::fs::write(&path, serde_json::to_string_pretty(report)?)?;
        debug!(path = %path.display(), "exported JSON report");
        Ok(())
    }

    fn export_csv(&self, report: &DailyReport) -> anyhow::Result<()> {
        std::fs::create_dir_all(&self.reports_dir)?;
        let path = self.report_path(report, "csv");
        let mut writer = csv::Writer::from_path(&path)?;

        writer.write_record([
            "Report ID",
            "Report Date",
            "Generated At",
            "Total Books in System",
            "Books Checked",
            "Changes Detected",
            "New Books Added",
            "Books Updated",
            "Books Removed",
            "Total Processing Time (s)",
            "Average Processing Time (s)",
            "System Health Score",
        ])?;
        writer.write_record([
            report.report_id.to_string(),
            report.report_date.to_string(),
            report.generated_at.format("%Y-%m-%d %H:%M:%S").to_string(),
            report.total_books_in_system.to_string(),
            report.books_checked.to_string(),
            report.changes_detected.to_string(),
            report.new_books_added.to_string(),
            report.books_updated.to_string(),
            report.books_removed.to_string(),
            format!("{:.3}", report.total_processing_time_seconds),
            format!("{:.3}", report.average_book_processing_time),
            format!("{:.2}", report.system_health_score),
        ])?;

        writer.write_record(["", "", "", "", "", "", "", "", "", "", "", ""])?;
        writer.write_record(["Changes by Type", "Count", "", "", "", "", "", "", "", "", "", ""])?;
        for (change_type, count) in &report.changes_by_type {
            let mut row = vec![change_type.as_str().to_string(), count.to_string()];
            row.resize(12, String::new());
            writer.write_record(&row)?;
        }

        writer.write_record(["Changes by Severity", "Count", "", "", "", "", "", "", "", "", "", ""])?;
        for (severity, count) in &report.changes_by_severity {
            let mut row = vec![severity.as_str().to_string(), count.to_string()];
            row.resize(12, String::new());
            writer.write_record(&row)?;
        }

        if !report.significant_changes.is_empty() {
            writer.write_record([
                "Significant Changes",
                "Type",
                "Severity",
                "Summary",
                "Detected At",
                "",
                "",
                "",
                "",
                "",
                "",
                "",
            ])?;
            for change in &report.significant_changes {
                let mut row = vec![
                    String::new(),
                    change.change_type.as_str().to_string(),
                    change.severity.as_str().to_string(),
                    change.change_summary.clone(),
                    change.detected_at.format("%Y-%m-%d %H:%M:%S").to_string(),
                ];
                row.resize(12, String::new());
                writer.write_record(&row)?;
            }
        }

        writer.flush()?;
        debug!(path = %path.display(), "exported CSV report");
        Ok(())
    }

    /// Reports for the last `days`, newest first.
    pub fn report_history(&self, days: usize) -> Result<Vec<DailyReport>, StoreError> {
        self.store.recent_daily_reports(days)
    }

    /// Drop stored reports older than the retention window.
    pub fn cleanup_old_reports(&self, retention_days: u32) -> Result<u64, StoreError> {
        let cutoff = Utc::now().date_naive() - Duration::days(retention_days as i64);
        let deleted = self.store.delete_reports_before(cutoff)?;
        if deleted > 0 {
            info!(deleted, retention_days, "cleaned up old reports");
        }
        Ok(deleted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ChangeRecord;

    #[test]
    fn health_score_is_pinned() {
        // No errors, a few changes: perfect score.
        assert_eq!(health_score(100, 5, 0), 1.0);
        // 10% errors, no changes.
        assert_eq!(health_score(100, 0, 10), 0.9);
        // Change bonus caps at 0.1.
        assert_eq!(health_score(100, 90, 10), 1.0);
        // No books checked at all.
        assert_eq!(health_score(0, 0, 0), 0.0);
    }

    #[test]
    fn health_score_stays_within_bounds() {
        for (books, changes, errors) in [
            (1u64, 0u64, 100u64),
            (1, 1000, 0),
            (1000, 0, 0),
            (3, 1, 2),
            (50, 5, 50),
        ] {
            let score = health_score(books, changes, errors);
            assert!((0.0..=1.0).contains(&score), "score {score} out of range");
        }
    }

    #[test]
    fn aggregates_runs_and_filters_changes() {
        let store = Store::in_memory().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let generator = ReportGenerator::new(store.clone(), dir.path().to_path_buf());

        let mut run = DetectionRun::started_now();
        run.total_books_checked = 10;
        run.changes_detected = 3;
        run.updated_books = 2;
        run.detection_duration_seconds = 4.0;
        run.changes_by_type.insert(ChangeType::PriceChange, 2);
        run.changes_by_type.insert(ChangeType::ReviewsChange, 1);
        run.changes_by_severity.insert(ChangeSeverity::High, 2);
        run.changes_by_severity.insert(ChangeSeverity::Low, 1);
        store.append_detection_run(&run).unwrap();

        let high = ChangeRecord::new(
            "b1".into(),
            "u1".into(),
            ChangeType::PriceChange,
            ChangeSeverity::High,
            "price_including_tax".into(),
            Some("1.00".into()),
            Some("2.00".into()),
            "price".into(),
        );
        let low = ChangeRecord::new(
            "b2".into(),
            "u2".into(),
            ChangeType::ReviewsChange,
            ChangeSeverity::Low,
            "number_of_reviews".into(),
            Some("1".into()),
            Some("2".into()),
            "reviews".into(),
        );
        let new_book = ChangeRecord::new(
            "b3".into(),
            "u3".into(),
            ChangeType::NewBook,
            ChangeSeverity::Medium,
            "new_book".into(),
            None,
            Some("Fresh Title".into()),
            "New book discovered: Fresh Title".into(),
        );
        for record in [&high, &low, &new_book] {
            store.append_change(record).unwrap();
        }

        let report = generator
            .generate_daily_report(None, ReportFormat::Json)
            .unwrap();

        assert_eq!(report.books_checked, 10);
        assert_eq!(report.changes_detected, 3);
        assert_eq!(report.changes_by_type[&ChangeType::PriceChange], 2);
        // high + medium survive the significance filter, low does not
        assert_eq!(report.significant_changes.len(), 2);
        assert_eq!(report.new_books.len(), 1);
        assert_eq!(report.new_books[0].name.as_deref(), Some("Fresh Title"));
        assert_eq!(report.system_health_score, 1.0);

        let expected = dir.path().join(format!(
            "daily_report_{}.json",
            report.report_date.format("%Y%m%d")
        ));
        assert!(expected.exists());
    }

    #[test]
    fn csv_export_writes_a_file() {
        let store = Store::in_memory().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let generator = ReportGenerator::new(store, dir.path().to_path_buf());

        let report = generator
            .generate_daily_report(None, ReportFormat::Csv)
            .unwrap();
        let path = dir.path().join(format!(
            "daily_report_{}.csv",
            report.report_date.format("%Y%m%d")
        ));
        let contents = std::fs::read_to_string(path).unwrap();
        assert!(contents.starts_with("Report ID,"));
    }

    #[test]
    fn empty_day_scores_zero_health() {
        let store = Store::in_memory().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let generator = ReportGenerator::new(store, dir.path().to_path_buf());
        let report = generator
            .generate_daily_report(None, ReportFormat::Json)
            .unwrap();
        assert_eq!(report.books_checked, 0);
        assert_eq!(report.system_health_score, 0.0);
    }
}
