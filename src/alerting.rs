//! Log-channel alerting for detected changes.
//!
//! Alerts are structured log events only; there is no external notification
//! channel. A per-channel hourly budget and a cooldown keep a noisy day from
//! flooding the log.

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use tracing::{info, warn};

use crate::models::{ChangeRecord, ChangeSeverity, DailyReport};

#[derive(Debug, Clone)]
pub struct AlertConfig {
    pub enabled: bool,
    pub min_severity: ChangeSeverity,
    pub max_alerts_per_hour: u32,
    pub cooldown_minutes: i64,
}

impl Default for AlertConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            min_severity: ChangeSeverity::Low,
            max_alerts_per_hour: 10,
            cooldown_minutes: 30,
        }
    }
}

#[derive(Default)]
struct AlertHistory {
    sent_at: HashMap<&'static str, Vec<DateTime<Utc>>>,
}

pub struct AlertManager {
    config: AlertConfig,
    history: Mutex<AlertHistory>,
}

impl AlertManager {
    pub fn new(config: AlertConfig) -> Self {
        Self {
            config,
            history: Mutex::new(AlertHistory::default()),
        }
    }

    /// Emit a summary alert for a batch of changes, filtered by severity and
    /// bounded by the hourly budget and cooldown. Returns whether an alert
    /// was emitted.
    pub fn process_changes(&self, changes: &[ChangeRecord]) -> bool {
        if !self.config.enabled {
            return false;
        }

        let significant: Vec<&ChangeRecord> = changes
            .iter()
            .filter(|c| c.severity >= self.config.min_severity)
            .collect();
        if significant.is_empty() {
            return false;
        }
        if !self.try_acquire("change_alert") {
            return false;
        }

        let high = significant
            .iter()
            .filter(|c| c.severity >= ChangeSeverity::High)
            .count();
        warn!(
            total = significant.len(),
            high_severity = high,
            first = %significant[0].change_summary,
            "change alert"
        );
        for change in significant.iter().take(10) {
            info!(
                change_type = %change.change_type,
                severity = %change.severity,
                book_id = %change.book_id,
                summary = %change.change_summary,
                "detected change"
            );
        }
        true
    }

    /// Emit the end-of-day summary after report generation. Not rate
    /// limited: it fires once per day by construction.
    pub fn send_daily_summary(&self, report: &DailyReport) {
        info!(
            date = %report.report_date,
            books_checked = report.books_checked,
            changes = report.changes_detected,
            new_books = report.new_books_added,
            updated = report.books_updated,
            removed = report.books_removed,
            health = report.system_health_score,
            "daily summary"
        );
    }

    /// Hourly budget + cooldown for one alert channel.
    fn try_acquire(&self, channel: &'static str) -> bool {
        let now = Utc::now();
        let mut history = self.history.lock();
        let sent = history.sent_at.entry(channel).or_default();

        sent.retain(|t| now - *t < Duration::hours(1));
        if sent.len() as u32 >= self.config.max_alerts_per_hour {
            return false;
        }
        if let Some(last) = sent.last() {
            if now - *last < Duration::minutes(self.config.cooldown_minutes) {
                return false;
            }
        }
        sent.push(now);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ChangeType;

    fn change(severity: ChangeSeverity) -> ChangeRecord {
        ChangeRecord::new(
            "book_x".into(),
            "https://books.example/1".into(),
            ChangeType::PriceChange,
            severity,
            "price_including_tax".into(),
            Some("1.00".into()),
            Some("2.00".into()),
            "price moved".into(),
        )
    }

    #[test]
    fn severity_filter_drops_quiet_changes() {
        let manager = AlertManager::new(AlertConfig {
            min_severity: ChangeSeverity::High,
            ..Default::default()
        });
        assert!(!manager.process_changes(&[change(ChangeSeverity::Low)]));
        assert!(manager.process_changes(&[change(ChangeSeverity::High)]));
    }

    #[test]
    fn cooldown_suppresses_back_to_back_alerts() {
        let manager = AlertManager::new(AlertConfig::default());
        assert!(manager.process_changes(&[change(ChangeSeverity::High)]));
        // Second alert inside the cooldown window is suppressed.
        assert!(!manager.process_changes(&[change(ChangeSeverity::High)]));
    }

    #[test]
    fn disabled_manager_never_alerts() {
        let manager = AlertManager::new(AlertConfig {
            enabled: false,
            ..Default::default()
        });
        assert!(!manager.process_changes(&[change(ChangeSeverity::Critical)]));
    }
}
