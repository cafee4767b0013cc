//! Environment-driven configuration.
//!
//! All knobs come from environment variables (a `.env` file is honored in
//! development). `Config::from_env` applies defaults and rejects values
//! outside the supported ranges.

use std::path::PathBuf;
use std::str::FromStr;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value for {key}: {reason}")]
    Invalid { key: &'static str, reason: String },
}

/// Output format for daily report files.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportFormat {
    Json,
    Csv,
}

impl ReportFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReportFormat::Json => "json",
            ReportFormat::Csv => "csv",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Json,
    Console,
}

#[derive(Debug, Clone)]
pub struct Config {
    // Store
    pub database_path: PathBuf,

    // Upstream site & fetcher
    pub base_url: String,
    pub rate_limit_per_second: f64,
    pub request_timeout_secs: u64,
    pub retry_attempts: u32,
    pub retry_delay_secs: f64,
    pub max_concurrent_requests: usize,

    // Reconciler
    pub max_concurrent_books: usize,
    pub batch_size: usize,
    pub expected_catalog_size: u64,
    pub restore_max_pages: u32,
    pub discovery_max_pages: u32,
    pub max_consecutive_page_errors: u32,

    // Crawler
    pub state_file: PathBuf,
    pub resume_on_failure: bool,
    pub checkpoint_interval: u32,

    // Scheduler
    pub schedule_hour: u32,
    pub schedule_minute: u32,
    pub timezone: String,
    pub enable_change_detection: bool,
    pub generate_daily_reports: bool,

    // Reports
    pub report_format: ReportFormat,
    pub report_retention_days: u32,
    pub reports_dir: PathBuf,

    // Logging
    pub log_level: String,
    pub log_format: LogFormat,
    pub log_file: Option<PathBuf>,
    pub debug: bool,

    // Read API
    pub api_host: String,
    pub api_port: u16,
    pub api_key: Option<String>,
}

fn env_str(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<T>().ok())
        .unwrap_or(default)
}

fn env_bool(key: &str, default: bool) -> bool {
    std::env::var(key)
        .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "on" | "ON" | "yes"))
        .unwrap_or(default)
}

impl Config {
    /// Load configuration from the process environment, applying defaults
    /// for anything unset.
    pub fn from_env() -> Result<Self, ConfigError> {
        let report_format = match env_str("REPORT_FORMAT", "json").to_lowercase().as_str() {
            "json" => ReportFormat::Json,
            "csv" => ReportFormat::Csv,
            other => {
                return Err(ConfigError::Invalid {
                    key: "REPORT_FORMAT",
                    reason: format!("expected json or csv, got {other}"),
                })
            }
        };

        let log_format = match env_str("LOG_FORMAT", "console").to_lowercase().as_str() {
            "json" => LogFormat::Json,
            "console" => LogFormat::Console,
            other => {
                return Err(ConfigError::Invalid {
                    key: "LOG_FORMAT",
                    reason: format!("expected json or console, got {other}"),
                })
            }
        };

        let config = Self {
            database_path: PathBuf::from(env_str("DATABASE_PATH", "bookwatch.db")),

            base_url: env_str("BASE_URL", "https://books.toscrape.com")
                .trim_end_matches('/')
                .to_string(),
            rate_limit_per_second: env_parse("RATE_LIMIT_PER_SECOND", 2.0),
            request_timeout_secs: env_parse("REQUEST_TIMEOUT", 30),
            retry_attempts: env_parse("RETRY_ATTEMPTS", 3),
            retry_delay_secs: env_parse("RETRY_DELAY", 1.0),
            max_concurrent_requests: env_parse("MAX_CONCURRENT_REQUESTS", 10),

            max_concurrent_books: env_parse("MAX_CONCURRENT_BOOKS", 50),
            batch_size: env_parse("BATCH_SIZE", 100),
            expected_catalog_size: env_parse("EXPECTED_CATALOG_SIZE", 1000),
            restore_max_pages: env_parse("RESTORE_MAX_PAGES", 50),
            discovery_max_pages: env_parse("DISCOVERY_MAX_PAGES", 10),
            max_consecutive_page_errors: env_parse("MAX_CONSECUTIVE_PAGE_ERRORS", 5),

            state_file: PathBuf::from(env_str("STATE_FILE", "crawl_state.json")),
            resume_on_failure: env_bool("RESUME_ON_FAILURE", true),
            checkpoint_interval: env_parse("CHECKPOINT_INTERVAL", 10),

            schedule_hour: env_parse("SCHEDULE_HOUR", 2),
            schedule_minute: env_parse("SCHEDULE_MINUTE", 0),
            timezone: env_str("TIMEZONE", "UTC"),
            enable_change_detection: env_bool("ENABLE_CHANGE_DETECTION", true),
            generate_daily_reports: env_bool("GENERATE_DAILY_REPORTS", true),

            report_format,
            report_retention_days: env_parse("REPORT_RETENTION_DAYS", 30),
            reports_dir: PathBuf::from(env_str("REPORTS_DIR", "reports")),

            log_level: env_str("LOG_LEVEL", "info"),
            log_format,
            log_file: std::env::var("LOG_FILE").ok().map(PathBuf::from),
            debug: env_bool("DEBUG", false),

            api_host: env_str("API_HOST", "0.0.0.0"),
            api_port: env_parse("API_PORT", 8000),
            api_key: std::env::var("API_KEY").ok(),
        };

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if !(0.1..=10.0).contains(&self.rate_limit_per_second) {
            return Err(ConfigError::Invalid {
                key: "RATE_LIMIT_PER_SECOND",
                reason: format!("must be within 0.1..=10, got {}", self.rate_limit_per_second),
            });
        }
        if !(5..=300).contains(&self.request_timeout_secs) {
            return Err(ConfigError::Invalid {
                key: "REQUEST_TIMEOUT",
                reason: format!("must be within 5..=300 seconds, got {}", self.request_timeout_secs),
            });
        }
        if self.retry_attempts > 10 {
            return Err(ConfigError::Invalid {
                key: "RETRY_ATTEMPTS",
                reason: format!("must be within 0..=10, got {}", self.retry_attempts),
            });
        }
        if !self.retry_delay_secs.is_finite() || self.retry_delay_secs < 0.0 {
            return Err(ConfigError::Invalid {
                key: "RETRY_DELAY",
                reason: format!("must be a non-negative number, got {}", self.retry_delay_secs),
            });
        }
        if !(1..=50).contains(&self.max_concurrent_requests) {
            return Err(ConfigError::Invalid {
                key: "MAX_CONCURRENT_REQUESTS",
                reason: format!("must be within 1..=50, got {}", self.max_concurrent_requests),
            });
        }
        if self.max_concurrent_books == 0 {
            return Err(ConfigError::Invalid {
                key: "MAX_CONCURRENT_BOOKS",
                reason: "must be at least 1".to_string(),
            });
        }
        if self.batch_size == 0 {
            return Err(ConfigError::Invalid {
                key: "BATCH_SIZE",
                reason: "must be at least 1".to_string(),
            });
        }
        if self.schedule_hour > 23 {
            return Err(ConfigError::Invalid {
                key: "SCHEDULE_HOUR",
                reason: format!("must be within 0..=23, got {}", self.schedule_hour),
            });
        }
        if self.schedule_minute > 59 {
            return Err(ConfigError::Invalid {
                key: "SCHEDULE_MINUTE",
                reason: format!("must be within 0..=59, got {}", self.schedule_minute),
            });
        }
        if self.timezone.parse::<chrono_tz::Tz>().is_err() {
            return Err(ConfigError::Invalid {
                key: "TIMEZONE",
                reason: format!("unknown timezone {}", self.timezone),
            });
        }
        if self.checkpoint_interval == 0 {
            return Err(ConfigError::Invalid {
                key: "CHECKPOINT_INTERVAL",
                reason: "must be at least 1".to_string(),
            });
        }
        Ok(())
    }

    pub fn tz(&self) -> chrono_tz::Tz {
        // Validated in from_env.
        self.timezone.parse().unwrap_or(chrono_tz::UTC)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Env-var manipulation is process-global, so these tests build configs
    // directly rather than racing over std::env.

    fn base() -> Config {
        Config {
            database_path: PathBuf::from("test.db"),
            base_url: "https://books.toscrape.com".to_string(),
            rate_limit_per_second: 2.0,
            request_timeout_secs: 30,
            retry_attempts: 3,
            retry_delay_secs: 1.0,
            max_concurrent_requests: 10,
            max_concurrent_books: 50,
            batch_size: 100,
            expected_catalog_size: 1000,
            restore_max_pages: 50,
            discovery_max_pages: 10,
            max_consecutive_page_errors: 5,
            state_file: PathBuf::from("crawl_state.json"),
            resume_on_failure: true,
            checkpoint_interval: 10,
            schedule_hour: 2,
            schedule_minute: 0,
            timezone: "UTC".to_string(),
            enable_change_detection: true,
            generate_daily_reports: true,
            report_format: ReportFormat::Json,
            report_retention_days: 30,
            reports_dir: PathBuf::from("reports"),
            log_level: "info".to_string(),
            log_format: LogFormat::Console,
            log_file: None,
            debug: false,
            api_host: "127.0.0.1".to_string(),
            api_port: 8000,
            api_key: None,
        }
    }

    #[test]
    fn defaults_pass_validation() {
        assert!(base().validate().is_ok());
    }

    #[test]
    fn rate_limit_range_is_enforced() {
        let mut c = base();
        c.rate_limit_per_second = 0.0;
        assert!(c.validate().is_err());
        c.rate_limit_per_second = 11.0;
        assert!(c.validate().is_err());
    }

    #[test]
    fn timezone_must_parse() {
        let mut c = base();
        c.timezone = "Mars/Olympus_Mons".to_string();
        assert!(c.validate().is_err());
        c.timezone = "Europe/Berlin".to_string();
        assert!(c.validate().is_ok());
    }

    #[test]
    fn schedule_bounds_are_enforced() {
        let mut c = base();
        c.schedule_hour = 24;
        assert!(c.validate().is_err());
        let mut c = base();
        c.schedule_minute = 60;
        assert!(c.validate().is_err());
    }
}
