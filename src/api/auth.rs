//! API-key authentication and per-key rate limiting for the read API.
//!
//! Keys and rate windows live in an explicitly constructed service owned by
//! the server binary and shared with handlers through axum state; there is
//! no process-global registry.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use rand::distributions::Alphanumeric;
use rand::Rng;
use tracing::info;

const DEFAULT_RATE_LIMIT: u32 = 100;
const WINDOW: Duration = Duration::from_secs(3600);

#[derive(Debug, Clone)]
pub struct ApiKeyInfo {
    pub name: String,
    pub created_at: DateTime<Utc>,
    pub rate_limit: u32,
    pub revoked: bool,
}

/// Outcome of a rate-limit check, also used to build the response headers.
#[derive(Debug, Clone, Copy)]
pub struct RateDecision {
    pub allowed: bool,
    pub limit: u32,
    pub remaining: u32,
    pub reset_in_secs: u64,
}

pub struct ApiKeyService {
    keys: RwLock<HashMap<String, ApiKeyInfo>>,
    windows: Mutex<HashMap<String, Vec<Instant>>>,
}

impl ApiKeyService {
    pub fn new() -> Self {
        Self {
            keys: RwLock::new(HashMap::new()),
            windows: Mutex::new(HashMap::new()),
        }
    }

    pub fn generate_key() -> String {
        let suffix: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(40)
            .map(char::from)
            .collect();
        format!("bw_{suffix}")
    }

    /// Register a key. Returns the key itself for convenience.
    pub fn add_key(&self, key: String, name: &str, rate_limit: u32) -> String {
        self.keys.write().insert(
            key.clone(),
            ApiKeyInfo {
                name: name.to_string(),
                created_at: Utc::now(),
                rate_limit,
                revoked: false,
            },
        );
        info!(name, "registered API key");
        key
    }

    /// Seed the default key: the configured one, or a generated key printed
    /// to the log once so the operator can capture it.
    pub fn seed_default(&self, configured: Option<&str>) {
        match configured {
            Some(key) => {
                self.add_key(key.to_string(), "default", DEFAULT_RATE_LIMIT);
            }
            None => {
                let key = Self::generate_key();
                info!(api_key = %key, "no API_KEY configured, generated one");
                self.add_key(key, "default", DEFAULT_RATE_LIMIT);
            }
        }
    }

    pub fn validate(&self, key: &str) -> bool {
        self.keys
            .read()
            .get(key)
            .map(|info| !info.revoked)
            .unwrap_or(false)
    }

    pub fn revoke(&self, key: &str) -> bool {
        match self.keys.write().get_mut(key) {
            Some(info) => {
                info.revoked = true;
                true
            }
            None => false,
        }
    }

    /// Sliding one-hour window per key.
    pub fn check_rate_limit(&self, key: &str) -> RateDecision {
        let limit = self
            .keys
            .read()
            .get(key)
            .map(|info| info.rate_limit)
            .unwrap_or(DEFAULT_RATE_LIMIT);

        let now = Instant::now();
        let mut windows = self.windows.lock();
        let requests = windows.entry(key.to_string()).or_default();
        requests.retain(|t| now.duration_since(*t) < WINDOW);

        let reset_in_secs = requests
            .first()
            .map(|first| WINDOW.saturating_sub(now.duration_since(*first)).as_secs())
            .unwrap_or(0);

        if (requests.len() as u32) < limit {
            requests.push(now);
            RateDecision {
                allowed: true,
                limit,
                remaining: limit - requests.len() as u32,
                reset_in_secs,
            }
        } else {
            RateDecision {
                allowed: false,
                limit,
                remaining: 0,
                reset_in_secs,
            }
        }
    }
}

impl Default for ApiKeyService {
    fn default() -> Self {
        Self::new()
    }
}
