//! Runtime configuration, built from environment variables.

use tracing::warn;

/// Relay configuration.
///
/// Every knob has a default so the relay starts with nothing but account
/// credentials and a forwarding target set. Invalid values fall back to the
/// default with a warning rather than aborting startup.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Minutes between processing cycles.
    pub poll_interval_minutes: u64,
    /// How many days back the IMAP search reaches.
    pub lookback_days: u32,
    /// Maximum emails fetched per account per cycle.
    pub batch_limit: usize,
    /// Shadow rules at or above this confidence are promotion candidates.
    pub promote_confidence: f64,
    /// Shadow rules need at least this many matches to be promoted.
    pub promote_match_count: i64,
    /// Where accepted receipts are forwarded. `None` disables processing.
    pub forward_target: Option<String>,
    /// Extra addresses treated as "self" (beyond the monitored accounts).
    pub self_addresses: Vec<String>,
    /// Hours a stored body is retained before the sweeper clears it.
    pub retention_hours: i64,
    /// Minutes between retention sweeps.
    pub retention_interval_minutes: u64,
    /// Path to the libSQL database file.
    pub db_path: String,
}

impl RelayConfig {
    /// Build config from environment variables.
    pub fn from_env() -> Self {
        Self {
            poll_interval_minutes: parse_env("RELAY_POLL_INTERVAL_MIN", 60),
            lookback_days: parse_env("RELAY_LOOKBACK_DAYS", 3),
            batch_limit: parse_env("RELAY_BATCH_LIMIT", 100),
            promote_confidence: parse_env("RELAY_PROMOTE_CONFIDENCE", 0.9),
            promote_match_count: parse_env("RELAY_PROMOTE_MATCHES", 3),
            forward_target: std::env::var("RELAY_FORWARD_TARGET")
                .ok()
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty()),
            self_addresses: std::env::var("RELAY_SELF_ADDRESSES")
                .unwrap_or_default()
                .split(',')
                .map(|s| s.trim().to_lowercase())
                .filter(|s| !s.is_empty())
                .collect(),
            retention_hours: parse_env("RELAY_RETENTION_HOURS", 24),
            retention_interval_minutes: parse_env("RELAY_RETENTION_INTERVAL_MIN", 60),
            db_path: std::env::var("RELAY_DB_PATH")
                .unwrap_or_else(|_| "./data/receipt-relay.db".to_string()),
        }
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            poll_interval_minutes: 60,
            lookback_days: 3,
            batch_limit: 100,
            promote_confidence: 0.9,
            promote_match_count: 3,
            forward_target: None,
            self_addresses: Vec::new(),
            retention_hours: 24,
            retention_interval_minutes: 60,
            db_path: "./data/receipt-relay.db".to_string(),
        }
    }
}

/// Parse an env var, falling back to `default` (with a warning) on bad input.
fn parse_env<T: std::str::FromStr + std::fmt::Display + Copy>(key: &str, default: T) -> T {
    match std::env::var(key) {
        Err(_) => default,
        Ok(raw) => match raw.trim().parse() {
            Ok(v) => v,
            Err(_) => {
                warn!(key, value = %raw, fallback = %default, "Invalid config value, using default");
                default
            }
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let cfg = RelayConfig::default();
        assert_eq!(cfg.poll_interval_minutes, 60);
        assert_eq!(cfg.lookback_days, 3);
        assert_eq!(cfg.batch_limit, 100);
        assert!((cfg.promote_confidence - 0.9).abs() < f64::EPSILON);
        assert_eq!(cfg.promote_match_count, 3);
        assert!(cfg.forward_target.is_none());
        assert_eq!(cfg.retention_hours, 24);
    }

    #[test]
    fn parse_env_falls_back_on_garbage() {
        // SAFETY: test-local env mutation, no parallel reader of this key.
        unsafe { std::env::set_var("RELAY_TEST_BOGUS_INTERVAL", "not-a-number") };
        let v: u64 = parse_env("RELAY_TEST_BOGUS_INTERVAL", 42);
        assert_eq!(v, 42);
        unsafe { std::env::remove_var("RELAY_TEST_BOGUS_INTERVAL") };
    }
}
