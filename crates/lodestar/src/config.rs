//! Lodestar Configuration
//!
//! Centralized configuration for the store connection, leases and watch
//! reconnection, with environment variable overrides.

use crate::observability::ReconnectPolicy;
use std::time::Duration;

/// Library configuration with sensible defaults
#[derive(Debug, Clone)]
pub struct LodestarConfig {
    /// Etcd endpoints (env: ETCD_ENDPOINTS, comma-separated)
    pub etcd_endpoints: Vec<String>,

    /// Per-request timeout for etcd calls
    pub etcd_request_timeout: Duration,

    // Lease settings
    /// Default TTL for registration leases in seconds (env: LEASE_TTL)
    pub lease_ttl: i64,

    // Etcd backoff settings
    /// Initial interval for etcd connection retry
    pub etcd_backoff_initial: Duration,

    /// Maximum interval for etcd connection retry
    pub etcd_backoff_max: Duration,

    /// Maximum elapsed time for etcd connection retries
    pub etcd_backoff_max_elapsed: Duration,

    /// Multiplier for etcd backoff
    pub etcd_backoff_multiplier: f64,

    // Watch settings
    /// Reconnection policy for discovery watch streams
    pub watch_reconnect: ReconnectPolicy,
}

impl Default for LodestarConfig {
    fn default() -> Self {
        Self {
            etcd_endpoints: vec!["http://127.0.0.1:2379".to_string()],
            etcd_request_timeout: Duration::from_secs(5),

            lease_ttl: 10,

            etcd_backoff_initial: Duration::from_secs(1),
            etcd_backoff_max: Duration::from_secs(10),
            etcd_backoff_max_elapsed: Duration::from_secs(60),
            etcd_backoff_multiplier: 2.0,

            watch_reconnect: ReconnectPolicy::default(),
        }
    }
}

impl LodestarConfig {
    /// Create configuration from environment variables with defaults
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(endpoints) = std::env::var("ETCD_ENDPOINTS") {
            config.etcd_endpoints = endpoints
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
        }

        if let Ok(ttl) = std::env::var("LEASE_TTL") {
            if let Ok(parsed) = ttl.parse::<i64>() {
                if parsed > 0 {
                    config.lease_ttl = parsed;
                }
            }
        }

        if let Ok(max) = std::env::var("WATCH_MAX_RECONNECTS") {
            if let Ok(parsed) = max.parse::<u32>() {
                config.watch_reconnect.max_attempts = parsed;
            }
        }

        if let Ok(ms) = std::env::var("WATCH_RECONNECT_BACKOFF_MS") {
            if let Ok(parsed) = ms.parse::<u64>() {
                config.watch_reconnect.backoff = Duration::from_millis(parsed);
            }
        }

        config
    }
}
