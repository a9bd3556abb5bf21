//! Structured Events
//!
//! Structured event logging with consistent fields for registration and
//! discovery lifecycle changes.
//!
//! Event types:
//! - `service_registered` - Lease granted and key written
//! - `registration_failed` - Registration protocol did not complete
//! - `registration_stopped` - Caller stopped a registration
//! - `lease_lost` - Keep-alive stream closed while alive
//! - `endpoint_discovered` - PUT observed under a watched path
//! - `endpoint_departed` - DELETE observed under a watched path
//! - `watch_reconnecting` - Watch stream ended, re-opening
//! - `watch_lost` - Reconnect attempts exhausted

use tracing::{debug, error, info, warn};

/// Emit a service registered event
pub fn service_registered(path: &str, current_path: &str, lease_id: i64, ttl: i64) {
    info!(
        event_type = "service_registered",
        path = %path,
        current_path = %current_path,
        lease_id = lease_id,
        ttl = ttl,
        "Service registered"
    );
}

/// Emit a registration failed event. The on-failed chain reports the error
/// itself, so this stays at debug.
pub fn registration_failed(path: &str, error: &str) {
    debug!(
        event_type = "registration_failed",
        path = %path,
        error = %error,
        "Registration failed"
    );
}

/// Emit a registration stopped event
pub fn registration_stopped(path: &str, lease_id: i64) {
    info!(
        event_type = "registration_stopped",
        path = %path,
        lease_id = lease_id,
        "Registration stopped"
    );
}

/// Emit a lease lost event
pub fn lease_lost(path: &str, lease_id: i64) {
    error!(
        event_type = "lease_lost",
        path = %path,
        lease_id = lease_id,
        "Lease keep-alive lost"
    );
}

/// Emit an endpoint discovered event
pub fn endpoint_discovered(path: &str, key: &str) {
    info!(
        event_type = "endpoint_discovered",
        path = %path,
        key = %key,
        "Endpoint discovered"
    );
}

/// Emit an endpoint departed event
pub fn endpoint_departed(path: &str, key: &str) {
    warn!(
        event_type = "endpoint_departed",
        path = %path,
        key = %key,
        "Endpoint departed"
    );
}

/// Emit a watch reconnecting event
pub fn watch_reconnecting(path: &str, attempt: usize, backoff_ms: u64) {
    warn!(
        event_type = "watch_reconnecting",
        path = %path,
        attempt = attempt,
        backoff_ms = backoff_ms,
        "Watch stream ended, reconnecting"
    );
}

/// Emit a watch lost event
pub fn watch_lost(path: &str, attempts: usize) {
    error!(
        event_type = "watch_lost",
        path = %path,
        attempts = attempts,
        "Watch reconnect attempts exhausted"
    );
}
