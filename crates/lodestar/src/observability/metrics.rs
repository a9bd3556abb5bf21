//! Metrics
//!
//! Registration and discovery metrics recorded through the `metrics` facade.
//! Nothing is exported unless the embedding process installs a recorder.
//!
//! Metrics tracked:
//! - `lodestar_registrations_total` - counter of successful registrations
//! - `lodestar_registration_failures_total` - counter of failed registrations by reason
//! - `lodestar_keepalive_lost_total` - counter of leases lost while alive
//! - `lodestar_discovery_events_total` - counter of watch events by type
//! - `lodestar_watch_reconnects_total` - counter of watch re-opens
//! - `lodestar_discovered_children` - gauge of children per discovery root

use metrics::{counter, describe_counter, describe_gauge, gauge};

/// Register descriptions for all metrics
pub fn describe_metrics() {
    describe_counter!(
        "lodestar_registrations_total",
        "Total number of successful registrations"
    );
    describe_counter!(
        "lodestar_registration_failures_total",
        "Total number of failed registrations"
    );
    describe_counter!(
        "lodestar_keepalive_lost_total",
        "Total number of leases lost while alive"
    );
    describe_counter!(
        "lodestar_discovery_events_total",
        "Total number of discovery events handled"
    );
    describe_counter!(
        "lodestar_watch_reconnects_total",
        "Total number of watch stream re-opens"
    );
    describe_gauge!(
        "lodestar_discovered_children",
        "Number of children known under a discovery root"
    );
}

pub fn record_registration() {
    counter!("lodestar_registrations_total").increment(1);
}

pub fn record_registration_failure(reason: &'static str) {
    counter!("lodestar_registration_failures_total", "reason" => reason).increment(1);
}

pub fn record_keepalive_lost() {
    counter!("lodestar_keepalive_lost_total").increment(1);
}

pub fn record_discovery_event(event_type: &'static str) {
    counter!("lodestar_discovery_events_total", "type" => event_type).increment(1);
}

pub fn record_watch_reconnect() {
    counter!("lodestar_watch_reconnects_total").increment(1);
}

pub fn record_children(root: &str, count: usize) {
    gauge!("lodestar_discovered_children", "root" => root.to_string()).set(count as f64);
}
