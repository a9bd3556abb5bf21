//! Observability Module
//!
//! - `events`: Structured event logging with consistent fields
//! - `metrics`: Counters and gauges through the `metrics` facade
//! - `tracing`: Subscriber setup
//! - `reconnect`: Bounded reconnect policy for watch streams

pub mod events;
pub mod metrics;
pub mod reconnect;
pub mod tracing;

pub use reconnect::{ReconnectPolicy, ReconnectTracker};
pub use self::tracing::{init_tracing, TracingConfig};
