//! Lodestar Library
//!
//! Service registration and discovery over a lease-based coordination store.
//!
//! - `registration`: lease-backed endpoint registration, singleton or
//!   multi-instance, with keep-alive tracking
//! - `discovery`: watch-driven state trees with round-robin child selection
//! - `handlers`: the callback chains both machines dispatch to
//! - `store`: the coordination store seam, with etcd and in-memory backends

pub mod config;
pub mod discovery;
pub mod error;
pub mod handlers;
pub mod observability;
pub mod registration;
pub mod store;

#[cfg(test)]
mod scenarios;

pub use config::LodestarConfig;
pub use discovery::{Children, Discover, DiscoverOption, DiscoverPhase, DiscoverState};
pub use error::GuardError;
pub use handlers::{Handlers, StateRef};
pub use lodestar_core::Endpoint;
pub use registration::{Register, RegisterOption, RegisterState, RegistrationPhase};
pub use store::{CoordinationStore, EtcdStore, MemoryStore, StoreError};
