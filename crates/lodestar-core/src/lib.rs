//! Core shared types for lodestar
//!
//! This crate contains the endpoint payload that registrants publish and
//! discoverers read back, shared by the library and the agent.

mod models;

pub use models::Endpoint;
