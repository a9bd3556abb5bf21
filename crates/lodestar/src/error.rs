//! Registration and discovery errors

use crate::store::{LeaseId, StoreError};
use thiserror::Error;

/// Errors surfaced by registries and their machines.
///
/// `Validation` and `AlreadyExists` are returned from `append`; every other
/// variant is delivered through the on-failed handler chain.
#[derive(Debug, Error)]
pub enum GuardError {
    #[error("the path cannot be empty")]
    Validation,
    #[error("the path {0} already exists")]
    AlreadyExists(String),
    #[error("the path {0} does not allow multiple instances")]
    Conflict(String),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("keep-alive lost for lease {0}")]
    KeepaliveLost(LeaseId),
    #[error("watch on {path} lost after {attempts} reconnect attempts")]
    WatchLost { path: String, attempts: usize },
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

impl GuardError {
    /// Short label used for metrics
    pub fn reason(&self) -> &'static str {
        match self {
            GuardError::Validation => "validation",
            GuardError::AlreadyExists(_) => "already_exists",
            GuardError::Conflict(_) => "conflict",
            GuardError::Serialization(_) => "serialization",
            GuardError::KeepaliveLost(_) => "keepalive_lost",
            GuardError::WatchLost { .. } => "watch_lost",
            GuardError::Store(_) => "store",
        }
    }
}
