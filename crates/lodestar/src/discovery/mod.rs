//! Discovery
//!
//! Watch-driven state trees rooted at a path:
//! 1. Snapshot: read every key currently present and dispatch PUT for each
//! 2. Watching: dispatch PUT/DELETE events as the store delivers them
//! 3. Reconnect: re-open ended watches under a bounded policy, resynchronizing
//!    against a fresh snapshot
//!
//! Roots own a `Children` collection for keys found under a prefix, and the
//! registry rotates over those children round-robin.

mod children;
mod machine;
mod registry;
mod state;

pub use children::Children;
pub use machine::DiscoverMachine;
pub use registry::Discover;
pub use state::DiscoverState;

use crate::error::GuardError;
use crate::handlers::{Handlers, StateRef};

/// Discovery machine phases
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscoverPhase {
    /// Constructed, not started
    Created,
    /// Snapshot dispatched, consuming watch events
    Watching,
    /// Stopped by the caller
    Done,
    /// Watch reconnect attempts exhausted
    Lost,
}

/// Parameters for watching a path
#[derive(Debug, Clone)]
pub struct DiscoverOption {
    pub path: String,
    /// Watch every key starting with `path` instead of the exact key
    pub prefix: bool,
    /// Handlers run after the registry defaults
    pub handlers: Handlers,
}

impl DiscoverOption {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            prefix: false,
            handlers: Handlers::new(),
        }
    }

    pub fn prefix(mut self, prefix: bool) -> Self {
        self.prefix = prefix;
        self
    }

    pub fn on_put<F>(mut self, handler: F) -> Self
    where
        F: Fn(&str, &[u8], &DiscoverState) + Send + Sync + 'static,
    {
        self.handlers.add_on_put_handler(handler);
        self
    }

    pub fn on_del<F>(mut self, handler: F) -> Self
    where
        F: Fn(&str, &[u8], &DiscoverState) + Send + Sync + 'static,
    {
        self.handlers.add_on_del_handler(handler);
        self
    }

    pub fn on_failed<F>(mut self, handler: F) -> Self
    where
        F: Fn(&str, &[u8], StateRef<'_>, &GuardError) + Send + Sync + 'static,
    {
        self.handlers.add_on_failed_handler(handler);
        self
    }

    pub fn on_done<F>(mut self, handler: F) -> Self
    where
        F: Fn(&str, StateRef<'_>) + Send + Sync + 'static,
    {
        self.handlers.add_on_done_handler(handler);
        self
    }

    pub(crate) fn check(&self) -> Result<(), GuardError> {
        if self.path.is_empty() {
            return Err(GuardError::Validation);
        }
        Ok(())
    }
}
