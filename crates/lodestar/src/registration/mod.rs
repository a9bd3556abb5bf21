//! Registration
//!
//! Lease-backed registration of endpoints:
//! 1. Registering: grant a lease and write the payload under it, either
//!    create-if-absent (singleton) or at a unique child path (multi-instance)
//! 2. Alive: consume keep-alive acknowledgements until stopped
//! 3. Failed / Done: the lease was lost, or the caller stopped the machine

mod registry;
mod state;

pub use registry::Register;
pub use state::RegisterState;

use crate::error::GuardError;
use crate::handlers::{Handlers, StateRef};
use crate::store::KeepAliveAck;
use lodestar_core::Endpoint;

/// Registration machine phases
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistrationPhase {
    /// Constructed, not started
    Created,
    /// Running the registration protocol
    Registering,
    /// Lease held and renewed
    Alive,
    /// Registration or keep-alive failed
    Failed,
    /// Stopped by the caller
    Done,
}

impl RegistrationPhase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, RegistrationPhase::Failed | RegistrationPhase::Done)
    }
}

/// Parameters for registering an endpoint
#[derive(Debug, Clone)]
pub struct RegisterOption {
    pub path: String,
    /// Lease TTL in seconds; the registry default applies when unset
    pub ttl: Option<i64>,
    pub payload: Endpoint,
    /// Allow several instances under the same path
    pub multi: bool,
    /// Handlers run after the registry defaults
    pub handlers: Handlers,
}

impl RegisterOption {
    pub fn new(path: impl Into<String>, payload: Endpoint) -> Self {
        Self {
            path: path.into(),
            ttl: None,
            payload,
            multi: false,
            handlers: Handlers::new(),
        }
    }

    pub fn ttl(mut self, ttl: i64) -> Self {
        self.ttl = Some(ttl);
        self
    }

    pub fn multi(mut self, multi: bool) -> Self {
        self.multi = multi;
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

    pub fn on_interval<F>(mut self, handler: F) -> Self
    where
        F: Fn(&str, &RegisterState, &KeepAliveAck) + Send + Sync + 'static,
    {
        self.handlers.add_on_interval_handler(handler);
        self
    }

    pub(crate) fn check(&self) -> Result<(), GuardError> {
        if self.path.is_empty() {
            return Err(GuardError::Validation);
        }
        Ok(())
    }
}
