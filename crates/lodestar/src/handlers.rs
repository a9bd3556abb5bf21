//! Handler Chain
//!
//! Ordered callback lists shared by the registration and discovery machines.
//! Every list is append-only and dispatched synchronously in insertion order.
//! Registries seed their defaults first, so caller handlers always observe the
//! data model the default handlers have already materialized.

use crate::discovery::DiscoverState;
use crate::error::GuardError;
use crate::registration::RegisterState;
use crate::store::KeepAliveAck;
use lodestar_core::Endpoint;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, error, trace};

/// Called on PUT and DELETE events: `(key, value, root state)`
pub type ChangedHandler = Arc<dyn Fn(&str, &[u8], &DiscoverState) + Send + Sync>;

/// Called when a machine fails: `(key, value, state, error)`
pub type FailedHandler = Arc<dyn Fn(&str, &[u8], StateRef<'_>, &GuardError) + Send + Sync>;

/// Called when a machine is stopped: `(key, state)`
pub type DoneHandler = Arc<dyn Fn(&str, StateRef<'_>) + Send + Sync>;

/// Called on every lease renewal: `(key, registration, ack)`
pub type IntervalHandler = Arc<dyn Fn(&str, &RegisterState, &KeepAliveAck) + Send + Sync>;

/// The machine a failed or done handler is invoked for
#[derive(Clone, Copy)]
pub enum StateRef<'a> {
    Register(&'a RegisterState),
    Discover(&'a DiscoverState),
}

impl StateRef<'_> {
    /// Configured path of the machine
    pub fn path(&self) -> &str {
        match self {
            StateRef::Register(state) => state.path(),
            StateRef::Discover(state) => state.path(),
        }
    }

    /// Path the machine currently operates on
    pub fn current_path(&self) -> String {
        match self {
            StateRef::Register(state) => state.current_path(),
            StateRef::Discover(state) => state.current_path().to_string(),
        }
    }
}

impl fmt::Debug for StateRef<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StateRef::Register(state) => f.debug_tuple("Register").field(&state.path()).finish(),
            StateRef::Discover(state) => f.debug_tuple("Discover").field(&state.path()).finish(),
        }
    }
}

/// Ordered handler lists
#[derive(Clone, Default)]
pub struct Handlers {
    on_put: Vec<ChangedHandler>,
    on_del: Vec<ChangedHandler>,
    on_failed: Vec<FailedHandler>,
    on_done: Vec<DoneHandler>,
    on_interval: Vec<IntervalHandler>,
}

impl Handlers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Defaults seeded into every registration machine
    pub fn register_defaults() -> Self {
        let mut handlers = Self::new();
        handlers.add_on_done_handler(default_on_done_handler);
        handlers.add_on_failed_handler(default_on_failed_handler);
        handlers.add_on_interval_handler(default_on_interval_handler);
        handlers
    }

    /// Defaults seeded into every discovery machine; the put and delete
    /// defaults maintain `DiscoverState::data` and the children tree.
    pub fn discover_defaults() -> Self {
        let mut handlers = Self::new();
        handlers.add_on_put_handler(default_on_put_handler);
        handlers.add_on_del_handler(default_on_del_handler);
        handlers.add_on_done_handler(default_on_done_handler);
        handlers.add_on_failed_handler(default_on_failed_handler);
        handlers
    }

    pub fn add_on_put_handler<F>(&mut self, handler: F)
    where
        F: Fn(&str, &[u8], &DiscoverState) + Send + Sync + 'static,
    {
        self.on_put.push(Arc::new(handler));
    }

    pub fn add_on_del_handler<F>(&mut self, handler: F)
    where
        F: Fn(&str, &[u8], &DiscoverState) + Send + Sync + 'static,
    {
        self.on_del.push(Arc::new(handler));
    }

    pub fn add_on_failed_handler<F>(&mut self, handler: F)
    where
        F: Fn(&str, &[u8], StateRef<'_>, &GuardError) + Send + Sync + 'static,
    {
        self.on_failed.push(Arc::new(handler));
    }

    pub fn add_on_done_handler<F>(&mut self, handler: F)
    where
        F: Fn(&str, StateRef<'_>) + Send + Sync + 'static,
    {
        self.on_done.push(Arc::new(handler));
    }

    pub fn add_on_interval_handler<F>(&mut self, handler: F)
    where
        F: Fn(&str, &RegisterState, &KeepAliveAck) + Send + Sync + 'static,
    {
        self.on_interval.push(Arc::new(handler));
    }

    /// Append every handler of `other` after the ones already present.
    pub fn extend(&mut self, other: &Handlers) {
        self.on_put.extend(other.on_put.iter().cloned());
        self.on_del.extend(other.on_del.iter().cloned());
        self.on_failed.extend(other.on_failed.iter().cloned());
        self.on_done.extend(other.on_done.iter().cloned());
        self.on_interval.extend(other.on_interval.iter().cloned());
    }

    pub fn is_empty(&self) -> bool {
        self.on_put.is_empty()
            && self.on_del.is_empty()
            && self.on_failed.is_empty()
            && self.on_done.is_empty()
            && self.on_interval.is_empty()
    }

    pub(crate) fn dispatch_put(&self, key: &str, value: &[u8], state: &DiscoverState) {
        for handler in &self.on_put {
            handler(key, value, state);
        }
    }

    pub(crate) fn dispatch_del(&self, key: &str, value: &[u8], state: &DiscoverState) {
        for handler in &self.on_del {
            handler(key, value, state);
        }
    }

    pub(crate) fn dispatch_failed(
        &self,
        key: &str,
        value: &[u8],
        state: StateRef<'_>,
        err: &GuardError,
    ) {
        for handler in &self.on_failed {
            handler(key, value, state, err);
        }
    }

    pub(crate) fn dispatch_done(&self, key: &str, state: StateRef<'_>) {
        for handler in &self.on_done {
            handler(key, state);
        }
    }

    pub(crate) fn dispatch_interval(&self, key: &str, state: &RegisterState, ack: &KeepAliveAck) {
        for handler in &self.on_interval {
            handler(key, state, ack);
        }
    }
}

impl fmt::Debug for Handlers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handlers")
            .field("on_put", &self.on_put.len())
            .field("on_del", &self.on_del.len())
            .field("on_failed", &self.on_failed.len())
            .field("on_done", &self.on_done.len())
            .field("on_interval", &self.on_interval.len())
            .finish()
    }
}

/// Decode the value and store it as the root's data, or as a child entry
/// when the key lies under the root.
pub fn default_on_put_handler(key: &str, value: &[u8], state: &DiscoverState) {
    let data = match Endpoint::from_bytes(value) {
        Ok(data) => data,
        Err(e) => {
            state.handlers().dispatch_failed(
                key,
                value,
                StateRef::Discover(state),
                &GuardError::Serialization(e),
            );
            return;
        }
    };

    if key == state.path() {
        state.set_data(Some(data));
    } else if let Some(children) = state.children() {
        children.upsert(key, data, || state.new_child(key));
    }
}

/// Clear the root's data, or drop the child entry for the key.
pub fn default_on_del_handler(key: &str, _value: &[u8], state: &DiscoverState) {
    if key == state.path() {
        state.set_data(None);
    } else if let Some(children) = state.children() {
        children.remove(key);
    }
}

pub fn default_on_failed_handler(key: &str, _value: &[u8], state: StateRef<'_>, err: &GuardError) {
    error!(key = %key, state = ?state, error = %err, "Handler chain received failure");
}

pub fn default_on_done_handler(key: &str, state: StateRef<'_>) {
    debug!(key = %key, state = ?state, "Machine done");
}

pub fn default_on_interval_handler(key: &str, _state: &RegisterState, ack: &KeepAliveAck) {
    trace!(key = %key, lease_id = ack.lease_id, ttl = ack.ttl, "Lease renewed");
}
