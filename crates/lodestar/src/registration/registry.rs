//! Registration Registry
//!
//! Maps configured paths to registration machines.

use super::{RegisterOption, RegisterState};
use crate::config::LodestarConfig;
use crate::error::GuardError;
use crate::handlers::Handlers;
use crate::store::CoordinationStore;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::debug;

pub(crate) type RegisterMap = RwLock<HashMap<String, Arc<RegisterState>>>;

const DEFAULT_LEASE_TTL: i64 = 10;

/// Registration registry: at most one live machine per configured path
pub struct Register {
    store: Arc<dyn CoordinationStore>,
    states: Arc<RegisterMap>,
    /// Serializes `append`
    append_lock: Mutex<()>,
    default_handlers: Handlers,
    lease_ttl: i64,
}

impl Register {
    pub fn new(store: Arc<dyn CoordinationStore>) -> Self {
        Self {
            store,
            states: Arc::new(RwLock::new(HashMap::new())),
            append_lock: Mutex::new(()),
            default_handlers: Handlers::new(),
            lease_ttl: DEFAULT_LEASE_TTL,
        }
    }

    /// Registry seeded with the default registration handlers
    pub fn with_default_handlers(store: Arc<dyn CoordinationStore>) -> Self {
        let mut register = Self::new(store);
        register.default_handlers = Handlers::register_defaults();
        register
    }

    pub fn from_config(store: Arc<dyn CoordinationStore>, config: &LodestarConfig) -> Self {
        Self::with_default_handlers(store).with_lease_ttl(config.lease_ttl)
    }

    /// TTL used by options that do not set their own
    pub fn with_lease_ttl(mut self, ttl: i64) -> Self {
        self.lease_ttl = ttl;
        self
    }

    /// Handlers seeded into machines appended from now on
    pub fn default_handlers_mut(&mut self) -> &mut Handlers {
        &mut self.default_handlers
    }

    /// Register `option.payload` under `option.path`.
    ///
    /// Only validation and duplicate paths are reported here. Registration
    /// failures go to the on-failed handlers and leave no entry behind.
    pub async fn append(&self, option: RegisterOption) -> Result<(), GuardError> {
        let _guard = self.append_lock.lock().await;
        option.check()?;

        if self.states.read().contains_key(&option.path) {
            return Err(GuardError::AlreadyExists(option.path));
        }

        let mut handlers = self.default_handlers.clone();
        handlers.extend(&option.handlers);

        let path = option.path.clone();
        let ttl = option.ttl.unwrap_or(self.lease_ttl);
        let state = Arc::new(RegisterState::new(
            option,
            ttl,
            self.store.clone(),
            handlers,
            Arc::downgrade(&self.states),
        ));

        self.states.write().insert(path.clone(), state.clone());
        if !state.start().await {
            debug!(path = %path, "Registration failed, dropping entry");
            let mut states = self.states.write();
            if states.get(&path).is_some_and(|s| Arc::ptr_eq(s, &state)) {
                states.remove(&path);
            }
        }
        Ok(())
    }

    pub fn get(&self, path: &str) -> Option<Arc<RegisterState>> {
        self.states.read().get(path).cloned()
    }

    pub fn paths(&self) -> Vec<String> {
        self.states.read().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.states.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Revoke the registration for a path and wait for its machine to
    /// finish. The path can be appended again afterwards.
    pub async fn stop(&self, path: &str) -> bool {
        let removed = self.states.write().remove(path);
        let Some(state) = removed else {
            return false;
        };
        debug!(path = %path, "Stopping registration");
        state.stop();
        state.stopped().await;
        true
    }

    pub async fn stop_all(&self) {
        let states: Vec<_> = self.states.write().drain().map(|(_, s)| s).collect();
        for state in &states {
            state.stop();
        }
        for state in states {
            state.stopped().await;
        }
    }
}
