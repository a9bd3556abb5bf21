//! Discovery Registry
//!
//! Maps configured paths to discovery machines and selects children.

use super::{Children, DiscoverMachine, DiscoverOption, DiscoverState};
use crate::config::LodestarConfig;
use crate::error::GuardError;
use crate::handlers::Handlers;
use crate::observability::ReconnectPolicy;
use crate::store::CoordinationStore;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::debug;

pub(crate) type DiscoverMap = RwLock<HashMap<String, Arc<DiscoverMachine>>>;

/// Discovery registry: at most one live machine per configured path
pub struct Discover {
    store: Arc<dyn CoordinationStore>,
    machines: Arc<DiscoverMap>,
    /// Serializes `append`
    append_lock: Mutex<()>,
    default_handlers: Handlers,
    reconnect: ReconnectPolicy,
}

impl Discover {
    /// Registry without default handlers; `DiscoverState::data` and children
    /// are only maintained if the caller installs handlers that do so.
    pub fn new(store: Arc<dyn CoordinationStore>) -> Self {
        Self {
            store,
            machines: Arc::new(RwLock::new(HashMap::new())),
            append_lock: Mutex::new(()),
            default_handlers: Handlers::new(),
            reconnect: ReconnectPolicy::default(),
        }
    }

    /// Registry seeded with the default discovery handlers
    pub fn with_default_handlers(store: Arc<dyn CoordinationStore>) -> Self {
        let mut discover = Self::new(store);
        discover.default_handlers = Handlers::discover_defaults();
        discover
    }

    pub fn from_config(store: Arc<dyn CoordinationStore>, config: &LodestarConfig) -> Self {
        Self::with_default_handlers(store).with_reconnect_policy(config.watch_reconnect.clone())
    }

    pub fn with_reconnect_policy(mut self, policy: ReconnectPolicy) -> Self {
        self.reconnect = policy;
        self
    }

    /// Handlers seeded into machines appended from now on
    pub fn default_handlers_mut(&mut self) -> &mut Handlers {
        &mut self.default_handlers
    }

    /// Start watching `option.path`.
    ///
    /// Returns once the current snapshot has been dispatched; later failures
    /// are delivered to the on-failed handlers.
    pub async fn append(&self, option: DiscoverOption) -> Result<(), GuardError> {
        let _guard = self.append_lock.lock().await;
        option.check()?;

        if self.machines.read().contains_key(&option.path) {
            return Err(GuardError::AlreadyExists(option.path));
        }

        let mut handlers = self.default_handlers.clone();
        handlers.extend(&option.handlers);

        let state = DiscoverState::root(&option.path, option.prefix, Arc::new(handlers));
        let machine = Arc::new(DiscoverMachine::new(
            state,
            self.store.clone(),
            self.reconnect.clone(),
            Arc::downgrade(&self.machines),
        ));

        self.machines
            .write()
            .insert(option.path.clone(), machine.clone());
        machine.start().await;
        Ok(())
    }

    /// Root state for a path; use for single-instance targets.
    pub fn prefix_get(&self, path: &str) -> Option<Arc<DiscoverState>> {
        self.machines
            .read()
            .get(path)
            .map(|machine| machine.state().clone())
    }

    /// Children of a root; use for multi-instance targets.
    pub fn prefix_get_children(&self, path: &str) -> Option<Arc<Children>> {
        self.prefix_get(path).and_then(|state| state.children_arc())
    }

    /// Next child of a root in rotation.
    pub fn prefix_round_robin_children(&self, path: &str) -> Option<Arc<DiscoverState>> {
        self.prefix_get_children(path)
            .and_then(|children| children.round_robin())
    }

    pub fn machine(&self, path: &str) -> Option<Arc<DiscoverMachine>> {
        self.machines.read().get(path).cloned()
    }

    pub fn paths(&self) -> Vec<String> {
        self.machines.read().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.machines.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stop watching a path and wait for its machine to finish. The path can
    /// be appended again afterwards.
    pub async fn stop(&self, path: &str) -> bool {
        let removed = self.machines.write().remove(path);
        let Some(machine) = removed else {
            return false;
        };
        debug!(path = %path, "Stopping discovery");
        machine.stop();
        machine.stopped().await;
        true
    }

    pub async fn stop_all(&self) {
        let machines: Vec<_> = self.machines.write().drain().map(|(_, m)| m).collect();
        for machine in &machines {
            machine.stop();
        }
        for machine in machines {
            machine.stopped().await;
        }
    }
}
