//! Children of a discovery root
//!
//! Map of child path to state plus an ordered index for stable round-robin
//! iteration. Both live under one lock so they never diverge.

use super::DiscoverState;
use lodestar_core::Endpoint;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

#[derive(Default)]
struct ChildrenInner {
    states: HashMap<String, Arc<DiscoverState>>,
    index: Vec<String>,
}

/// Child states of one discovery root
#[derive(Default)]
pub struct Children {
    inner: RwLock<ChildrenInner>,
    /// Round-robin cursor, private to this root
    cursor: AtomicU64,
}

impl Children {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn count(&self) -> usize {
        self.inner.read().index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.count() == 0
    }

    pub fn get(&self, path: &str) -> Option<Arc<DiscoverState>> {
        self.inner.read().states.get(path).cloned()
    }

    /// Snapshot of every child keyed by path
    pub fn all(&self) -> HashMap<String, Arc<DiscoverState>> {
        self.inner.read().states.clone()
    }

    /// Child at position `i` of the index
    pub fn index_get(&self, i: usize) -> Option<Arc<DiscoverState>> {
        let inner = self.inner.read();
        inner
            .index
            .get(i)
            .and_then(|path| inner.states.get(path))
            .cloned()
    }

    /// Child paths in index order
    pub fn paths(&self) -> Vec<String> {
        self.inner.read().index.clone()
    }

    /// Next child in rotation, `None` when there are no children.
    pub fn round_robin(&self) -> Option<Arc<DiscoverState>> {
        let inner = self.inner.read();
        if inner.index.is_empty() {
            return None;
        }
        let n = self.cursor.fetch_add(1, Ordering::Relaxed);
        let i = (n % inner.index.len() as u64) as usize;
        inner.states.get(&inner.index[i]).cloned()
    }

    /// Set the data of the child at `path`, creating it with `make` when unknown.
    /// A known child keeps its index position.
    pub(crate) fn upsert(
        &self,
        path: &str,
        data: Endpoint,
        make: impl FnOnce() -> DiscoverState,
    ) {
        let mut inner = self.inner.write();
        if let Some(existing) = inner.states.get(path) {
            existing.set_data(Some(data));
            return;
        }
        let child = make();
        child.set_data(Some(data));
        inner.states.insert(path.to_string(), Arc::new(child));
        inner.index.push(path.to_string());
    }

    pub(crate) fn remove(&self, path: &str) -> Option<Arc<DiscoverState>> {
        let mut inner = self.inner.write();
        let removed = inner.states.remove(path)?;
        if let Some(pos) = inner.index.iter().position(|p| p == path) {
            inner.index.remove(pos);
        }
        Some(removed)
    }
}
