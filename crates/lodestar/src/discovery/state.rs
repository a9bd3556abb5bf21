//! Discovery state tree nodes

use super::Children;
use crate::handlers::Handlers;
use lodestar_core::Endpoint;
use parking_lot::RwLock;
use std::fmt;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// State observed for a watched path.
///
/// A root state tracks the configured path itself and owns the children found
/// under it. A child state tracks one key under its root and is owned by the
/// root's `Children`.
pub struct DiscoverState {
    /// Configured path of the root
    path: String,
    prefix: bool,
    /// Key this state tracks (the configured path for roots)
    current_path: String,
    is_child: bool,
    data: RwLock<Option<Endpoint>>,
    children: Option<Arc<Children>>,
    handlers: Arc<Handlers>,
    cancel: CancellationToken,
}

impl DiscoverState {
    pub(crate) fn root(path: &str, prefix: bool, handlers: Arc<Handlers>) -> Self {
        Self {
            path: path.to_string(),
            prefix,
            current_path: path.to_string(),
            is_child: false,
            data: RwLock::new(None),
            children: Some(Arc::new(Children::new())),
            handlers,
            cancel: CancellationToken::new(),
        }
    }

    /// Build a child of this root tracking `key`
    pub(crate) fn new_child(&self, key: &str) -> DiscoverState {
        DiscoverState {
            path: self.path.clone(),
            prefix: self.prefix,
            current_path: key.to_string(),
            is_child: true,
            data: RwLock::new(None),
            children: None,
            handlers: self.handlers.clone(),
            cancel: self.cancel.clone(),
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn current_path(&self) -> &str {
        &self.current_path
    }

    pub fn is_prefix(&self) -> bool {
        self.prefix
    }

    pub fn is_child(&self) -> bool {
        self.is_child
    }

    /// Decoded payload, `None` when the key is absent or was deleted
    pub fn data(&self) -> Option<Endpoint> {
        self.data.read().clone()
    }

    pub fn set_data(&self, data: Option<Endpoint>) {
        *self.data.write() = data;
    }

    /// Children found under a root; `None` for child states
    pub fn children(&self) -> Option<&Children> {
        self.children.as_deref()
    }

    pub(crate) fn children_arc(&self) -> Option<Arc<Children>> {
        self.children.clone()
    }

    pub fn handlers(&self) -> &Handlers {
        &self.handlers
    }

    /// Whether the owning machine was stopped
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub(crate) fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }
}

impl fmt::Debug for DiscoverState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DiscoverState")
            .field("path", &self.path)
            .field("current_path", &self.current_path)
            .field("is_child", &self.is_child)
            .field("data", &*self.data.read())
            .field("children", &self.children.as_ref().map(|c| c.count()))
            .finish()
    }
}
