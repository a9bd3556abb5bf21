//! Coordination Store
//!
//! The capability set the registration and discovery machines need from the
//! coordination store:
//! - snapshot reads (exact key or prefix)
//! - puts bound to a lease, and a create-if-absent transaction
//! - lease grant, keep-alive stream and revoke
//! - exact or prefix watch streams of PUT/DELETE events
//!
//! `EtcdStore` talks to a real etcd cluster; `MemoryStore` honors the same
//! contracts in-process.

mod etcd;
mod memory;

pub use etcd::EtcdStore;
pub use memory::MemoryStore;

use async_trait::async_trait;
use futures::stream::BoxStream;
use thiserror::Error;

/// Lease identifier issued by the store
pub type LeaseId = i64;

/// Stream of keep-alive acknowledgements. Ends when the lease expires or the
/// connection to the store is lost.
pub type KeepAliveStream = BoxStream<'static, KeepAliveAck>;

/// Stream of watch events. Ends when the watch is cancelled by the store or the
/// connection is lost; callers decide whether to re-open it.
pub type WatchStream = BoxStream<'static, WatchEvent>;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("etcd error: {0}")]
    Etcd(#[from] etcd_client::Error),
    #[error("lease {0} not found")]
    LeaseNotFound(LeaseId),
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// A key with its current value
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyValue {
    pub key: String,
    pub value: Vec<u8>,
}

/// Result of a snapshot read
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Snapshot {
    /// Store revision the read was served at
    pub revision: i64,
    pub kvs: Vec<KeyValue>,
}

/// Lease renewal acknowledgement
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeepAliveAck {
    pub lease_id: LeaseId,
    /// Remaining TTL in seconds after renewal
    pub ttl: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Put,
    Delete,
}

/// A change observed on a watched key
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchEvent {
    pub kind: EventKind,
    pub key: String,
    /// New value for PUT; empty (or the store's tombstone value) for DELETE
    pub value: Vec<u8>,
    /// Revision at which the change happened
    pub revision: i64,
}

/// Operations consumed from the coordination store.
#[async_trait]
pub trait CoordinationStore: Send + Sync {
    /// Read `key`, or every key starting with `key` when `prefix` is set,
    /// ordered by key, together with the revision the read observed.
    async fn get(&self, key: &str, prefix: bool) -> Result<Snapshot, StoreError>;

    /// Unconditionally write `value` at `key`, bound to `lease` when given.
    async fn put(&self, key: &str, value: Vec<u8>, lease: Option<LeaseId>)
        -> Result<(), StoreError>;

    /// Atomically write `value` at `key` only if the key does not exist
    /// (its create revision is zero). Returns whether the write happened.
    async fn put_if_absent(
        &self,
        key: &str,
        value: Vec<u8>,
        lease: LeaseId,
    ) -> Result<bool, StoreError>;

    /// Grant a lease with the given TTL in seconds.
    async fn grant_lease(&self, ttl: i64) -> Result<LeaseId, StoreError>;

    /// Start renewing `lease`. Dropping the stream stops renewal.
    async fn keep_alive(&self, lease: LeaseId) -> Result<KeepAliveStream, StoreError>;

    /// Revoke `lease`, deleting every key bound to it.
    async fn revoke(&self, lease: LeaseId) -> Result<(), StoreError>;

    /// Watch `key`, or every key under it when `prefix` is set. Dropping the
    /// stream cancels the watch.
    async fn watch(&self, key: &str, prefix: bool) -> Result<WatchStream, StoreError>;
}
