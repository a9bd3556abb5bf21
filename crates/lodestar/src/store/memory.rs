//! In-memory Store
//!
//! A single-process `CoordinationStore` with the same contracts as etcd:
//! revisions, create-if-absent transactions, TTL leases that expire unless
//! renewed, keep-alive streams and prefix watches. Used by tests and by the
//! agent's in-memory mode.

use super::{
    CoordinationStore, EventKind, KeepAliveAck, KeepAliveStream, KeyValue, LeaseId, Snapshot,
    StoreError, WatchEvent, WatchStream,
};
use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, trace, warn};

const EVENT_BUFFER: usize = 1024;
const MIN_KEEPALIVE_PERIOD: Duration = Duration::from_millis(10);

struct Entry {
    value: Vec<u8>,
    lease: Option<LeaseId>,
    create_revision: i64,
}

struct Lease {
    ttl: Duration,
    deadline: Instant,
    keys: BTreeSet<String>,
}

struct Inner {
    revision: i64,
    next_lease: LeaseId,
    kvs: BTreeMap<String, Entry>,
    leases: HashMap<LeaseId, Lease>,
    events: broadcast::Sender<WatchEvent>,
}

impl Inner {
    fn put(&mut self, key: &str, value: Vec<u8>, lease: Option<LeaseId>) -> Result<(), StoreError> {
        if let Some(id) = lease {
            if !self.leases.contains_key(&id) {
                return Err(StoreError::LeaseNotFound(id));
            }
        }

        self.revision += 1;
        let create_revision = match self.kvs.get(key) {
            Some(existing) => {
                if existing.lease != lease {
                    if let Some(old) = existing.lease.and_then(|id| self.leases.get_mut(&id)) {
                        old.keys.remove(key);
                    }
                }
                existing.create_revision
            }
            None => self.revision,
        };

        if let Some(new) = lease.and_then(|id| self.leases.get_mut(&id)) {
            new.keys.insert(key.to_string());
        }

        self.kvs.insert(
            key.to_string(),
            Entry {
                value: value.clone(),
                lease,
                create_revision,
            },
        );

        let _ = self.events.send(WatchEvent {
            kind: EventKind::Put,
            key: key.to_string(),
            value,
            revision: self.revision,
        });
        Ok(())
    }

    fn delete(&mut self, key: &str) {
        if self.kvs.remove(key).is_some() {
            self.revision += 1;
            let _ = self.events.send(WatchEvent {
                kind: EventKind::Delete,
                key: key.to_string(),
                value: Vec::new(),
                revision: self.revision,
            });
        }
    }

    /// Drop a lease and every key still bound to it
    fn remove_lease(&mut self, id: LeaseId) -> bool {
        let Some(lease) = self.leases.remove(&id) else {
            return false;
        };
        for key in lease.keys {
            if self.kvs.get(&key).and_then(|e| e.lease) == Some(id) {
                self.delete(&key);
            }
        }
        true
    }
}

/// In-process coordination store
#[derive(Clone)]
pub struct MemoryStore {
    inner: Arc<Mutex<Inner>>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        Self {
            inner: Arc::new(Mutex::new(Inner {
                revision: 0,
                next_lease: 1,
                kvs: BTreeMap::new(),
                leases: HashMap::new(),
                events,
            })),
        }
    }

    /// Current store revision
    pub fn revision(&self) -> i64 {
        self.inner.lock().revision
    }

    /// Delete a key directly, as another client would
    pub fn delete(&self, key: &str) {
        self.inner.lock().delete(key);
    }

    /// Number of live leases
    pub fn lease_count(&self) -> usize {
        self.inner.lock().leases.len()
    }

    /// End every open watch stream, simulating a lost connection.
    pub fn disconnect_watchers(&self) {
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        self.inner.lock().events = events;
        debug!("Disconnected all watchers");
    }

    /// Expire the lease when its deadline passes without renewal
    fn spawn_reaper(&self, id: LeaseId) {
        let inner: Weak<Mutex<Inner>> = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            loop {
                let deadline = {
                    let Some(strong) = inner.upgrade() else { return };
                    let guard = strong.lock();
                    match guard.leases.get(&id) {
                        Some(lease) => lease.deadline,
                        None => return,
                    }
                };

                tokio::time::sleep_until(deadline).await;

                let Some(strong) = inner.upgrade() else { return };
                let mut guard = strong.lock();
                match guard.leases.get(&id) {
                    None => return,
                    Some(lease) if lease.deadline <= Instant::now() => {
                        debug!(lease_id = id, "Lease expired");
                        guard.remove_lease(id);
                        return;
                    }
                    Some(_) => {}
                }
            }
        });
    }
}

#[async_trait]
impl CoordinationStore for MemoryStore {
    async fn get(&self, key: &str, prefix: bool) -> Result<Snapshot, StoreError> {
        let guard = self.inner.lock();
        let kvs = if prefix {
            guard
                .kvs
                .range(key.to_string()..)
                .take_while(|(k, _)| k.starts_with(key))
                .map(|(k, e)| KeyValue {
                    key: k.clone(),
                    value: e.value.clone(),
                })
                .collect()
        } else {
            guard
                .kvs
                .get(key)
                .map(|e| KeyValue {
                    key: key.to_string(),
                    value: e.value.clone(),
                })
                .into_iter()
                .collect()
        };
        Ok(Snapshot {
            revision: guard.revision,
            kvs,
        })
    }

    async fn put(
        &self,
        key: &str,
        value: Vec<u8>,
        lease: Option<LeaseId>,
    ) -> Result<(), StoreError> {
        self.inner.lock().put(key, value, lease)
    }

    async fn put_if_absent(
        &self,
        key: &str,
        value: Vec<u8>,
        lease: LeaseId,
    ) -> Result<bool, StoreError> {
        let mut guard = self.inner.lock();
        if guard.kvs.contains_key(key) {
            return Ok(false);
        }
        guard.put(key, value, Some(lease))?;
        Ok(true)
    }

    async fn grant_lease(&self, ttl: i64) -> Result<LeaseId, StoreError> {
        let ttl = Duration::from_secs(ttl.max(1) as u64);
        let id = {
            let mut guard = self.inner.lock();
            let id = guard.next_lease;
            guard.next_lease += 1;
            guard.leases.insert(
                id,
                Lease {
                    ttl,
                    deadline: Instant::now() + ttl,
                    keys: BTreeSet::new(),
                },
            );
            id
        };
        self.spawn_reaper(id);
        trace!(lease_id = id, ttl_secs = ttl.as_secs(), "Lease granted");
        Ok(id)
    }

    async fn keep_alive(&self, lease: LeaseId) -> Result<KeepAliveStream, StoreError> {
        let ttl = match self.inner.lock().leases.get(&lease) {
            Some(l) => l.ttl,
            None => return Err(StoreError::LeaseNotFound(lease)),
        };

        let mut interval = tokio::time::interval((ttl / 3).max(MIN_KEEPALIVE_PERIOD));
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let inner = Arc::downgrade(&self.inner);

        let acks = stream::unfold((inner, interval), move |(inner, mut interval)| async move {
            interval.tick().await;
            let strong = inner.upgrade()?;
            let ttl = {
                let mut guard = strong.lock();
                let entry = guard.leases.get_mut(&lease)?;
                entry.deadline = Instant::now() + entry.ttl;
                entry.ttl
            };
            let ack = KeepAliveAck {
                lease_id: lease,
                ttl: ttl.as_secs() as i64,
            };
            Some((ack, (inner, interval)))
        });
        Ok(acks.boxed())
    }

    async fn revoke(&self, lease: LeaseId) -> Result<(), StoreError> {
        if self.inner.lock().remove_lease(lease) {
            Ok(())
        } else {
            Err(StoreError::LeaseNotFound(lease))
        }
    }

    async fn watch(&self, key: &str, prefix: bool) -> Result<WatchStream, StoreError> {
        let rx = self.inner.lock().events.subscribe();
        let key = key.to_string();

        let events = stream::unfold(rx, move |mut rx| {
            let key = key.clone();
            async move {
                loop {
                    match rx.recv().await {
                        Ok(event) => {
                            let matches = if prefix {
                                event.key.starts_with(&key)
                            } else {
                                event.key == key
                            };
                            if matches {
                                return Some((event, rx));
                            }
                        }
                        Err(RecvError::Lagged(skipped)) => {
                            // Like a compacted etcd watch: end it so the caller re-reads.
                            warn!(key = %key, skipped = skipped, "Watcher lagged, closing watch");
                            return None;
                        }
                        Err(RecvError::Closed) => return None,
                    }
                }
            }
        });
        Ok(events.boxed())
    }
}
