//! Discovery Machine
//!
//! Drives one root `DiscoverState` from the store: snapshot first, then the
//! watch loop on a spawned task until stopped or the watch is lost for good.

use super::registry::DiscoverMap;
use super::{DiscoverPhase, DiscoverState};
use crate::error::GuardError;
use crate::handlers::StateRef;
use crate::observability::{events, metrics, ReconnectPolicy, ReconnectTracker};
use crate::store::{CoordinationStore, EventKind, WatchEvent, WatchStream};
use futures::StreamExt;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::{Arc, Weak};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

enum Step {
    Cancelled,
    Event(WatchEvent),
    Ended,
}

/// Watch machine for one configured path
pub struct DiscoverMachine {
    state: Arc<DiscoverState>,
    store: Arc<dyn CoordinationStore>,
    policy: ReconnectPolicy,
    phase: Mutex<DiscoverPhase>,
    task: Mutex<Option<JoinHandle<()>>>,
    /// Registry to leave when the watch is lost
    registry: Weak<DiscoverMap>,
}

impl DiscoverMachine {
    pub(crate) fn new(
        state: DiscoverState,
        store: Arc<dyn CoordinationStore>,
        policy: ReconnectPolicy,
        registry: Weak<DiscoverMap>,
    ) -> Self {
        Self {
            state: Arc::new(state),
            store,
            policy,
            phase: Mutex::new(DiscoverPhase::Created),
            task: Mutex::new(None),
            registry,
        }
    }

    pub fn state(&self) -> &Arc<DiscoverState> {
        &self.state
    }

    pub fn path(&self) -> &str {
        self.state.path()
    }

    pub fn phase(&self) -> DiscoverPhase {
        *self.phase.lock()
    }

    fn set_phase(&self, phase: DiscoverPhase) {
        *self.phase.lock() = phase;
    }

    /// Dispatch the snapshot, then spawn the watch loop.
    ///
    /// The watch is opened before the snapshot is read so that no change made
    /// after the snapshot can fall between the two. Watch events at or below
    /// the snapshot revision are already part of the snapshot and are skipped.
    pub(crate) async fn start(self: &Arc<Self>) {
        let watch = match self.open_watch().await {
            Ok(stream) => Some(stream),
            Err(e) => {
                warn!(path = %self.path(), error = %e, "Failed to open watch, will retry");
                None
            }
        };

        let seen = match self.store.get(self.path(), self.state.is_prefix()).await {
            Ok(snapshot) => {
                debug!(
                    path = %self.path(),
                    count = snapshot.kvs.len(),
                    revision = snapshot.revision,
                    "Snapshot read"
                );
                for kv in &snapshot.kvs {
                    self.dispatch_put(&kv.key, &kv.value);
                }
                snapshot.revision
            }
            Err(e) => {
                self.fail(&GuardError::Store(e));
                0
            }
        };

        self.set_phase(DiscoverPhase::Watching);
        info!(path = %self.path(), prefix = self.state.is_prefix(), "Discovery watching");

        let machine = Arc::clone(self);
        let handle = tokio::spawn(async move { machine.run(watch, seen).await });
        *self.task.lock() = Some(handle);
    }

    /// Signal the watch loop to finish
    pub fn stop(&self) {
        self.state.cancel_token().cancel();
    }

    /// Wait for the watch loop to exit
    pub async fn stopped(&self) {
        let handle = self.task.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!(path = %self.path(), error = %e, "Discovery task ended abnormally");
            }
        }
    }

    async fn open_watch(&self) -> Result<WatchStream, GuardError> {
        Ok(self
            .store
            .watch(self.path(), self.state.is_prefix())
            .await?)
    }

    /// `seen` is the highest revision already reflected in the tree.
    async fn run(self: Arc<Self>, mut watch: Option<WatchStream>, mut seen: i64) {
        let mut tracker = ReconnectTracker::new(self.policy.clone());
        let cancel = self.state.cancel_token().clone();

        loop {
            let mut stream = match watch.take() {
                Some(stream) => stream,
                None => {
                    let Some(backoff) = tracker.record_attempt() else {
                        self.lose(tracker.attempts());
                        return;
                    };
                    events::watch_reconnecting(
                        self.path(),
                        tracker.attempts(),
                        backoff.as_millis() as u64,
                    );
                    metrics::record_watch_reconnect();

                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => {
                            self.finish();
                            return;
                        }
                        _ = tokio::time::sleep(backoff) => {}
                    }

                    match self.open_watch().await {
                        Ok(stream) => {
                            if let Some(revision) = self.resync().await {
                                seen = revision;
                            }
                            stream
                        }
                        Err(e) => {
                            warn!(path = %self.path(), error = %e, "Failed to re-open watch");
                            continue;
                        }
                    }
                }
            };

            loop {
                let step = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => Step::Cancelled,
                    event = stream.next() => event.map_or(Step::Ended, Step::Event),
                };

                match step {
                    Step::Cancelled => {
                        self.finish();
                        return;
                    }
                    Step::Event(event) => {
                        tracker.reset();
                        if event.revision > seen {
                            self.dispatch(event);
                        }
                    }
                    Step::Ended => {
                        debug!(path = %self.path(), "Watch stream ended");
                        break;
                    }
                }
            }
        }
    }

    fn dispatch(&self, event: WatchEvent) {
        match event.kind {
            EventKind::Put => self.dispatch_put(&event.key, &event.value),
            EventKind::Delete => self.dispatch_del(&event.key, &event.value),
        }
    }

    fn dispatch_put(&self, key: &str, value: &[u8]) {
        events::endpoint_discovered(self.path(), key);
        metrics::record_discovery_event("put");
        self.state.handlers().dispatch_put(key, value, &self.state);
        self.record_children();
    }

    fn dispatch_del(&self, key: &str, value: &[u8]) {
        events::endpoint_departed(self.path(), key);
        metrics::record_discovery_event("delete");
        self.state.handlers().dispatch_del(key, value, &self.state);
        self.record_children();
    }

    fn record_children(&self) {
        if let Some(children) = self.state.children() {
            metrics::record_children(self.path(), children.count());
        }
    }

    /// Bring the tree back in line with the store after a gap in the watch:
    /// DELETE for every known key that vanished, PUT for every present key.
    /// Returns the revision resynchronized to.
    async fn resync(&self) -> Option<i64> {
        let snapshot = match self.store.get(self.path(), self.state.is_prefix()).await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                warn!(path = %self.path(), error = %e, "Resync snapshot failed");
                return None;
            }
        };
        let kvs = &snapshot.kvs;

        let present: HashSet<&str> = kvs.iter().map(|kv| kv.key.as_str()).collect();

        let mut known = self
            .state
            .children()
            .map(|children| children.paths())
            .unwrap_or_default();
        if self.state.data().is_some() {
            known.push(self.path().to_string());
        }

        for key in known.iter().filter(|key| !present.contains(key.as_str())) {
            self.dispatch_del(key, &[]);
        }
        for kv in kvs {
            self.dispatch_put(&kv.key, &kv.value);
        }
        Some(snapshot.revision)
    }

    fn finish(&self) {
        self.set_phase(DiscoverPhase::Done);
        info!(path = %self.path(), "Discovery stopped");
        self.state
            .handlers()
            .dispatch_done(self.path(), StateRef::Discover(&self.state));
    }

    fn lose(self: &Arc<Self>, attempts: usize) {
        self.set_phase(DiscoverPhase::Lost);
        events::watch_lost(self.path(), attempts);
        self.detach();
        let err = GuardError::WatchLost {
            path: self.path().to_string(),
            attempts,
        };
        self.fail(&err);
    }

    fn fail(&self, err: &GuardError) {
        self.state
            .handlers()
            .dispatch_failed(self.path(), &[], StateRef::Discover(&self.state), err);
    }

    /// Leave the registry if it still maps our path to this machine
    fn detach(self: &Arc<Self>) {
        if let Some(map) = self.registry.upgrade() {
            let mut machines = map.write();
            if machines
                .get(self.path())
                .is_some_and(|m| Arc::ptr_eq(m, self))
            {
                machines.remove(self.path());
            }
        }
    }
}
