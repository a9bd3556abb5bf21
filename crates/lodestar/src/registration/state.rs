//! Registration Machine
//!
//! Owns one lease and one logical path. Runs the registration protocol once,
//! then consumes keep-alive acknowledgements on a spawned task.

use super::registry::RegisterMap;
use super::{RegisterOption, RegistrationPhase};
use crate::error::GuardError;
use crate::handlers::{Handlers, StateRef};
use crate::observability::{events, metrics};
use crate::store::{CoordinationStore, KeepAliveAck, KeepAliveStream, LeaseId};
use futures::StreamExt;
use parking_lot::{Mutex, RwLock};
use std::fmt;
use std::sync::{Arc, Weak};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

enum Tick {
    Cancelled,
    Ack(KeepAliveAck),
    Closed,
}

/// Registration machine for one configured path
pub struct RegisterState {
    option: RegisterOption,
    ttl: i64,
    store: Arc<dyn CoordinationStore>,
    handlers: Arc<Handlers>,
    cancel: CancellationToken,
    lease_id: Mutex<Option<LeaseId>>,
    /// Configured path for singletons, configured path plus a unique suffix
    /// for multi-instance registrations
    current_path: RwLock<String>,
    phase: Mutex<RegistrationPhase>,
    task: Mutex<Option<JoinHandle<()>>>,
    /// Registry to leave when the lease is lost
    registry: Weak<RegisterMap>,
}

impl RegisterState {
    pub(crate) fn new(
        option: RegisterOption,
        ttl: i64,
        store: Arc<dyn CoordinationStore>,
        handlers: Handlers,
        registry: Weak<RegisterMap>,
    ) -> Self {
        let current_path = RwLock::new(option.path.clone());
        Self {
            option,
            ttl,
            store,
            handlers: Arc::new(handlers),
            cancel: CancellationToken::new(),
            lease_id: Mutex::new(None),
            current_path,
            phase: Mutex::new(RegistrationPhase::Created),
            task: Mutex::new(None),
            registry,
        }
    }

    pub fn option(&self) -> &RegisterOption {
        &self.option
    }

    pub fn path(&self) -> &str {
        &self.option.path
    }

    pub fn current_path(&self) -> String {
        self.current_path.read().clone()
    }

    pub fn lease_id(&self) -> Option<LeaseId> {
        *self.lease_id.lock()
    }

    pub fn ttl(&self) -> i64 {
        self.ttl
    }

    pub fn phase(&self) -> RegistrationPhase {
        *self.phase.lock()
    }

    fn set_phase(&self, phase: RegistrationPhase) {
        *self.phase.lock() = phase;
    }

    /// Run the registration protocol and, on success, spawn the keep-alive
    /// loop. Failures are dispatched to the on-failed handlers; returns
    /// whether the machine is alive.
    pub(crate) async fn start(self: &Arc<Self>) -> bool {
        self.set_phase(RegistrationPhase::Registering);

        match self.register().await {
            Ok(keepalive) => {
                self.set_phase(RegistrationPhase::Alive);
                events::service_registered(
                    self.path(),
                    &self.current_path(),
                    self.lease_id().unwrap_or_default(),
                    self.ttl,
                );
                metrics::record_registration();

                let machine = Arc::clone(self);
                let handle = tokio::spawn(async move { machine.run(keepalive).await });
                *self.task.lock() = Some(handle);
                true
            }
            Err(e) => {
                self.set_phase(RegistrationPhase::Failed);
                events::registration_failed(self.path(), &e.to_string());
                metrics::record_registration_failure(e.reason());
                self.handlers
                    .dispatch_failed(self.path(), &[], StateRef::Register(self), &e);
                false
            }
        }
    }

    /// Signal the keep-alive loop to revoke the lease and finish
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    /// Wait for the keep-alive loop to exit
    pub async fn stopped(&self) {
        let handle = self.task.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!(path = %self.path(), error = %e, "Registration task ended abnormally");
            }
        }
    }

    async fn register(&self) -> Result<KeepAliveStream, GuardError> {
        let value = self.option.payload.to_bytes()?;
        let lease_id = self.store.grant_lease(self.ttl).await?;

        match self.bind(lease_id, value).await {
            Ok(keepalive) => Ok(keepalive),
            Err(e) => {
                self.revoke_quietly(lease_id).await;
                Err(e)
            }
        }
    }

    /// Write the payload under `lease_id` and open its keep-alive stream
    async fn bind(&self, lease_id: LeaseId, value: Vec<u8>) -> Result<KeepAliveStream, GuardError> {
        let path = self.path();
        let current_path = if self.option.multi {
            let current_path = format!("{}/{}", path, Uuid::now_v7().simple());
            self.store.put(&current_path, value, Some(lease_id)).await?;
            current_path
        } else {
            if !self.store.put_if_absent(path, value, lease_id).await? {
                return Err(GuardError::Conflict(path.to_string()));
            }
            path.to_string()
        };

        debug!(path = %path, current_path = %current_path, lease_id = lease_id, "Payload written");
        *self.current_path.write() = current_path;
        *self.lease_id.lock() = Some(lease_id);

        Ok(self.store.keep_alive(lease_id).await?)
    }

    async fn revoke_quietly(&self, lease_id: LeaseId) {
        if let Err(e) = self.store.revoke(lease_id).await {
            warn!(path = %self.path(), lease_id = lease_id, error = %e, "Failed to revoke lease");
        }
    }

    async fn run(self: Arc<Self>, mut keepalive: KeepAliveStream) {
        loop {
            let tick = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => Tick::Cancelled,
                ack = keepalive.next() => ack.map_or(Tick::Closed, Tick::Ack),
            };

            match tick {
                Tick::Ack(ack) => {
                    self.handlers.dispatch_interval(self.path(), &self, &ack);
                }
                Tick::Cancelled => {
                    drop(keepalive);
                    if let Some(lease_id) = self.lease_id() {
                        self.revoke_quietly(lease_id).await;
                        events::registration_stopped(self.path(), lease_id);
                    }
                    self.set_phase(RegistrationPhase::Done);
                    self.handlers
                        .dispatch_done(self.path(), StateRef::Register(&self));
                    return;
                }
                Tick::Closed => {
                    // The store expires the lease on its own; nothing to revoke.
                    let lease_id = self.lease_id().unwrap_or_default();
                    self.set_phase(RegistrationPhase::Failed);
                    events::lease_lost(self.path(), lease_id);
                    metrics::record_keepalive_lost();
                    self.detach();
                    self.handlers.dispatch_failed(
                        self.path(),
                        &[],
                        StateRef::Register(&self),
                        &GuardError::KeepaliveLost(lease_id),
                    );
                    return;
                }
            }
        }
    }

    /// Leave the registry if it still maps our path to this machine
    fn detach(self: &Arc<Self>) {
        if let Some(map) = self.registry.upgrade() {
            let mut states = map.write();
            if states
                .get(self.path())
                .is_some_and(|s| Arc::ptr_eq(s, self))
            {
                states.remove(self.path());
            }
        }
    }
}

impl fmt::Debug for RegisterState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegisterState")
            .field("path", &self.option.path)
            .field("current_path", &*self.current_path.read())
            .field("lease_id", &self.lease_id())
            .field("phase", &self.phase())
            .finish()
    }
}
