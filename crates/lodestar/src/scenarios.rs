//! End-to-end registration and discovery over the in-memory store

use crate::discovery::{Discover, DiscoverOption, DiscoverPhase};
use crate::error::GuardError;
use crate::observability::ReconnectPolicy;
use crate::registration::{Register, RegisterOption, RegistrationPhase};
use crate::store::{
    CoordinationStore, KeepAliveStream, LeaseId, MemoryStore, Snapshot, StoreError, WatchStream,
};
use async_trait::async_trait;
use lodestar_core::Endpoint;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, Instant};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::layer::{Context, Layer, SubscriberExt};

type Reasons = Arc<Mutex<Vec<&'static str>>>;

fn store() -> (MemoryStore, Arc<dyn CoordinationStore>) {
    let store = MemoryStore::new();
    let shared: Arc<dyn CoordinationStore> = Arc::new(store.clone());
    (store, shared)
}

fn fast_reconnect(max_attempts: u32) -> ReconnectPolicy {
    ReconnectPolicy::new(
        max_attempts,
        Duration::from_secs(60),
        Duration::from_millis(10),
        Duration::from_millis(100),
    )
}

async fn eventually(within: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + within;
    loop {
        if check() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test(start_paused = true)]
async fn test_singleton_path_admits_one_registrant() {
    let (memory, shared) = store();
    let first = Register::with_default_handlers(shared.clone());
    let second = Register::with_default_handlers(shared.clone());
    let reasons: Reasons = Arc::default();

    first
        .append(RegisterOption::new("svc/s", Endpoint::new("h1")).ttl(5))
        .await
        .unwrap();

    let recorded = reasons.clone();
    second
        .append(
            RegisterOption::new("svc/s", Endpoint::new("h2"))
                .ttl(5)
                .on_failed(move |_, _, _, err| recorded.lock().push(err.reason())),
        )
        .await
        .unwrap();

    assert_eq!(*reasons.lock(), vec!["conflict"]);
    assert!(second.is_empty());
    assert_eq!(second.len(), 0);
    assert_eq!(first.get("svc/s").unwrap().phase(), RegistrationPhase::Alive);

    let kvs = shared.get("svc/s", false).await.unwrap().kvs;
    assert_eq!(kvs.len(), 1);
    assert_eq!(Endpoint::from_bytes(&kvs[0].value).unwrap().host_name, "h1");
    // The losing registrant's lease is revoked.
    assert_eq!(memory.lease_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_multi_instances_become_children() {
    let (_memory, shared) = store();
    let registrants: Vec<Register> = (0..3)
        .map(|_| Register::with_default_handlers(shared.clone()))
        .collect();

    for (i, register) in registrants.iter().take(2).enumerate() {
        register
            .append(RegisterOption::new("svc/m", Endpoint::new(format!("h{i}"))).multi(true))
            .await
            .unwrap();
    }

    let discover = Discover::with_default_handlers(shared.clone());
    discover
        .append(DiscoverOption::new("svc/m").prefix(true))
        .await
        .unwrap();
    assert_eq!(discover.prefix_get_children("svc/m").unwrap().count(), 2);

    registrants[2]
        .append(RegisterOption::new("svc/m", Endpoint::new("h2")).multi(true))
        .await
        .unwrap();

    let children = discover.prefix_get_children("svc/m").unwrap();
    assert!(eventually(Duration::from_secs(1), || children.count() == 3).await);

    let mut hosts: Vec<String> = children
        .all()
        .values()
        .filter_map(|child| child.data())
        .map(|data| data.host_name)
        .collect();
    hosts.sort();
    assert_eq!(hosts, vec!["h0", "h1", "h2"]);

    for register in &registrants {
        let state = register.get("svc/m").unwrap();
        assert!(state.current_path().starts_with("svc/m/"));
        assert!(children.get(&state.current_path()).is_some());
    }
}

#[tokio::test(start_paused = true)]
async fn test_snapshot_dispatched_before_watch_events() {
    let (_memory, shared) = store();
    let value = Endpoint::new("h1").to_bytes().unwrap();
    shared.put("svc/o/1", value.clone(), None).await.unwrap();
    shared.put("svc/o/2", value.clone(), None).await.unwrap();

    let keys = Arc::new(Mutex::new(Vec::new()));
    let seen = keys.clone();
    let discover = Discover::with_default_handlers(shared.clone());
    discover
        .append(
            DiscoverOption::new("svc/o")
                .prefix(true)
                .on_put(move |key, _, _| seen.lock().push(key.to_string())),
        )
        .await
        .unwrap();

    assert_eq!(*keys.lock(), vec!["svc/o/1", "svc/o/2"]);

    shared.put("svc/o/3", value, None).await.unwrap();
    assert!(eventually(Duration::from_secs(1), || keys.lock().len() == 3).await);
    assert_eq!(keys.lock()[2], "svc/o/3");
}

#[tokio::test(start_paused = true)]
async fn test_round_robin_cycles_stable_children() {
    let (_memory, shared) = store();
    for i in 0..3 {
        let value = Endpoint::new(format!("h{i}")).to_bytes().unwrap();
        shared
            .put(&format!("svc/rr/{i}"), value, None)
            .await
            .unwrap();
    }

    let discover = Discover::with_default_handlers(shared.clone());
    discover
        .append(DiscoverOption::new("svc/rr").prefix(true))
        .await
        .unwrap();

    let picks: Vec<String> = (0..6)
        .map(|_| {
            discover
                .prefix_round_robin_children("svc/rr")
                .unwrap()
                .current_path()
                .to_string()
        })
        .collect();

    let mut counts: HashMap<&str, usize> = HashMap::new();
    for pick in &picks {
        *counts.entry(pick.as_str()).or_default() += 1;
    }
    assert_eq!(counts.len(), 3);
    assert!(counts.values().all(|&n| n == 2));
    assert_eq!(picks[..3], picks[3..]);

    assert!(discover.prefix_round_robin_children("svc/none").is_none());
}

#[tokio::test(start_paused = true)]
async fn test_stop_removes_key_and_child() {
    let (memory, shared) = store();
    let register = Register::with_default_handlers(shared.clone());
    let discover = Discover::with_default_handlers(shared.clone());
    let done = Arc::new(Mutex::new(0));

    discover
        .append(DiscoverOption::new("svc/p").prefix(true))
        .await
        .unwrap();

    let counter = done.clone();
    register
        .append(
            RegisterOption::new("svc/p", Endpoint::new("h1"))
                .multi(true)
                .on_done(move |_, _| *counter.lock() += 1),
        )
        .await
        .unwrap();

    let children = discover.prefix_get_children("svc/p").unwrap();
    assert!(eventually(Duration::from_secs(1), || children.count() == 1).await);

    let state = register.get("svc/p").unwrap();
    assert!(register.stop("svc/p").await);
    assert!(!register.stop("svc/p").await);

    assert_eq!(state.phase(), RegistrationPhase::Done);
    assert_eq!(*done.lock(), 1);
    assert!(shared.get("svc/p", true).await.unwrap().kvs.is_empty());
    assert_eq!(memory.lease_count(), 0);
    assert!(eventually(Duration::from_secs(1), || children.is_empty()).await);

    // The path can be registered again once stopped.
    register
        .append(RegisterOption::new("svc/p", Endpoint::new("h1")).multi(true))
        .await
        .unwrap();
    assert!(eventually(Duration::from_secs(1), || children.count() == 1).await);
}

#[tokio::test(start_paused = true)]
async fn test_root_data_follows_registration() {
    let (_memory, shared) = store();
    let register = Register::with_default_handlers(shared.clone());
    let discover = Discover::with_default_handlers(shared.clone());

    discover.append(DiscoverOption::new("svc/r")).await.unwrap();
    let root = discover.prefix_get("svc/r").unwrap();
    assert!(root.data().is_none());

    let mut endpoint = Endpoint::new("h1");
    endpoint.grpc_port = 9090;
    register
        .append(RegisterOption::new("svc/r", endpoint.clone()))
        .await
        .unwrap();

    assert!(eventually(Duration::from_secs(1), || root.data().is_some()).await);
    assert_eq!(root.data(), Some(endpoint));
    assert!(root.children().unwrap().is_empty());

    register.stop("svc/r").await;
    assert!(eventually(Duration::from_secs(1), || root.data().is_none()).await);
}

#[tokio::test(start_paused = true)]
async fn test_multi_registration_appears_and_departs() {
    let (_memory, shared) = store();
    let register = Register::with_default_handlers(shared.clone());
    let discover = Discover::with_default_handlers(shared.clone());

    discover
        .append(DiscoverOption::new("svc/a").prefix(true))
        .await
        .unwrap();
    register
        .append(
            RegisterOption::new("svc/a", Endpoint::new("h1"))
                .multi(true)
                .ttl(5),
        )
        .await
        .unwrap();

    let children = discover.prefix_get_children("svc/a").unwrap();
    assert!(eventually(Duration::from_secs(2), || children.count() == 1).await);
    let child = children.index_get(0).unwrap();
    assert_eq!(child.data().unwrap().host_name, "h1");

    register.stop("svc/a").await;
    assert!(eventually(Duration::from_secs(6), || children.count() == 0).await);
}

#[tokio::test(start_paused = true)]
async fn test_interval_handlers_see_renewals() {
    let (_memory, shared) = store();
    let register = Register::with_default_handlers(shared.clone());
    let acks = Arc::new(Mutex::new(Vec::new()));

    let seen = acks.clone();
    register
        .append(
            RegisterOption::new("svc/i", Endpoint::new("h1"))
                .ttl(3)
                .on_interval(move |key, state, ack| {
                    assert_eq!(key, "svc/i");
                    assert_eq!(state.lease_id(), Some(ack.lease_id));
                    seen.lock().push(ack.ttl);
                }),
        )
        .await
        .unwrap();

    assert!(eventually(Duration::from_secs(3), || acks.lock().len() >= 2).await);
    assert!(acks.lock().iter().all(|&ttl| ttl == 3));
    register.stop_all().await;
    assert!(register.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_revoked_lease_reports_keepalive_lost() {
    let (_memory, shared) = store();
    let register = Register::with_default_handlers(shared.clone());
    let reasons: Reasons = Arc::default();

    let recorded = reasons.clone();
    register
        .append(
            RegisterOption::new("svc/k", Endpoint::new("h1"))
                .ttl(3)
                .on_failed(move |_, _, _, err| recorded.lock().push(err.reason())),
        )
        .await
        .unwrap();

    let state = register.get("svc/k").unwrap();
    let lease_id = state.lease_id().unwrap();
    shared.revoke(lease_id).await.unwrap();

    assert!(eventually(Duration::from_secs(3), || !reasons.lock().is_empty()).await);
    assert_eq!(*reasons.lock(), vec!["keepalive_lost"]);
    assert_eq!(state.phase(), RegistrationPhase::Failed);
    assert!(register.get("svc/k").is_none());

    register
        .append(RegisterOption::new("svc/k", Endpoint::new("h1")))
        .await
        .unwrap();
    assert_ne!(register.get("svc/k").unwrap().lease_id(), Some(lease_id));
}

#[tokio::test(start_paused = true)]
async fn test_watch_resyncs_after_disconnect() {
    let (memory, shared) = store();
    let value = Endpoint::new("h1").to_bytes().unwrap();
    shared.put("svc/w/1", value.clone(), None).await.unwrap();

    let discover =
        Discover::with_default_handlers(shared.clone()).with_reconnect_policy(fast_reconnect(5));
    discover
        .append(DiscoverOption::new("svc/w").prefix(true))
        .await
        .unwrap();
    let children = discover.prefix_get_children("svc/w").unwrap();
    assert_eq!(children.paths(), vec!["svc/w/1"]);

    memory.disconnect_watchers();
    memory.delete("svc/w/1");
    shared.put("svc/w/2", value, None).await.unwrap();

    assert!(eventually(Duration::from_secs(2), || children.paths() == vec!["svc/w/2"]).await);
    assert_eq!(
        discover.machine("svc/w").unwrap().phase(),
        DiscoverPhase::Watching
    );
}

#[tokio::test(start_paused = true)]
async fn test_exhausted_reconnects_report_watch_lost() {
    let (memory, shared) = store();
    let reasons: Reasons = Arc::default();
    let discover =
        Discover::with_default_handlers(shared.clone()).with_reconnect_policy(fast_reconnect(0));

    let recorded = reasons.clone();
    discover
        .append(
            DiscoverOption::new("svc/l")
                .prefix(true)
                .on_failed(move |_, _, _, err| recorded.lock().push(err.reason())),
        )
        .await
        .unwrap();
    let machine = discover.machine("svc/l").unwrap();

    memory.disconnect_watchers();

    assert!(eventually(Duration::from_secs(1), || !reasons.lock().is_empty()).await);
    assert_eq!(*reasons.lock(), vec!["watch_lost"]);
    assert_eq!(machine.phase(), DiscoverPhase::Lost);
    assert!(discover.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_stopped_discovery_reports_done() {
    let (_memory, shared) = store();
    let discover = Discover::with_default_handlers(shared.clone());
    let done = Arc::new(Mutex::new(Vec::new()));

    let seen = done.clone();
    discover
        .append(
            DiscoverOption::new("svc/d")
                .prefix(true)
                .on_done(move |key, state| seen.lock().push((key.to_string(), state.path().to_string()))),
        )
        .await
        .unwrap();
    let machine = discover.machine("svc/d").unwrap();

    discover.stop_all().await;
    assert_eq!(machine.phase(), DiscoverPhase::Done);
    assert!(machine.state().is_cancelled());
    assert_eq!(*done.lock(), vec![("svc/d".to_string(), "svc/d".to_string())]);
    assert!(discover.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_append_rejects_invalid_and_duplicate_paths() {
    let (_memory, shared) = store();
    let register = Register::with_default_handlers(shared.clone());
    let discover = Discover::with_default_handlers(shared.clone());

    assert!(matches!(
        register.append(RegisterOption::new("", Endpoint::new("h1"))).await,
        Err(GuardError::Validation)
    ));
    assert!(matches!(
        discover.append(DiscoverOption::new("")).await,
        Err(GuardError::Validation)
    ));

    register
        .append(RegisterOption::new("svc/x", Endpoint::new("h1")).multi(true))
        .await
        .unwrap();
    assert!(matches!(
        register
            .append(RegisterOption::new("svc/x", Endpoint::new("h2")).multi(true))
            .await,
        Err(GuardError::AlreadyExists(path)) if path == "svc/x"
    ));

    discover.append(DiscoverOption::new("svc/x")).await.unwrap();
    assert!(matches!(
        discover.append(DiscoverOption::new("svc/x")).await,
        Err(GuardError::AlreadyExists(_))
    ));
    assert_eq!(register.paths(), vec!["svc/x"]);
    assert_eq!(discover.paths(), vec!["svc/x"]);
}

#[tokio::test(start_paused = true)]
async fn test_undecodable_value_is_reported_not_materialized() {
    let (_memory, shared) = store();
    let reasons: Reasons = Arc::default();
    let discover = Discover::with_default_handlers(shared.clone());

    let recorded = reasons.clone();
    discover
        .append(
            DiscoverOption::new("svc/u")
                .prefix(true)
                .on_failed(move |_, _, _, err| recorded.lock().push(err.reason())),
        )
        .await
        .unwrap();

    shared
        .put("svc/u/1", b"not json".to_vec(), None)
        .await
        .unwrap();

    assert!(eventually(Duration::from_secs(1), || !reasons.lock().is_empty()).await);
    assert_eq!(*reasons.lock(), vec!["serialization"]);
    assert!(discover.prefix_get_children("svc/u").unwrap().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_singletons_admit_one() {
    let (memory, shared) = store();
    let first = Register::with_default_handlers(shared.clone());
    let second = Register::with_default_handlers(shared.clone());
    let reasons: Reasons = Arc::default();

    let (a, b) = (reasons.clone(), reasons.clone());
    let (ra, rb) = tokio::join!(
        first.append(
            RegisterOption::new("svc/race", Endpoint::new("h1"))
                .on_failed(move |_, _, _, err| a.lock().push(err.reason())),
        ),
        second.append(
            RegisterOption::new("svc/race", Endpoint::new("h2"))
                .on_failed(move |_, _, _, err| b.lock().push(err.reason())),
        ),
    );
    ra.unwrap();
    rb.unwrap();

    assert_eq!(*reasons.lock(), vec!["conflict"]);
    assert_eq!(first.len() + second.len(), 1);
    assert_eq!(shared.get("svc/race", false).await.unwrap().kvs.len(), 1);
    assert_eq!(memory.lease_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_multi_instances_all_discovered() {
    let (_memory, shared) = store();
    let discover = Discover::with_default_handlers(shared.clone());
    discover
        .append(DiscoverOption::new("svc/n").prefix(true))
        .await
        .unwrap();

    let registrants: Vec<Register> = (0..5)
        .map(|_| Register::with_default_handlers(shared.clone()))
        .collect();
    let appends = registrants.iter().enumerate().map(|(i, register)| {
        register.append(RegisterOption::new("svc/n", Endpoint::new(format!("h{i}"))).multi(true))
    });
    for result in futures::future::join_all(appends).await {
        result.unwrap();
    }

    let children = discover.prefix_get_children("svc/n").unwrap();
    assert!(eventually(Duration::from_secs(1), || children.count() == 5).await);
    assert_eq!(shared.get("svc/n", true).await.unwrap().kvs.len(), 5);
}

#[tokio::test(start_paused = true)]
async fn test_lagging_watch_recovers_every_child() {
    let (_memory, shared) = store();
    let discover =
        Discover::with_default_handlers(shared.clone()).with_reconnect_policy(fast_reconnect(5));
    discover
        .append(DiscoverOption::new("svc/lag").prefix(true))
        .await
        .unwrap();

    let value = Endpoint::new("h1").to_bytes().unwrap();
    for i in 0..1100 {
        shared
            .put(&format!("svc/lag/{i}"), value.clone(), None)
            .await
            .unwrap();
    }

    let children = discover.prefix_get_children("svc/lag").unwrap();
    assert!(eventually(Duration::from_secs(2), || children.count() == 1100).await);
    assert_eq!(
        discover.machine("svc/lag").unwrap().phase(),
        DiscoverPhase::Watching
    );
}

/// Writes `key` once, between the watch being opened and the snapshot read.
struct WriteDuringSnapshot {
    inner: MemoryStore,
    key: &'static str,
    written: AtomicBool,
}

#[async_trait]
impl CoordinationStore for WriteDuringSnapshot {
    async fn get(&self, key: &str, prefix: bool) -> Result<Snapshot, StoreError> {
        if !self.written.swap(true, Ordering::SeqCst) {
            let value = Endpoint::new("late").to_bytes().unwrap_or_default();
            self.inner.put(self.key, value, None).await?;
        }
        self.inner.get(key, prefix).await
    }

    async fn put(&self, key: &str, value: Vec<u8>, lease: Option<LeaseId>) -> Result<(), StoreError> {
        self.inner.put(key, value, lease).await
    }

    async fn put_if_absent(&self, key: &str, value: Vec<u8>, lease: LeaseId) -> Result<bool, StoreError> {
        self.inner.put_if_absent(key, value, lease).await
    }

    async fn grant_lease(&self, ttl: i64) -> Result<LeaseId, StoreError> {
        self.inner.grant_lease(ttl).await
    }

    async fn keep_alive(&self, lease: LeaseId) -> Result<KeepAliveStream, StoreError> {
        self.inner.keep_alive(lease).await
    }

    async fn revoke(&self, lease: LeaseId) -> Result<(), StoreError> {
        self.inner.revoke(lease).await
    }

    async fn watch(&self, key: &str, prefix: bool) -> Result<WatchStream, StoreError> {
        self.inner.watch(key, prefix).await
    }
}

#[tokio::test(start_paused = true)]
async fn test_write_between_watch_and_snapshot_dispatched_once() {
    let memory = MemoryStore::new();
    let shared: Arc<dyn CoordinationStore> = Arc::new(WriteDuringSnapshot {
        inner: memory.clone(),
        key: "svc/once/1",
        written: AtomicBool::new(false),
    });

    let keys = Arc::new(Mutex::new(Vec::new()));
    let seen = keys.clone();
    let discover = Discover::with_default_handlers(shared.clone());
    discover
        .append(
            DiscoverOption::new("svc/once")
                .prefix(true)
                .on_put(move |key, _, _| seen.lock().push(key.to_string())),
        )
        .await
        .unwrap();
    assert_eq!(*keys.lock(), vec!["svc/once/1"]);

    memory
        .put("svc/once/2", Endpoint::new("h2").to_bytes().unwrap(), None)
        .await
        .unwrap();
    assert!(eventually(Duration::from_secs(1), || keys.lock().len() >= 2).await);
    sleep(Duration::from_millis(100)).await;
    assert_eq!(*keys.lock(), vec!["svc/once/1", "svc/once/2"]);
}

struct ErrorCount(Arc<AtomicUsize>);

impl<S: Subscriber> Layer<S> for ErrorCount {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        if *event.metadata().level() == Level::ERROR {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }
}

#[tokio::test(start_paused = true)]
async fn test_failed_start_logs_one_error() {
    let (_memory, shared) = store();
    let errors = Arc::new(AtomicUsize::new(0));
    let _guard = tracing::subscriber::set_default(
        tracing_subscriber::registry().with(ErrorCount(errors.clone())),
    );

    let first = Register::with_default_handlers(shared.clone());
    let second = Register::with_default_handlers(shared.clone());
    first
        .append(RegisterOption::new("svc/log", Endpoint::new("h1")))
        .await
        .unwrap();
    second
        .append(RegisterOption::new("svc/log", Endpoint::new("h2")))
        .await
        .unwrap();

    assert!(second.is_empty());
    assert_eq!(errors.load(Ordering::SeqCst), 1);
}
