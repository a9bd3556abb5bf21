//! Etcd Store
//!
//! `CoordinationStore` over `etcd-client`: connection with retry, lease
//! keep-alive driving, create-revision transactions and watch streams.

use super::{
    CoordinationStore, EventKind, KeepAliveAck, KeepAliveStream, KeyValue, LeaseId, Snapshot,
    StoreError, WatchEvent, WatchStream,
};
use crate::config::LodestarConfig;
use async_trait::async_trait;
use backoff::{future::retry, ExponentialBackoff};
use etcd_client::{
    Client, Compare, CompareOp, ConnectOptions, Event, EventType, GetOptions, LeaseKeepAliveStream,
    LeaseKeeper, PutOptions, Txn, TxnOp, WatchOptions, Watcher,
};
use futures::stream::{self, StreamExt};
use std::time::Duration;
use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};
use tracing::{debug, trace, warn};

/// Floor for the keep-alive period so short TTLs do not spin.
const MIN_KEEPALIVE_PERIOD: Duration = Duration::from_millis(100);

/// Coordination store backed by an etcd cluster
#[derive(Clone)]
pub struct EtcdStore {
    client: Client,
}

impl EtcdStore {
    /// Connect to etcd with exponential backoff
    pub async fn connect(config: &LodestarConfig) -> Result<Self, StoreError> {
        let backoff = ExponentialBackoff {
            initial_interval: config.etcd_backoff_initial,
            max_interval: config.etcd_backoff_max,
            max_elapsed_time: Some(config.etcd_backoff_max_elapsed),
            multiplier: config.etcd_backoff_multiplier,
            ..Default::default()
        };
        let endpoints = &config.etcd_endpoints;
        let timeout = config.etcd_request_timeout;

        let client = retry(backoff, || {
            let endpoints = endpoints.clone();
            async move {
                let options = ConnectOptions::new().with_timeout(timeout);
                match Client::connect(&endpoints, Some(options)).await {
                    Ok(client) => {
                        debug!(endpoints = ?endpoints, "Connected to etcd");
                        Ok(client)
                    }
                    Err(e) => {
                        warn!(error = %e, "etcd connection failed, retrying");
                        Err(backoff::Error::transient(e))
                    }
                }
            }
        })
        .await?;

        Ok(Self { client })
    }

    /// Wrap an already connected client
    pub fn from_client(client: Client) -> Self {
        Self { client }
    }

    pub fn client(&self) -> &Client {
        &self.client
    }
}

#[async_trait]
impl CoordinationStore for EtcdStore {
    async fn get(&self, key: &str, prefix: bool) -> Result<Snapshot, StoreError> {
        let mut client = self.client.clone();
        let options = prefix.then(|| GetOptions::new().with_prefix());
        let resp = client.get(key, options).await?;

        let kvs = resp
            .kvs()
            .iter()
            .filter_map(|kv| {
                Some(KeyValue {
                    key: utf8_key(kv.key())?,
                    value: kv.value().to_vec(),
                })
            })
            .collect();
        Ok(Snapshot {
            revision: resp.header().map_or(0, |h| h.revision()),
            kvs,
        })
    }

    async fn put(
        &self,
        key: &str,
        value: Vec<u8>,
        lease: Option<LeaseId>,
    ) -> Result<(), StoreError> {
        let mut client = self.client.clone();
        let options = lease.map(|id| PutOptions::new().with_lease(id));
        client.put(key, value, options).await?;
        Ok(())
    }

    async fn put_if_absent(
        &self,
        key: &str,
        value: Vec<u8>,
        lease: LeaseId,
    ) -> Result<bool, StoreError> {
        let mut client = self.client.clone();
        let txn = Txn::new()
            .when(vec![Compare::create_revision(key, CompareOp::Equal, 0)])
            .and_then(vec![TxnOp::put(
                key,
                value,
                Some(PutOptions::new().with_lease(lease)),
            )]);

        let resp = client.txn(txn).await?;
        Ok(resp.succeeded())
    }

    async fn grant_lease(&self, ttl: i64) -> Result<LeaseId, StoreError> {
        let mut client = self.client.clone();
        let resp = client.lease_grant(ttl, None).await?;
        debug!(lease_id = resp.id(), ttl = resp.ttl(), "Lease granted");
        Ok(resp.id())
    }

    async fn keep_alive(&self, lease: LeaseId) -> Result<KeepAliveStream, StoreError> {
        let mut client = self.client.clone();
        let (keeper, stream) = client.lease_keep_alive(lease).await?;

        let state = KeepAliveState {
            lease_id: lease,
            keeper,
            stream,
            interval: None,
        };
        Ok(stream::unfold(state, KeepAliveState::next).boxed())
    }

    async fn revoke(&self, lease: LeaseId) -> Result<(), StoreError> {
        let mut client = self.client.clone();
        client.lease_revoke(lease).await?;
        debug!(lease_id = lease, "Lease revoked");
        Ok(())
    }

    async fn watch(&self, key: &str, prefix: bool) -> Result<WatchStream, StoreError> {
        let mut client = self.client.clone();
        let options = prefix.then(|| WatchOptions::new().with_prefix());
        let (watcher, watch_stream) = client.watch(key, options).await?;
        debug!(key = %key, prefix = prefix, "Watch stream established");

        let state = WatchState {
            key: key.to_string(),
            watcher,
            stream: watch_stream,
        };
        let batches = stream::unfold(state, WatchState::next);

        Ok(batches.flat_map(stream::iter).boxed())
    }
}

/// Keys are paths; a key that is not UTF-8 cannot name one and is skipped.
fn utf8_key(key: &[u8]) -> Option<String> {
    match std::str::from_utf8(key) {
        Ok(key) => Some(key.to_string()),
        Err(e) => {
            warn!(key = ?key, error = %e, "Skipping non UTF-8 key");
            None
        }
    }
}

fn convert_event(event: &Event) -> Option<WatchEvent> {
    let kv = event.kv()?;
    let kind = match event.event_type() {
        EventType::Put => EventKind::Put,
        EventType::Delete => EventKind::Delete,
    };
    Some(WatchEvent {
        kind,
        key: utf8_key(kv.key())?,
        value: kv.value().to_vec(),
        revision: kv.mod_revision(),
    })
}

/// Open watch; the `Watcher` holds the request side and must outlive the stream.
struct WatchState {
    key: String,
    watcher: Watcher,
    stream: etcd_client::WatchStream,
}

impl WatchState {
    async fn next(mut self) -> Option<(Vec<WatchEvent>, Self)> {
        match self.stream.message().await {
            Ok(Some(resp)) => {
                if resp.canceled() {
                    warn!(key = %self.key, watch_id = self.watcher.watch_id(), "Watch stream canceled");
                    return None;
                }
                let events: Vec<WatchEvent> =
                    resp.events().iter().filter_map(convert_event).collect();
                Some((events, self))
            }
            Ok(None) => {
                debug!(key = %self.key, "Watch stream closed");
                None
            }
            Err(e) => {
                warn!(key = %self.key, error = %e, "Watch stream failed");
                None
            }
        }
    }
}

/// Drives a `LeaseKeeper`: one renewal per period, one ack per renewal.
struct KeepAliveState {
    lease_id: LeaseId,
    keeper: LeaseKeeper,
    stream: LeaseKeepAliveStream,
    /// Created after the first ack, once the granted TTL is known
    interval: Option<Interval>,
}

impl KeepAliveState {
    async fn next(mut self) -> Option<(KeepAliveAck, Self)> {
        if let Some(interval) = self.interval.as_mut() {
            interval.tick().await;
        }

        if let Err(e) = self.keeper.keep_alive().await {
            warn!(lease_id = self.lease_id, error = %e, "Keep-alive send failed");
            return None;
        }

        match self.stream.message().await {
            Ok(Some(resp)) if resp.ttl() > 0 => {
                trace!(lease_id = self.lease_id, ttl = resp.ttl(), "Keep-alive OK");
                if self.interval.is_none() {
                    let period = (Duration::from_secs(resp.ttl() as u64) / 3).max(MIN_KEEPALIVE_PERIOD);
                    let mut interval = interval_at(Instant::now() + period, period);
                    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
                    self.interval = Some(interval);
                }
                let ack = KeepAliveAck {
                    lease_id: self.lease_id,
                    ttl: resp.ttl(),
                };
                Some((ack, self))
            }
            Ok(Some(_)) => {
                warn!(lease_id = self.lease_id, "Lease expired");
                None
            }
            Ok(None) => {
                warn!(lease_id = self.lease_id, "Keep-alive stream closed");
                None
            }
            Err(e) => {
                warn!(lease_id = self.lease_id, error = %e, "Keep-alive failed");
                None
            }
        }
    }
}
