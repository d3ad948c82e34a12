//! Watch-driven resource caches.
//!
//! Each cache is a `kube_runtime` reflector [`Store`] fed by a
//! [`CacheFeeder`] that owns the store's [`Writer`]. The feeder applies
//! watcher events and turns them into add/update/delete [`Notification`]s
//! for the event router, including:
//! - relists after a reconnect (objects that vanished produce deletes)
//! - periodic resync (every cached object re-delivered as an update
//!   whose old and new snapshots are identical)

use crate::error::ControllerError;
use futures::{Stream, StreamExt};
use kube::{Api, Resource};
use kube_runtime::reflector::store::Writer;
use kube_runtime::reflector::{ObjectRef, Store};
use kube_runtime::watcher;
use kube_runtime::WatchStreamExt;
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::fmt::Debug;
use std::hash::Hash;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Capacity of the per-kind notification channel to the router
pub const NOTIFICATION_BUFFER: usize = 1024;

/// A change observed by a cache
#[derive(Debug, Clone)]
pub enum Notification<K> {
    /// Object appeared
    Added(Arc<K>),
    /// Object changed (or was re-delivered by a resync, in which case `old` and `new` are the same)
    Updated {
        /// Snapshot before the change
        old: Arc<K>,
        /// Snapshot after the change
        new: Arc<K>,
    },
    /// Object was removed; carries its last known state
    Deleted(Arc<K>),
}

/// Read-only view of a cache, cheap to clone
#[derive(Clone)]
pub struct ResourceCache<K>
where
    K: Resource + Clone + 'static,
    K::DynamicType: Default + Eq + Hash + Clone,
{
    store: Store<K>,
    synced: Arc<AtomicBool>,
    kind: &'static str,
}

impl<K> Debug for ResourceCache<K>
where
    K: Resource + Clone + 'static,
    K::DynamicType: Default + Eq + Hash + Clone,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceCache")
            .field("kind", &self.kind)
            .field("synced", &self.has_synced())
            .finish_non_exhaustive()
    }
}

impl<K> ResourceCache<K>
where
    K: Resource + Clone + 'static,
    K::DynamicType: Default + Eq + Hash + Clone,
{
    /// Looks up an object by namespace and name. Never blocks on the network.
    pub fn get(&self, namespace: &str, name: &str) -> Option<Arc<K>> {
        let mut obj_ref = ObjectRef::<K>::new(name);
        if !namespace.is_empty() {
            obj_ref = obj_ref.within(namespace);
        }
        self.store.get(&obj_ref)
    }

    /// Lists cached objects in `namespace` (all namespaces when empty).
    pub fn list(&self, namespace: &str) -> Vec<Arc<K>> {
        self.store
            .state()
            .into_iter()
            .filter(|obj| namespace.is_empty() || obj.meta().namespace.as_deref() == Some(namespace))
            .collect()
    }

    /// Whether the initial full listing has been applied. Stays true afterwards.
    pub fn has_synced(&self) -> bool {
        self.synced.load(Ordering::Acquire)
    }

    /// Waits for the initial listing.
    ///
    /// Fails if the feeder was dropped before the cache became ready.
    pub async fn wait_for_sync(&self) -> Result<(), ControllerError> {
        if self.has_synced() {
            return Ok(());
        }
        self.store
            .wait_until_ready()
            .await
            .map_err(|_| ControllerError::CacheClosed(self.kind))
    }

    /// Kind name used in logs
    pub fn kind(&self) -> &'static str {
        self.kind
    }
}

/// Owns the cache writer and produces notifications from watcher events.
pub struct CacheFeeder<K>
where
    K: Resource + Clone + 'static,
    K::DynamicType: Default + Eq + Hash + Clone,
{
    writer: Writer<K>,
    synced: Arc<AtomicBool>,
    kind: &'static str,
    tx: mpsc::Sender<Notification<K>>,
}

impl<K> CacheFeeder<K>
where
    K: Resource + Clone + Debug + Send + Sync + 'static,
    K::DynamicType: Default + Eq + Hash + Clone,
{
    /// Creates an empty cache whose notifications go to `tx`.
    pub fn new(kind: &'static str, tx: mpsc::Sender<Notification<K>>) -> Self {
        Self {
            writer: Writer::default(),
            synced: Arc::new(AtomicBool::new(false)),
            kind,
            tx,
        }
    }

    /// Read handle sharing this feeder's store
    pub fn cache(&self) -> ResourceCache<K> {
        ResourceCache {
            store: self.writer.as_reader(),
            synced: self.synced.clone(),
            kind: self.kind,
        }
    }

    /// Applies one watcher event to the store and returns the resulting notifications.
    ///
    /// During a (re)list the store is only swapped on `InitDone`, so the
    /// notifications for a relist are computed by diffing the store before
    /// and after the swap.
    pub fn apply(&mut self, event: &watcher::Event<K>) -> Vec<Notification<K>> {
        match event {
            watcher::Event::Apply(obj) => {
                let obj_ref = ObjectRef::from_obj(obj);
                let reader = self.writer.as_reader();
                let old = reader.get(&obj_ref);
                self.writer.apply_watcher_event(event);
                let Some(new) = reader.get(&obj_ref) else {
                    return Vec::new();
                };
                match old {
                    Some(old) => vec![Notification::Updated { old, new }],
                    None => vec![Notification::Added(new)],
                }
            }
            watcher::Event::Delete(obj) => {
                self.writer.apply_watcher_event(event);
                vec![Notification::Deleted(Arc::new(obj.clone()))]
            }
            watcher::Event::Init | watcher::Event::InitApply(_) => {
                self.writer.apply_watcher_event(event);
                Vec::new()
            }
            watcher::Event::InitDone => {
                let reader = self.writer.as_reader();
                let mut previous: HashMap<ObjectRef<K>, Arc<K>> = reader
                    .state()
                    .into_iter()
                    .map(|obj| (ObjectRef::from_obj(obj.as_ref()), obj))
                    .collect();
                self.writer.apply_watcher_event(event);

                let mut notifications = Vec::new();
                for new in reader.state() {
                    match previous.remove(&ObjectRef::from_obj(new.as_ref())) {
                        Some(old) => notifications.push(Notification::Updated { old, new }),
                        None => notifications.push(Notification::Added(new)),
                    }
                }
                notifications.extend(previous.into_values().map(Notification::Deleted));

                if !self.synced.swap(true, Ordering::AcqRel) {
                    info!("{} cache synced with {} objects", self.kind, notifications.len());
                }
                notifications
            }
        }
    }

    /// Re-delivers every cached object as an unchanged update.
    pub fn resync(&self) -> Vec<Notification<K>> {
        self.writer
            .as_reader()
            .state()
            .into_iter()
            .map(|obj| Notification::Updated {
                old: obj.clone(),
                new: obj,
            })
            .collect()
    }

    /// Consumes a watcher stream until it ends or the router goes away.
    ///
    /// Watch errors are logged; the stream itself is responsible for
    /// reconnecting. A `resync` of `None` disables periodic resync.
    pub async fn run<S>(mut self, events: S, resync: Option<Duration>) -> Result<(), ControllerError>
    where
        S: Stream<Item = Result<watcher::Event<K>, watcher::Error>>,
    {
        let mut events = std::pin::pin!(events);
        let mut ticker = resync.map(|period| {
            let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            interval
        });

        info!("Starting {} cache", self.kind);
        loop {
            let batch = tokio::select! {
                event = events.next() => match event {
                    Some(Ok(event)) => self.apply(&event),
                    Some(Err(e)) => {
                        warn!("{} watch error (will retry): {}", self.kind, e);
                        continue;
                    }
                    None => {
                        return Err(ControllerError::Watch(format!("{} watch stream ended", self.kind)));
                    }
                },
                () = next_tick(ticker.as_mut()) => {
                    if !self.synced.load(Ordering::Acquire) {
                        continue;
                    }
                    debug!("Resyncing {} cache", self.kind);
                    self.resync()
                }
            };

            for notification in batch {
                if self.tx.send(notification).await.is_err() {
                    debug!("{} notification receiver closed, stopping cache", self.kind);
                    return Ok(());
                }
            }
        }
    }
}

async fn next_tick(ticker: Option<&mut tokio::time::Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending().await,
    }
}

/// Long-lived watch over `api` with automatic reconnect and relist.
pub fn watch_stream<K>(api: Api<K>) -> impl Stream<Item = Result<watcher::Event<K>, watcher::Error>> + Send
where
    K: Resource + Clone + DeserializeOwned + Debug + Send + 'static,
{
    watcher::watcher(api, watcher::Config::default()).default_backoff()
}

#[cfg(test)]
#[path = "cache_test.rs"]
mod cache_test;
