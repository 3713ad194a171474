//! Cache event notification
//!
//! Lifecycle events (created/updated/removed/evicted/expired) flow to
//! registered listeners either synchronously on the mutating thread or
//! asynchronously through a fixed set of delivery workers. Async events
//! are routed to a worker by key hash, so events for one key are never
//! reordered regardless of delivery mode; unordered registrations merely
//! make no promise across keys.
//!
//! The registry is per cache instance and its worker threads are joined
//! when the owning cache closes.

use std::hash::{Hash, Hasher};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::JoinHandle;

use crossbeam_channel::{Receiver, Sender, unbounded};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};

/// Kind of cache lifecycle event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    Created,
    Updated,
    Removed,
    Evicted,
    Expired,
}

impl EventKind {
    /// Every event kind; convenient for catch-all registrations.
    pub const ALL: [EventKind; 5] = [
        EventKind::Created,
        EventKind::Updated,
        EventKind::Removed,
        EventKind::Evicted,
        EventKind::Expired,
    ];

    fn bit(self) -> u8 {
        match self {
            EventKind::Created => 1 << 0,
            EventKind::Updated => 1 << 1,
            EventKind::Removed => 1 << 2,
            EventKind::Evicted => 1 << 3,
            EventKind::Expired => 1 << 4,
        }
    }
}

/// One cache lifecycle event.
#[derive(Debug, Clone)]
pub struct CacheEvent<K, V> {
    pub kind: EventKind,
    pub key: K,
    /// Value the key mapped to before the operation, when one existed.
    pub old_value: Option<V>,
    /// Value the key maps to after the operation, when one exists.
    pub new_value: Option<V>,
}

/// Listener capability for cache lifecycle events.
pub trait CacheEventListener<K, V>: Send + Sync + 'static {
    fn on_event(&self, event: &CacheEvent<K, V>);
}

impl<K, V, F> CacheEventListener<K, V> for F
where
    F: Fn(&CacheEvent<K, V>) + Send + Sync + 'static,
{
    fn on_event(&self, event: &CacheEvent<K, V>) {
        self(event)
    }
}

/// Whether delivery blocks the triggering operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeliveryMode {
    Synchronous,
    Asynchronous,
}

/// Cross-key ordering promise. Same-key order always holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeliveryOrdering {
    Ordered,
    Unordered,
}

/// Token returned by registration, used to deregister.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListenerHandle(u64);

struct Registration<K, V> {
    id: u64,
    listener: Arc<dyn CacheEventListener<K, V>>,
    mask: u8,
    mode: DeliveryMode,
}

struct AsyncDelivery<K, V> {
    event: CacheEvent<K, V>,
    listeners: Vec<Arc<dyn CacheEventListener<K, V>>>,
}

/// Per-cache listener registry and delivery pipeline.
pub(crate) struct EventDispatcher<K, V> {
    registrations: RwLock<Vec<Registration<K, V>>>,
    next_id: AtomicU64,
    senders: RwLock<Vec<Sender<AsyncDelivery<K, V>>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl<K, V> EventDispatcher<K, V>
where
    K: Clone + Hash + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    /// Create a dispatcher with `delivery_threads` async delivery workers.
    pub(crate) fn new(delivery_threads: usize) -> Result<Self, crate::cache::error::CacheError> {
        let mut senders = Vec::with_capacity(delivery_threads);
        let mut workers = Vec::with_capacity(delivery_threads);
        for worker_idx in 0..delivery_threads {
            let (sender, receiver): (Sender<AsyncDelivery<K, V>>, Receiver<AsyncDelivery<K, V>>) =
                unbounded();
            senders.push(sender);
            let worker = std::thread::Builder::new()
                .name(format!("stratacache-events-{}", worker_idx))
                .spawn(move || {
                    while let Ok(delivery) = receiver.recv() {
                        for listener in &delivery.listeners {
                            deliver(listener.as_ref(), &delivery.event);
                        }
                    }
                })?;
            workers.push(worker);
        }
        Ok(Self {
            registrations: RwLock::new(Vec::new()),
            next_id: AtomicU64::new(1),
            senders: RwLock::new(senders),
            workers: Mutex::new(workers),
        })
    }

    pub(crate) fn register(
        &self,
        listener: Arc<dyn CacheEventListener<K, V>>,
        kinds: &[EventKind],
        mode: DeliveryMode,
        ordering: DeliveryOrdering,
    ) -> ListenerHandle {
        let mask = kinds.iter().fold(0u8, |mask, kind| mask | kind.bit());
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        log::debug!(
            "registering {:?}/{:?} listener {} for mask {:#07b}",
            mode,
            ordering,
            id,
            mask
        );
        self.registrations.write().push(Registration {
            id,
            listener,
            mask,
            mode,
        });
        ListenerHandle(id)
    }

    /// Remove a registration. Returns `false` when the handle is unknown.
    pub(crate) fn deregister(&self, handle: ListenerHandle) -> bool {
        let mut registrations = self.registrations.write();
        let before = registrations.len();
        registrations.retain(|reg| reg.id != handle.0);
        registrations.len() != before
    }

    /// True when at least one registration subscribes to `kind`; lets the
    /// caller skip building the event payload entirely.
    pub(crate) fn wants(&self, kind: EventKind) -> bool {
        self.registrations
            .read()
            .iter()
            .any(|reg| reg.mask & kind.bit() != 0)
    }

    /// Publish one event. Synchronous listeners run inline; asynchronous
    /// listeners receive it on the delivery worker owning the key's hash
    /// partition.
    pub(crate) fn dispatch(&self, event: CacheEvent<K, V>) {
        let mut sync_targets = Vec::new();
        let mut async_targets = Vec::new();
        {
            // Snapshot the targets so no listener runs under the registry
            // lock; a sync listener is free to register or deregister.
            let registrations = self.registrations.read();
            for reg in registrations.iter() {
                if reg.mask & event.kind.bit() == 0 {
                    continue;
                }
                match reg.mode {
                    DeliveryMode::Synchronous => sync_targets.push(Arc::clone(&reg.listener)),
                    DeliveryMode::Asynchronous => async_targets.push(Arc::clone(&reg.listener)),
                }
            }
        }
        for listener in &sync_targets {
            deliver(listener.as_ref(), &event);
        }
        if async_targets.is_empty() {
            return;
        }
        let senders = self.senders.read();
        if senders.is_empty() {
            // Dispatcher already shut down; drop the event.
            return;
        }
        let partition = key_partition(&event.key, senders.len());
        let _ = senders[partition].send(AsyncDelivery {
            event,
            listeners: async_targets,
        });
    }

    /// Stop async delivery: close the channels and join the workers,
    /// flushing everything already enqueued.
    pub(crate) fn shutdown(&self) {
        self.senders.write().clear();
        let workers = std::mem::take(&mut *self.workers.lock());
        for worker in workers {
            if worker.join().is_err() {
                log::error!("event delivery worker panicked before shutdown");
            }
        }
    }
}

fn deliver<K: 'static, V: 'static>(
    listener: &dyn CacheEventListener<K, V>,
    event: &CacheEvent<K, V>,
) {
    let outcome = catch_unwind(AssertUnwindSafe(|| listener.on_event(event)));
    if outcome.is_err() {
        log::error!("cache event listener panicked during {:?} delivery", event.kind);
    }
}

/// Stable worker routing: one key always lands on the same partition, so
/// per-key delivery order is preserved at any worker count.
pub(crate) fn key_partition<K: Hash>(key: &K, partitions: usize) -> usize {
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    key.hash(&mut hasher);
    (hasher.finish() % partitions as u64) as usize
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn event(kind: EventKind, key: u64) -> CacheEvent<u64, String> {
        CacheEvent {
            kind,
            key,
            old_value: None,
            new_value: Some("v".to_string()),
        }
    }

    #[test]
    fn mask_filters_event_kinds() {
        let dispatcher: EventDispatcher<u64, String> = EventDispatcher::new(1).unwrap();
        let hits = Arc::new(AtomicUsize::new(0));
        let observed = Arc::clone(&hits);
        dispatcher.register(
            Arc::new(move |_: &CacheEvent<u64, String>| {
                observed.fetch_add(1, Ordering::SeqCst);
            }),
            &[EventKind::Created, EventKind::Evicted],
            DeliveryMode::Synchronous,
            DeliveryOrdering::Ordered,
        );
        dispatcher.dispatch(event(EventKind::Created, 1));
        dispatcher.dispatch(event(EventKind::Updated, 1));
        dispatcher.dispatch(event(EventKind::Evicted, 1));
        assert_eq!(hits.load(Ordering::SeqCst), 2);
        assert!(dispatcher.wants(EventKind::Created));
        assert!(!dispatcher.wants(EventKind::Removed));
        dispatcher.shutdown();
    }

    #[test]
    fn async_delivery_preserves_per_key_order() {
        let dispatcher: EventDispatcher<u64, String> = EventDispatcher::new(4).unwrap();
        let seen: Arc<parking_lot::Mutex<Vec<String>>> =
            Arc::new(parking_lot::Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        dispatcher.register(
            Arc::new(move |event: &CacheEvent<u64, String>| {
                if let Some(value) = &event.new_value {
                    sink.lock().push(value.clone());
                }
            }),
            &EventKind::ALL,
            DeliveryMode::Asynchronous,
            DeliveryOrdering::Unordered,
        );
        for i in 0..64u64 {
            dispatcher.dispatch(CacheEvent {
                kind: EventKind::Updated,
                key: 42,
                old_value: None,
                new_value: Some(format!("{}", i)),
            });
        }
        // Shutdown joins the workers, flushing the queue.
        dispatcher.shutdown();
        let seen = seen.lock();
        let expected: Vec<String> = (0..64).map(|i| format!("{}", i)).collect();
        assert_eq!(*seen, expected);
    }

    #[test]
    fn deregistered_listener_stops_receiving() {
        let dispatcher: EventDispatcher<u64, String> = EventDispatcher::new(1).unwrap();
        let hits = Arc::new(AtomicUsize::new(0));
        let observed = Arc::clone(&hits);
        let handle = dispatcher.register(
            Arc::new(move |_: &CacheEvent<u64, String>| {
                observed.fetch_add(1, Ordering::SeqCst);
            }),
            &EventKind::ALL,
            DeliveryMode::Synchronous,
            DeliveryOrdering::Ordered,
        );
        dispatcher.dispatch(event(EventKind::Created, 1));
        assert!(dispatcher.deregister(handle));
        assert!(!dispatcher.deregister(handle));
        dispatcher.dispatch(event(EventKind::Created, 2));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        dispatcher.shutdown();
    }

    #[test]
    fn listener_may_mutate_registrations_during_delivery() {
        let dispatcher: Arc<EventDispatcher<u64, String>> =
            Arc::new(EventDispatcher::new(1).unwrap());
        let hits = Arc::new(AtomicUsize::new(0));
        let observed = Arc::clone(&hits);
        let registry = Arc::clone(&dispatcher);
        // Registering from inside a synchronous delivery takes the write
        // lock; delivery must not still hold the read lock.
        dispatcher.register(
            Arc::new(move |_: &CacheEvent<u64, String>| {
                observed.fetch_add(1, Ordering::SeqCst);
                registry.register(
                    Arc::new(|_: &CacheEvent<u64, String>| {}),
                    &[EventKind::Removed],
                    DeliveryMode::Synchronous,
                    DeliveryOrdering::Ordered,
                );
            }),
            &[EventKind::Created],
            DeliveryMode::Synchronous,
            DeliveryOrdering::Ordered,
        );
        dispatcher.dispatch(event(EventKind::Created, 1));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert!(dispatcher.wants(EventKind::Removed));
        dispatcher.shutdown();
    }

    #[test]
    fn panicking_listener_does_not_poison_delivery() {
        let dispatcher: EventDispatcher<u64, String> = EventDispatcher::new(1).unwrap();
        dispatcher.register(
            Arc::new(|_: &CacheEvent<u64, String>| panic!("listener bug")),
            &EventKind::ALL,
            DeliveryMode::Synchronous,
            DeliveryOrdering::Ordered,
        );
        let hits = Arc::new(AtomicUsize::new(0));
        let observed = Arc::clone(&hits);
        dispatcher.register(
            Arc::new(move |_: &CacheEvent<u64, String>| {
                observed.fetch_add(1, Ordering::SeqCst);
            }),
            &EventKind::ALL,
            DeliveryMode::Synchronous,
            DeliveryOrdering::Ordered,
        );
        dispatcher.dispatch(event(EventKind::Created, 1));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        dispatcher.shutdown();
    }
}
