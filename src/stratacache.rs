//! Public cache facade and builder.
//!
//! `Stratacache` is a cheaply cloneable handle over the store
//! coordinator; every clone shares the same tiers, workers and listener
//! registry. Construction goes through [`StratacacheBuilder`], which
//! validates the tier layout before any thread is spawned.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::cache::accounting::{ResourcePools, ResourceUnit};
use crate::cache::config::{CacheConfig, PoolSettings};
use crate::cache::coordinator::StoreCoordinator;
use crate::cache::error::CacheError;
use crate::cache::events::{
    CacheEventListener, DeliveryMode, DeliveryOrdering, EventDispatcher, EventKind, ListenerHandle,
};
use crate::cache::eviction::LruPolicy;
use crate::cache::tier::disk::DiskTier;
use crate::cache::tier::heap::{HeapTier, Weigher};
use crate::cache::tier::offheap::OffHeapTier;
use crate::cache::tier::{TierId, TierStore};
use crate::cache::traits::{CacheKey, CacheLoaderWriter, CacheValue, EvictionVeto};
use crate::cache::write_behind::{WriteBehindConfig, WriteBehindFailureHandler, WriteBehindQueue};

/// Multi-tier cache handle.
///
/// Operations run against the fastest tier holding the key and fall
/// back tier by tier; see the builder for how tiers are declared.
pub struct Stratacache<K: CacheKey, V: CacheValue> {
    inner: Arc<StoreCoordinator<K, V>>,
}

impl<K: CacheKey, V: CacheValue> Clone for Stratacache<K, V> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<K: CacheKey, V: CacheValue> Stratacache<K, V> {
    pub fn builder() -> StratacacheBuilder<K, V> {
        StratacacheBuilder::new()
    }

    /// Look the key up across tiers, slowest-tier hits getting promoted
    /// toward the heap. Falls back to the configured loader on a miss.
    pub fn get(&self, key: &K) -> Result<Option<V>, CacheError> {
        self.inner.get(key)
    }

    /// Insert or replace a mapping, returning the previous value when
    /// one was resident. Propagates to the system of record when a
    /// loader-writer is configured.
    pub fn put(&self, key: K, value: V) -> Result<Option<V>, CacheError> {
        self.inner.put(key, value)
    }

    /// Remove the mapping from every tier and the system of record.
    pub fn remove(&self, key: &K) -> Result<Option<V>, CacheError> {
        self.inner.remove(key)
    }

    /// Drop every entry. No per-key events fire and the system of
    /// record is untouched.
    pub fn clear(&self) -> Result<(), CacheError> {
        self.inner.clear()
    }

    pub fn contains_key(&self, key: &K) -> Result<bool, CacheError> {
        self.inner.contains_key(key)
    }

    /// Resident entry count summed over tiers.
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.len() == 0
    }

    /// Point-in-time usage/capacity snapshot for every configured tier.
    pub fn resource_pools(&self) -> ResourcePools {
        self.inner.resource_pools()
    }

    /// Resize pool capacities at runtime. Tiers whose usage exceeds the
    /// new capacity are shrunk (evicting or demoting) before this
    /// returns. Tiers cannot be added or removed after construction.
    pub fn update_resource_pools(&self, pools: &PoolSettings) -> Result<(), CacheError> {
        self.inner.update_resource_pools(pools)
    }

    pub fn register_listener(
        &self,
        listener: Arc<dyn CacheEventListener<K, V>>,
        kinds: &[EventKind],
        mode: DeliveryMode,
        ordering: DeliveryOrdering,
    ) -> ListenerHandle {
        self.inner.register_listener(listener, kinds, mode, ordering)
    }

    pub fn deregister_listener(&self, handle: ListenerHandle) -> bool {
        self.inner.deregister_listener(handle)
    }

    /// Block until every queued write-behind mutation has been handed to
    /// the writer. A no-op without write-behind.
    pub fn flush(&self) -> Result<(), CacheError> {
        self.inner.flush()
    }

    /// Drain queued work, join the worker threads and fail all later
    /// calls with `CacheClosed`. Idempotent.
    pub fn close(&self) {
        self.inner.close()
    }
}

/// Builder for [`Stratacache`].
///
/// At minimum a heap pool must be declared. Everything else layers on:
/// slower tiers, expiry, a loader-writer (write-through by default,
/// write-behind when a queue config is supplied), eviction veto,
/// listeners.
pub struct StratacacheBuilder<K: CacheKey, V: CacheValue> {
    pools: Option<PoolSettings>,
    ttl: Option<Duration>,
    loader_writer: Option<Arc<dyn CacheLoaderWriter<K, V>>>,
    veto: Option<Arc<dyn EvictionVeto<K, V>>>,
    write_behind: Option<WriteBehindConfig>,
    write_behind_failure_handler: Option<WriteBehindFailureHandler<K, V>>,
    persistence_dir: Option<PathBuf>,
    weigher: Option<Weigher<K, V>>,
    listeners: Vec<ListenerSetup<K, V>>,
    event_delivery_threads: usize,
}

struct ListenerSetup<K, V> {
    listener: Arc<dyn CacheEventListener<K, V>>,
    kinds: Vec<EventKind>,
    mode: DeliveryMode,
    ordering: DeliveryOrdering,
}

impl<K: CacheKey, V: CacheValue> Default for StratacacheBuilder<K, V> {
    fn default() -> Self {
        Self {
            pools: None,
            ttl: None,
            loader_writer: None,
            veto: None,
            write_behind: None,
            write_behind_failure_handler: None,
            persistence_dir: None,
            weigher: None,
            listeners: Vec::new(),
            event_delivery_threads: 1,
        }
    }
}

impl<K: CacheKey, V: CacheValue> StratacacheBuilder<K, V> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed the builder from a [`CacheConfig`]. Listeners, veto and the
    /// loader-writer are code, not config, and are set separately.
    pub fn from_config(config: CacheConfig) -> Self {
        Self {
            pools: Some(config.pools),
            ttl: config.ttl,
            write_behind: config.write_behind,
            persistence_dir: config.persistence_dir,
            event_delivery_threads: config.event_delivery_threads,
            ..Self::default()
        }
    }

    /// Per-tier capacities; see [`crate::cache::config::ResourcePoolsBuilder`].
    pub fn resource_pools(mut self, pools: PoolSettings) -> Self {
        self.pools = Some(pools);
        self
    }

    /// Time-to-live measured from entry creation. Updates reset it.
    pub fn time_to_live(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    /// Connect a system of record. Misses consult its `load`; mutations
    /// propagate through `write`/`delete`, synchronously unless
    /// [`write_behind`](Self::write_behind) is also set.
    pub fn loader_writer(mut self, loader_writer: Arc<dyn CacheLoaderWriter<K, V>>) -> Self {
        self.loader_writer = Some(loader_writer);
        self
    }

    /// Predicate consulted before evicting an entry; vetoed entries are
    /// passed over. Capacity degrades to a soft bound if everything in a
    /// tier is vetoed.
    pub fn eviction_veto(mut self, veto: Arc<dyn EvictionVeto<K, V>>) -> Self {
        self.veto = Some(veto);
        self
    }

    /// Defer writer propagation through a bounded queue. Requires a
    /// loader-writer.
    pub fn write_behind(mut self, config: WriteBehindConfig) -> Self {
        self.write_behind = Some(config);
        self
    }

    /// Callback invoked with mutations the write-behind workers gave up
    /// on after exhausting retries. Without one, failures are logged.
    pub fn write_behind_failure_handler(
        mut self,
        handler: WriteBehindFailureHandler<K, V>,
    ) -> Self {
        self.write_behind_failure_handler = Some(handler);
        self
    }

    /// Backing directory for the disk tier. Entries found there at
    /// build time are restored.
    pub fn persistence_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.persistence_dir = Some(dir.into());
        self
    }

    /// Byte-weight estimator for heap entries when the heap pool is
    /// sized in bytes. Ignored for entry-counted heaps.
    pub fn weigher(mut self, weigher: Weigher<K, V>) -> Self {
        self.weigher = Some(weigher);
        self
    }

    /// Register a listener at build time; more can be added on the
    /// running cache.
    pub fn listener(
        mut self,
        listener: Arc<dyn CacheEventListener<K, V>>,
        kinds: &[EventKind],
        mode: DeliveryMode,
        ordering: DeliveryOrdering,
    ) -> Self {
        self.listeners.push(ListenerSetup {
            listener,
            kinds: kinds.to_vec(),
            mode,
            ordering,
        });
        self
    }

    /// Worker threads for asynchronous event delivery.
    pub fn event_delivery_threads(mut self, threads: usize) -> Self {
        self.event_delivery_threads = threads.max(1);
        self
    }

    /// Validate the configuration, spawn the workers and open the tiers.
    pub fn build(self) -> Result<Stratacache<K, V>, CacheError> {
        let pools = self
            .pools
            .ok_or_else(|| CacheError::invalid_configuration("resource pools are required"))?;
        let mut settings: Vec<(TierId, ResourceUnit, u64)> = Vec::new();
        for setting in pools.iter() {
            if setting.capacity == 0 {
                return Err(CacheError::invalid_configuration(format!(
                    "{} pool capacity must be positive",
                    setting.tier.as_str()
                )));
            }
            if settings.iter().any(|(tier, _, _)| *tier == setting.tier) {
                return Err(CacheError::invalid_configuration(format!(
                    "{} tier is declared twice",
                    setting.tier.as_str()
                )));
            }
            if setting.tier != TierId::Heap && setting.unit != ResourceUnit::Bytes {
                return Err(CacheError::invalid_configuration(format!(
                    "{} tier must be sized in bytes",
                    setting.tier.as_str()
                )));
            }
            settings.push((setting.tier, setting.unit, setting.capacity));
        }
        let heap_unit = settings
            .iter()
            .find(|(tier, _, _)| *tier == TierId::Heap)
            .map(|(_, unit, _)| *unit)
            .ok_or_else(|| CacheError::invalid_configuration("a heap pool is required"))?;
        if settings.iter().any(|(tier, _, _)| *tier == TierId::Disk)
            && self.persistence_dir.is_none()
        {
            return Err(CacheError::invalid_configuration(
                "the disk tier requires a persistence directory",
            ));
        }
        if self.write_behind.is_some() && self.loader_writer.is_none() {
            return Err(CacheError::invalid_configuration(
                "write-behind requires a loader-writer",
            ));
        }

        let accountant = Arc::new(crate::cache::accounting::PoolAccountant::new(&settings));
        let mut tiers: Vec<Box<dyn TierStore<K, V>>> = Vec::with_capacity(settings.len());
        let mut disk_idx = None;
        for (tier, _, _) in &settings {
            match tier {
                TierId::Heap => tiers.push(Box::new(HeapTier::new(
                    Arc::clone(&accountant),
                    heap_unit,
                    self.weigher.clone(),
                ))),
                TierId::OffHeap => {
                    tiers.push(Box::new(OffHeapTier::new(Arc::clone(&accountant))))
                }
                TierId::Disk => {
                    // Checked above; the disk tier never appears without a dir.
                    let Some(dir) = &self.persistence_dir else {
                        return Err(CacheError::invalid_configuration(
                            "the disk tier requires a persistence directory",
                        ));
                    };
                    disk_idx = Some(tiers.len());
                    tiers.push(Box::new(DiskTier::open(dir, Arc::clone(&accountant))?));
                }
            }
        }

        let dispatcher = EventDispatcher::new(self.event_delivery_threads.max(1))?;
        for setup in self.listeners {
            dispatcher.register(setup.listener, &setup.kinds, setup.mode, setup.ordering);
        }

        let write_behind = match (&self.write_behind, &self.loader_writer) {
            (Some(config), Some(writer)) => Some(WriteBehindQueue::new(
                config,
                Arc::clone(writer),
                self.write_behind_failure_handler.clone(),
            )?),
            _ => None,
        };

        let coordinator = StoreCoordinator::new(
            tiers,
            accountant,
            LruPolicy::new(self.veto),
            dispatcher,
            self.loader_writer,
            write_behind,
            self.ttl,
        );
        // A restored disk tier may hold more than the configured pool
        // allows; bring it back within capacity before handing it out.
        if let Some(idx) = disk_idx {
            coordinator.shrink_to_capacity(idx)?;
        }
        log::info!(
            "cache opened with {} tier(s)",
            settings.len()
        );
        Ok(Stratacache {
            inner: Arc::new(coordinator),
        })
    }
}
