//! Store coordinator
//!
//! Orchestrates every operation across the tier stack: the hit lookup
//! walks tiers fastest to slowest and promotes hits toward the heap
//! tier; writes land in the fastest tier that admits them, displacing
//! colder entries downward; eviction out of the slowest tier is the
//! point where an entry leaves the cache and the EVICTED event fires.
//!
//! Promotion and demotion are two-step moves: the destination write
//! commits before the source copy is dropped, so a concurrent read may
//! transiently see an entry in two tiers but never in none while it
//! logically exists.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use super::accounting::{PoolAccountant, ResourcePools};
use super::config::PoolSettings;
use super::error::CacheError;
use super::events::{
    CacheEvent, CacheEventListener, DeliveryMode, DeliveryOrdering, EventDispatcher, EventKind,
    ListenerHandle,
};
use super::eviction::{LruPolicy, VictimOutcome};
use super::tier::{PutMode, TierStore, now_nanos};
use super::traits::{CacheKey, CacheLoaderWriter, CacheValue};
use super::write_behind::{WriteBehindQueue, WriteOp};

struct PutOutcome<V> {
    tier_idx: usize,
    previous: Option<V>,
}

/// Cross-tier orchestration for one cache instance.
pub(crate) struct StoreCoordinator<K: CacheKey, V: CacheValue> {
    tiers: Vec<Box<dyn TierStore<K, V>>>,
    accountant: Arc<PoolAccountant>,
    policy: LruPolicy<K, V>,
    dispatcher: EventDispatcher<K, V>,
    loader_writer: Option<Arc<dyn CacheLoaderWriter<K, V>>>,
    write_behind: Option<WriteBehindQueue<K, V>>,
    ttl: Option<Duration>,
    closed: AtomicBool,
}

impl<K: CacheKey, V: CacheValue> StoreCoordinator<K, V> {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        tiers: Vec<Box<dyn TierStore<K, V>>>,
        accountant: Arc<PoolAccountant>,
        policy: LruPolicy<K, V>,
        dispatcher: EventDispatcher<K, V>,
        loader_writer: Option<Arc<dyn CacheLoaderWriter<K, V>>>,
        write_behind: Option<WriteBehindQueue<K, V>>,
        ttl: Option<Duration>,
    ) -> Self {
        Self {
            tiers,
            accountant,
            policy,
            dispatcher,
            loader_writer,
            write_behind,
            ttl,
            closed: AtomicBool::new(false),
        }
    }

    fn ensure_open(&self) -> Result<(), CacheError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(CacheError::CacheClosed);
        }
        Ok(())
    }

    fn expired(&self, created_at: u64) -> bool {
        match self.ttl {
            Some(ttl) => now_nanos().saturating_sub(created_at) >= ttl.as_nanos() as u64,
            None => false,
        }
    }

    fn emit(&self, kind: EventKind, key: K, old_value: Option<V>, new_value: Option<V>) {
        if !self.dispatcher.wants(kind) {
            return;
        }
        self.dispatcher.dispatch(CacheEvent {
            kind,
            key,
            old_value,
            new_value,
        });
    }

    /// Tiered lookup: walk fastest to slowest, promote hits, fall back to
    /// the loader on a total miss.
    pub(crate) fn get(&self, key: &K) -> Result<Option<V>, CacheError> {
        self.ensure_open()?;
        for idx in 0..self.tiers.len() {
            let Some(hit) = self.tiers[idx].get(key)? else {
                continue;
            };
            if self.expired(hit.created_at) {
                self.expire_entry(idx, key)?;
                continue;
            }
            if idx > 0 {
                self.promote(key, &hit.value, hit.created_at, idx);
            }
            return Ok(Some(hit.value));
        }
        if let Some(loader) = &self.loader_writer {
            let loaded = loader.load(key).map_err(|err| match err {
                CacheError::LoaderFailure(_) => err,
                other => CacheError::loader(other.to_string()),
            })?;
            if let Some(value) = loaded {
                // Population failure must not fail the read; the value
                // was loaded successfully.
                if let Err(err) = self.admit_into(0, key.clone(), value.clone(), now_nanos()) {
                    log::debug!("loaded value not cached: {}", err);
                }
                return Ok(Some(value));
            }
        }
        Ok(None)
    }

    fn expire_entry(&self, tier_idx: usize, key: &K) -> Result<(), CacheError> {
        if let Some(removed) = self.tiers[tier_idx].remove(key)? {
            log::debug!("expired entry dropped from {} tier", self.tiers[tier_idx].id().as_str());
            self.emit(EventKind::Expired, key.clone(), Some(removed.value), None);
        }
        Ok(())
    }

    /// Copy a slower-tier hit into the heap tier, then drop the slower
    /// copies. The destination write commits first; on failure the
    /// source copy stays authoritative.
    fn promote(&self, key: &K, value: &V, created_at: u64, source_idx: usize) {
        match self.admit_into(0, key.clone(), value.clone(), created_at) {
            Ok(outcome) => {
                // Admission may have fallen through to a slower tier; that
                // tier now holds the authoritative copy and must be spared.
                for idx in 1..self.tiers.len() {
                    if idx == outcome.tier_idx {
                        continue;
                    }
                    if let Err(err) = self.tiers[idx].remove(key) {
                        log::warn!(
                            "failed to drop {} tier copy after promotion: {}",
                            self.tiers[idx].id().as_str(),
                            err
                        );
                    }
                }
            }
            Err(err) => {
                log::debug!(
                    "promotion from {} tier skipped: {}",
                    self.tiers[source_idx].id().as_str(),
                    err
                );
            }
        }
    }

    /// Admission machinery shared by put, promotion and demotion.
    ///
    /// Denial triggers one eviction attempt and a single retry. A second
    /// denial falls through to the next slower tier; without one the
    /// operation fails. When every candidate is vetoed the entry is
    /// force-admitted and the tier's capacity becomes a soft bound.
    fn admit_into(
        &self,
        tier_idx: usize,
        key: K,
        value: V,
        created_at: u64,
    ) -> Result<PutOutcome<V>, CacheError> {
        let tier = &self.tiers[tier_idx];
        match tier.put(key.clone(), value.clone(), created_at, PutMode::Admit) {
            Ok(previous) => Ok(PutOutcome { tier_idx, previous }),
            Err(CacheError::AdmissionDenied { .. }) => {
                match self.policy.select_victim(tier.as_ref())? {
                    VictimOutcome::Victim(victim) => {
                        self.displace(tier_idx, &victim)?;
                        match tier.put(key.clone(), value.clone(), created_at, PutMode::Admit) {
                            Ok(previous) => Ok(PutOutcome { tier_idx, previous }),
                            Err(CacheError::AdmissionDenied { .. }) => {
                                self.fall_through(tier_idx, key, value, created_at)
                            }
                            Err(err) => Err(err),
                        }
                    }
                    VictimOutcome::AllVetoed => {
                        log::debug!(
                            "all eviction candidates vetoed in {} tier; admitting past capacity",
                            tier.id().as_str()
                        );
                        let previous = tier.put(key, value, created_at, PutMode::Force)?;
                        Ok(PutOutcome { tier_idx, previous })
                    }
                    VictimOutcome::NoCandidates => self.fall_through(tier_idx, key, value, created_at),
                }
            }
            Err(err) => Err(err),
        }
    }

    fn fall_through(
        &self,
        tier_idx: usize,
        key: K,
        value: V,
        created_at: u64,
    ) -> Result<PutOutcome<V>, CacheError> {
        if tier_idx + 1 < self.tiers.len() {
            self.admit_into(tier_idx + 1, key, value, created_at)
        } else {
            Err(CacheError::admission_denied(self.tiers[tier_idx].id().as_str()))
        }
    }

    /// Remove a victim from its tier and demote it to the next slower
    /// tier, or evict it from the cache when none exists. EVICTED fires
    /// only when the entry leaves the cache entirely.
    fn displace(&self, tier_idx: usize, victim: &K) -> Result<(), CacheError> {
        let Some(removed) = self.tiers[tier_idx].remove(victim)? else {
            // Lost a race with a concurrent remove; nothing to displace.
            return Ok(());
        };
        if tier_idx + 1 < self.tiers.len() {
            log::debug!(
                "demoting victim from {} tier to {} tier",
                self.tiers[tier_idx].id().as_str(),
                self.tiers[tier_idx + 1].id().as_str()
            );
            let value_for_event = removed.value.clone();
            match self.admit_into(tier_idx + 1, victim.clone(), removed.value, removed.created_at)
            {
                Ok(_) => {}
                Err(err) => {
                    log::warn!("demotion failed, evicting instead: {}", err);
                    self.emit(EventKind::Evicted, victim.clone(), Some(value_for_event), None);
                }
            }
        } else {
            self.emit(EventKind::Evicted, victim.clone(), Some(removed.value), None);
        }
        Ok(())
    }

    /// Write into the fastest tier that admits the entry, drop
    /// superseded copies elsewhere, notify, and propagate to the system
    /// of record.
    ///
    /// A write-through failure propagates to the caller but the local
    /// write is not rolled back; the tiers keep the new value.
    pub(crate) fn put(&self, key: K, value: V) -> Result<Option<V>, CacheError> {
        self.ensure_open()?;
        let created_at = now_nanos();
        let outcome = self.admit_into(0, key.clone(), value.clone(), created_at)?;
        let mut previous = outcome.previous;
        for (idx, tier) in self.tiers.iter().enumerate() {
            if idx == outcome.tier_idx {
                continue;
            }
            if let Some(removed) = tier.remove(&key)? {
                if previous.is_none() {
                    previous = Some(removed.value);
                }
            }
        }
        let kind = if previous.is_some() {
            EventKind::Updated
        } else {
            EventKind::Created
        };
        self.emit(kind, key.clone(), previous.clone(), Some(value.clone()));
        self.propagate_write(key, value)?;
        Ok(previous)
    }

    fn propagate_write(&self, key: K, value: V) -> Result<(), CacheError> {
        if let Some(queue) = &self.write_behind {
            queue.enqueue(key, WriteOp::Write(value))
        } else if let Some(writer) = &self.loader_writer {
            writer
                .write(&key, &value)
                .map_err(|err| CacheError::write_through(err.to_string()))
        } else {
            Ok(())
        }
    }

    /// Remove from every tier holding the key and propagate the removal.
    pub(crate) fn remove(&self, key: &K) -> Result<Option<V>, CacheError> {
        self.ensure_open()?;
        let mut previous = None;
        for tier in &self.tiers {
            if let Some(removed) = tier.remove(key)? {
                if previous.is_none() {
                    previous = Some(removed.value);
                }
            }
        }
        if previous.is_some() {
            self.emit(EventKind::Removed, key.clone(), previous.clone(), None);
        }
        // The system of record may hold the key even when no tier did.
        if let Some(queue) = &self.write_behind {
            queue.enqueue(key.clone(), WriteOp::Delete)?;
        } else if let Some(writer) = &self.loader_writer {
            writer
                .delete(key)
                .map_err(|err| CacheError::write_through(err.to_string()))?;
        }
        Ok(previous)
    }

    /// Drop every entry from every tier. Fires no per-key events and
    /// makes no loader-writer calls.
    pub(crate) fn clear(&self) -> Result<(), CacheError> {
        self.ensure_open()?;
        for tier in &self.tiers {
            tier.clear();
        }
        Ok(())
    }

    pub(crate) fn contains_key(&self, key: &K) -> Result<bool, CacheError> {
        self.ensure_open()?;
        for idx in 0..self.tiers.len() {
            if self.tiers[idx].contains(key) {
                if let Some(created_at) = self.tiers[idx].created_at(key) {
                    if self.expired(created_at) {
                        // Reclaim the dead entry's capacity now rather than
                        // waiting for a get to touch it.
                        self.expire_entry(idx, key)?;
                        continue;
                    }
                }
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Resident entry count, summed over tiers. Momentarily double-counts
    /// a key mid-promotion.
    pub(crate) fn len(&self) -> usize {
        self.tiers.iter().map(|tier| tier.len()).sum()
    }

    pub(crate) fn resource_pools(&self) -> ResourcePools {
        self.accountant.snapshot()
    }

    /// Atomically swap pool capacities, then shrink any tier whose usage
    /// now exceeds capacity before returning.
    pub(crate) fn update_resource_pools(&self, pools: &PoolSettings) -> Result<(), CacheError> {
        self.ensure_open()?;
        for setting in pools.iter() {
            let Some(unit) = self.accountant.unit(setting.tier) else {
                return Err(CacheError::invalid_configuration(format!(
                    "tier {} is not configured on this cache",
                    setting.tier.as_str()
                )));
            };
            if unit != setting.unit {
                return Err(CacheError::invalid_configuration(format!(
                    "tier {} is sized in {}, not {}",
                    setting.tier.as_str(),
                    unit.as_str(),
                    setting.unit.as_str()
                )));
            }
            if setting.capacity == 0 {
                return Err(CacheError::invalid_configuration(
                    "pool capacity must be positive",
                ));
            }
        }
        for setting in pools.iter() {
            log::debug!(
                "resizing {} tier pool to {} {}",
                setting.tier.as_str(),
                setting.capacity,
                setting.unit.as_str()
            );
            self.accountant.set_capacity(setting.tier, setting.capacity);
        }
        for idx in 0..self.tiers.len() {
            self.shrink_to_capacity(idx)?;
        }
        Ok(())
    }

    /// Evict/demote until usage fits capacity. Veto-all stops the shrink
    /// (soft bound), as does an empty tier.
    pub(crate) fn shrink_to_capacity(&self, tier_idx: usize) -> Result<(), CacheError> {
        let tier_id = self.tiers[tier_idx].id();
        while self.accountant.usage(tier_id) > self.accountant.capacity(tier_id) {
            match self.policy.select_victim(self.tiers[tier_idx].as_ref())? {
                VictimOutcome::Victim(victim) => self.displace(tier_idx, &victim)?,
                VictimOutcome::AllVetoed => {
                    log::debug!(
                        "shrink of {} tier stopped: all candidates vetoed",
                        tier_id.as_str()
                    );
                    break;
                }
                VictimOutcome::NoCandidates => break,
            }
        }
        Ok(())
    }

    pub(crate) fn register_listener(
        &self,
        listener: Arc<dyn CacheEventListener<K, V>>,
        kinds: &[EventKind],
        mode: DeliveryMode,
        ordering: DeliveryOrdering,
    ) -> ListenerHandle {
        self.dispatcher.register(listener, kinds, mode, ordering)
    }

    pub(crate) fn deregister_listener(&self, handle: ListenerHandle) -> bool {
        self.dispatcher.deregister(handle)
    }

    /// Block until the write-behind queue is fully dispatched.
    pub(crate) fn flush(&self) -> Result<(), CacheError> {
        self.ensure_open()?;
        if let Some(queue) = &self.write_behind {
            queue.flush();
        }
        Ok(())
    }

    /// Drain-then-stop shutdown. In-flight synchronous calls complete;
    /// calls arriving after this fail fast with `CacheClosed`.
    pub(crate) fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        log::debug!("closing cache: draining write-behind and event delivery workers");
        if let Some(queue) = &self.write_behind {
            queue.close();
        }
        self.dispatcher.shutdown();
    }
}

impl<K: CacheKey, V: CacheValue> Drop for StoreCoordinator<K, V> {
    fn drop(&mut self) {
        if !self.closed.load(Ordering::Acquire) {
            if let Some(queue) = &self.write_behind {
                queue.close();
            }
            self.dispatcher.shutdown();
        }
    }
}
