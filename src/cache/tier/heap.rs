//! Heap tier
//!
//! Fastest tier: values live on the heap in their native representation
//! inside a sharded concurrent map. Bounded by entry count or by an
//! estimated byte weight supplied through a weigher function.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;

use crate::cache::accounting::{PoolAccountant, ResourceUnit};
use crate::cache::error::CacheError;
use crate::cache::traits::{CacheKey, CacheValue};

use super::{EvictionCandidate, PutMode, Removed, TierHit, TierId, TierStore, next_tick};

/// Byte-weight estimator for heap entries when the pool unit is bytes.
pub type Weigher<K, V> = Arc<dyn Fn(&K, &V) -> usize + Send + Sync>;

struct HeapEntry<V> {
    value: V,
    created_at: u64,
    last_access: AtomicU64,
    insert_seq: u64,
    cost: u64,
}

/// In-memory tier holding native values.
pub struct HeapTier<K, V> {
    map: DashMap<K, HeapEntry<V>>,
    accountant: Arc<PoolAccountant>,
    unit: ResourceUnit,
    weigher: Option<Weigher<K, V>>,
}

impl<K: CacheKey, V: CacheValue> HeapTier<K, V> {
    pub fn new(
        accountant: Arc<PoolAccountant>,
        unit: ResourceUnit,
        weigher: Option<Weigher<K, V>>,
    ) -> Self {
        Self {
            map: DashMap::new(),
            accountant,
            unit,
            weigher,
        }
    }

    fn cost(&self, key: &K, value: &V) -> u64 {
        match self.unit {
            ResourceUnit::Entries => 1,
            ResourceUnit::Bytes => match &self.weigher {
                Some(weigher) => weigher(key, value) as u64,
                None => (std::mem::size_of::<K>() + std::mem::size_of::<V>()) as u64,
            },
        }
    }
}

impl<K: CacheKey, V: CacheValue> TierStore<K, V> for HeapTier<K, V> {
    fn id(&self) -> TierId {
        TierId::Heap
    }

    fn get(&self, key: &K) -> Result<Option<TierHit<V>>, CacheError> {
        Ok(self.map.get(key).map(|entry| {
            entry.last_access.store(next_tick(), Ordering::Relaxed);
            TierHit {
                value: entry.value.clone(),
                created_at: entry.created_at,
            }
        }))
    }

    fn peek(&self, key: &K) -> Result<Option<V>, CacheError> {
        Ok(self.map.get(key).map(|entry| entry.value.clone()))
    }

    fn put(
        &self,
        key: K,
        value: V,
        created_at: u64,
        mode: PutMode,
    ) -> Result<Option<V>, CacheError> {
        let cost = self.cost(&key, &value);
        match self.map.entry(key) {
            Entry::Occupied(mut occupied) => {
                let old_cost = occupied.get().cost;
                if cost > old_cost {
                    let delta = cost - old_cost;
                    match mode {
                        PutMode::Admit => {
                            if !self.accountant.try_reserve(TierId::Heap, delta) {
                                return Err(CacheError::admission_denied(TierId::Heap.as_str()));
                            }
                        }
                        PutMode::Force => self.accountant.force_reserve(TierId::Heap, delta),
                    }
                } else {
                    self.accountant.release(TierId::Heap, old_cost - cost);
                }
                let tick = next_tick();
                let previous = std::mem::replace(
                    occupied.get_mut(),
                    HeapEntry {
                        value,
                        created_at,
                        last_access: AtomicU64::new(tick),
                        insert_seq: tick,
                        cost,
                    },
                );
                Ok(Some(previous.value))
            }
            Entry::Vacant(vacant) => {
                match mode {
                    PutMode::Admit => {
                        if !self.accountant.try_reserve(TierId::Heap, cost) {
                            return Err(CacheError::admission_denied(TierId::Heap.as_str()));
                        }
                    }
                    PutMode::Force => self.accountant.force_reserve(TierId::Heap, cost),
                }
                let tick = next_tick();
                vacant.insert(HeapEntry {
                    value,
                    created_at,
                    last_access: AtomicU64::new(tick),
                    insert_seq: tick,
                    cost,
                });
                Ok(None)
            }
        }
    }

    fn remove(&self, key: &K) -> Result<Option<Removed<V>>, CacheError> {
        Ok(self.map.remove(key).map(|(_, entry)| {
            self.accountant.release(TierId::Heap, entry.cost);
            Removed {
                value: entry.value,
                created_at: entry.created_at,
            }
        }))
    }

    fn contains(&self, key: &K) -> bool {
        self.map.contains_key(key)
    }

    fn created_at(&self, key: &K) -> Option<u64> {
        self.map.get(key).map(|entry| entry.created_at)
    }

    fn candidates(&self) -> Vec<EvictionCandidate<K>> {
        self.map
            .iter()
            .map(|entry| EvictionCandidate {
                key: entry.key().clone(),
                last_access: entry.last_access.load(Ordering::Relaxed),
                insert_seq: entry.insert_seq,
            })
            .collect()
    }

    fn len(&self) -> usize {
        self.map.len()
    }

    fn clear(&self) {
        let mut released = 0u64;
        self.map.retain(|_, entry| {
            released += entry.cost;
            false
        });
        self.accountant.release(TierId::Heap, released);
    }
}
