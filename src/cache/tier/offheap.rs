//! Off-heap tier
//!
//! Middle tier: values are held bincode-encoded, so resident entries cost
//! exactly their encoded length and the pool is byte-bounded. Keys stay
//! native for map lookup; only values pass through the codec.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;

use crate::cache::accounting::PoolAccountant;
use crate::cache::codec;
use crate::cache::error::CacheError;
use crate::cache::traits::{CacheKey, CacheValue};

use super::{EvictionCandidate, PutMode, Removed, TierHit, TierId, TierStore, next_tick};

struct SealedEntry {
    bytes: Box<[u8]>,
    created_at: u64,
    last_access: AtomicU64,
    insert_seq: u64,
    cost: u64,
}

/// Serialized in-memory tier.
pub struct OffHeapTier<K, V> {
    map: DashMap<K, SealedEntry>,
    accountant: Arc<PoolAccountant>,
    _value: std::marker::PhantomData<fn() -> V>,
}

impl<K: CacheKey, V: CacheValue> OffHeapTier<K, V> {
    pub fn new(accountant: Arc<PoolAccountant>) -> Self {
        Self {
            map: DashMap::new(),
            accountant,
            _value: std::marker::PhantomData,
        }
    }
}

impl<K: CacheKey, V: CacheValue> TierStore<K, V> for OffHeapTier<K, V> {
    fn id(&self) -> TierId {
        TierId::OffHeap
    }

    fn get(&self, key: &K) -> Result<Option<TierHit<V>>, CacheError> {
        match self.map.get(key) {
            Some(entry) => {
                let value = codec::decode(&entry.bytes)?;
                entry.last_access.store(next_tick(), Ordering::Relaxed);
                Ok(Some(TierHit {
                    value,
                    created_at: entry.created_at,
                }))
            }
            None => Ok(None),
        }
    }

    fn peek(&self, key: &K) -> Result<Option<V>, CacheError> {
        match self.map.get(key) {
            Some(entry) => Ok(Some(codec::decode(&entry.bytes)?)),
            None => Ok(None),
        }
    }

    fn put(
        &self,
        key: K,
        value: V,
        created_at: u64,
        mode: PutMode,
    ) -> Result<Option<V>, CacheError> {
        let bytes = codec::encode(&value)?.into_boxed_slice();
        let cost = bytes.len() as u64;
        match self.map.entry(key) {
            Entry::Occupied(mut occupied) => {
                let old_cost = occupied.get().cost;
                if cost > old_cost {
                    let delta = cost - old_cost;
                    match mode {
                        PutMode::Admit => {
                            if !self.accountant.try_reserve(TierId::OffHeap, delta) {
                                return Err(CacheError::admission_denied(TierId::OffHeap.as_str()));
                            }
                        }
                        PutMode::Force => self.accountant.force_reserve(TierId::OffHeap, delta),
                    }
                } else {
                    self.accountant.release(TierId::OffHeap, old_cost - cost);
                }
                let tick = next_tick();
                let previous = std::mem::replace(
                    occupied.get_mut(),
                    SealedEntry {
                        bytes,
                        created_at,
                        last_access: AtomicU64::new(tick),
                        insert_seq: tick,
                        cost,
                    },
                );
                Ok(Some(codec::decode(&previous.bytes)?))
            }
            Entry::Vacant(vacant) => {
                match mode {
                    PutMode::Admit => {
                        if !self.accountant.try_reserve(TierId::OffHeap, cost) {
                            return Err(CacheError::admission_denied(TierId::OffHeap.as_str()));
                        }
                    }
                    PutMode::Force => self.accountant.force_reserve(TierId::OffHeap, cost),
                }
                let tick = next_tick();
                vacant.insert(SealedEntry {
                    bytes,
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
        match self.map.remove(key) {
            Some((_, entry)) => {
                self.accountant.release(TierId::OffHeap, entry.cost);
                Ok(Some(Removed {
                    value: codec::decode(&entry.bytes)?,
                    created_at: entry.created_at,
                }))
            }
            None => Ok(None),
        }
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
        self.accountant.release(TierId::OffHeap, released);
    }
}
