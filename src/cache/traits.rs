//! Core cache traits
//!
//! Key and value bounds plus the pluggable collaborator contracts: the
//! loader-writer bridge to an external system of record and the eviction
//! veto predicate. Serialization bounds live here on purpose: a type that
//! cannot be encoded for the off-heap or disk tiers fails to satisfy the
//! builder's signature at compile time, which is where that configuration
//! error belongs.

use std::fmt::Debug;
use std::hash::Hash;

use serde::Serialize;
use serde::de::DeserializeOwned;

use super::error::CacheError;

/// Bounds required of cache keys.
///
/// Blanket-implemented; any hashable, serializable, thread-safe type
/// qualifies as a key.
pub trait CacheKey:
    Clone + Send + Sync + Debug + Hash + Eq + Serialize + DeserializeOwned + 'static
{
}

impl<T> CacheKey for T where
    T: Clone + Send + Sync + Debug + Hash + Eq + Serialize + DeserializeOwned + 'static
{
}

/// Bounds required of cache values.
pub trait CacheValue: Clone + Send + Sync + Debug + Serialize + DeserializeOwned + 'static {}

impl<T> CacheValue for T where T: Clone + Send + Sync + Debug + Serialize + DeserializeOwned + 'static {}

/// Bridge to an external system of record.
///
/// `load` runs synchronously on the calling thread when a `get` misses
/// every tier. `write`/`delete` run synchronously in write-through mode,
/// or from drain workers in batches when write-behind is configured. The
/// batch forms default to looping over the single-item forms.
pub trait CacheLoaderWriter<K, V>: Send + Sync + 'static {
    /// Load the value for `key`, or `None` if the system of record has no
    /// mapping for it.
    fn load(&self, key: &K) -> Result<Option<V>, CacheError>;

    /// Propagate a mutation for `key` to the system of record.
    fn write(&self, key: &K, value: &V) -> Result<(), CacheError>;

    /// Propagate a batch of mutations. Either the whole batch succeeds or
    /// the batch is considered failed; per-item partial success is not
    /// reported.
    fn write_all(&self, batch: &[(K, V)]) -> Result<(), CacheError> {
        for (key, value) in batch {
            self.write(key, value)?;
        }
        Ok(())
    }

    /// Propagate a removal for `key` to the system of record.
    fn delete(&self, key: &K) -> Result<(), CacheError>;

    /// Propagate a batch of removals.
    fn delete_all(&self, keys: &[K]) -> Result<(), CacheError> {
        for key in keys {
            self.delete(key)?;
        }
        Ok(())
    }
}

/// Predicate that can reject an eviction candidate.
///
/// When every candidate in a tier is vetoed the tier's capacity becomes a
/// soft bound: the incoming entry is admitted anyway and usage may exceed
/// capacity until a later mutation frees space.
pub trait EvictionVeto<K, V>: Send + Sync + 'static {
    /// Return `true` to keep `key` resident, rejecting it as a victim.
    fn vetoes(&self, key: &K, value: &V) -> bool;
}

impl<K, V, F> EvictionVeto<K, V> for F
where
    F: Fn(&K, &V) -> bool + Send + Sync + 'static,
{
    fn vetoes(&self, key: &K, value: &V) -> bool {
        self(key, value)
    }
}
