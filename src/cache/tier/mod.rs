//! Storage tiers
//!
//! The engine spans a closed set of tier variants behind one capability
//! interface: a fast heap tier, a serialized off-heap tier and a
//! persistent disk tier. Each tier enforces its own admission against the
//! shared accountant and provides the candidate metadata the eviction
//! policy selects victims from.
//!
//! Per-key mutation within a tier is atomic: every variant keys its
//! storage through a sharded concurrent map, so unrelated keys never
//! contend on a cache-wide lock.

pub mod disk;
pub mod heap;
pub mod offheap;

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use super::error::CacheError;

/// Identity of one storage tier, fastest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TierId {
    Heap,
    OffHeap,
    Disk,
}

impl TierId {
    pub fn as_str(&self) -> &'static str {
        match self {
            TierId::Heap => "heap",
            TierId::OffHeap => "offheap",
            TierId::Disk => "disk",
        }
    }

    /// Walk order rank; lower is faster.
    pub fn rank(&self) -> usize {
        match self {
            TierId::Heap => 0,
            TierId::OffHeap => 1,
            TierId::Disk => 2,
        }
    }
}

static ACCESS_CLOCK: AtomicU64 = AtomicU64::new(1);

/// Next tick of the process-wide logical clock. Recency metadata uses
/// this rather than wall time so LRU ordering is total and deterministic.
pub(crate) fn next_tick() -> u64 {
    ACCESS_CLOCK.fetch_add(1, Ordering::Relaxed)
}

/// Wall-clock nanoseconds since the Unix epoch, used for entry creation
/// times and expiry checks. Wall time (not a process-relative instant) so
/// that disk-tier entries restored after a restart age correctly.
pub(crate) fn now_nanos() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0)
}

/// Admission behavior for a tier write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutMode {
    /// Reserve capacity first; fail with `AdmissionDenied` when the pool
    /// is full.
    Admit,
    /// Reserve unconditionally (veto-all soft bound).
    Force,
}

/// A tier hit, carrying the creation time the coordinator needs for
/// expiry checks and cross-tier moves.
#[derive(Debug, Clone)]
pub struct TierHit<V> {
    pub value: V,
    pub created_at: u64,
}

/// An entry removed from a tier, preserving metadata for demotion.
#[derive(Debug, Clone)]
pub struct Removed<V> {
    pub value: V,
    pub created_at: u64,
}

/// Recency metadata for one eviction candidate.
#[derive(Debug, Clone)]
pub struct EvictionCandidate<K> {
    pub key: K,
    /// Last-access tick of the logical clock.
    pub last_access: u64,
    /// Insertion tick; the documented deterministic tie-break.
    pub insert_seq: u64,
}

/// Capability interface shared by all tier variants.
///
/// `get` refreshes recency metadata; `peek` does not and exists for veto
/// checks and stale-copy scans. `put` returns the previous value when the
/// key was already resident in this tier.
pub trait TierStore<K, V>: Send + Sync {
    fn id(&self) -> TierId;

    fn get(&self, key: &K) -> Result<Option<TierHit<V>>, CacheError>;

    fn peek(&self, key: &K) -> Result<Option<V>, CacheError>;

    fn put(&self, key: K, value: V, created_at: u64, mode: PutMode)
        -> Result<Option<V>, CacheError>;

    fn remove(&self, key: &K) -> Result<Option<Removed<V>>, CacheError>;

    fn contains(&self, key: &K) -> bool;

    /// Creation time of the resident entry, if any. Does not touch
    /// recency.
    fn created_at(&self, key: &K) -> Option<u64>;

    /// Recency metadata for every resident entry. The policy consumes
    /// this in one overflow resolution; tiers do not retain it.
    fn candidates(&self) -> Vec<EvictionCandidate<K>>;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every entry and release all reserved capacity.
    fn clear(&self);
}
