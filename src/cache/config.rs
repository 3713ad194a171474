//! Cache configuration types
//!
//! Capacity settings per tier plus the engine-level knobs (expiry,
//! write-behind, persistence, event delivery). The builder in the crate
//! facade consumes these; mutable runtime updates go through
//! `update_resource_pools`.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::accounting::ResourceUnit;
use super::tier::TierId;
use super::write_behind::WriteBehindConfig;

/// One tier's capacity setting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolSetting {
    pub tier: TierId,
    pub unit: ResourceUnit,
    pub capacity: u64,
}

/// Capacity settings for every configured tier, fastest first.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolSettings {
    pub(crate) pools: Vec<PoolSetting>,
}

impl PoolSettings {
    pub fn iter(&self) -> impl Iterator<Item = &PoolSetting> {
        self.pools.iter()
    }

    pub fn get(&self, tier: TierId) -> Option<&PoolSetting> {
        self.pools.iter().find(|p| p.tier == tier)
    }
}

/// Fluent builder for per-tier capacities.
///
/// Tiers may be declared in any order; the engine always walks them
/// heap, then off-heap, then disk.
#[derive(Debug, Clone, Default)]
pub struct ResourcePoolsBuilder {
    pools: Vec<PoolSetting>,
}

impl ResourcePoolsBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Heap tier bounded by entry count.
    pub fn heap_entries(mut self, entries: u64) -> Self {
        self.pools.push(PoolSetting {
            tier: TierId::Heap,
            unit: ResourceUnit::Entries,
            capacity: entries,
        });
        self
    }

    /// Heap tier bounded by estimated byte weight.
    pub fn heap_bytes(mut self, bytes: u64) -> Self {
        self.pools.push(PoolSetting {
            tier: TierId::Heap,
            unit: ResourceUnit::Bytes,
            capacity: bytes,
        });
        self
    }

    /// Off-heap tier bounded by encoded byte size.
    pub fn offheap_bytes(mut self, bytes: u64) -> Self {
        self.pools.push(PoolSetting {
            tier: TierId::OffHeap,
            unit: ResourceUnit::Bytes,
            capacity: bytes,
        });
        self
    }

    /// Disk tier bounded by encoded byte size. Requires a persistence
    /// directory on the cache builder.
    pub fn disk_bytes(mut self, bytes: u64) -> Self {
        self.pools.push(PoolSetting {
            tier: TierId::Disk,
            unit: ResourceUnit::Bytes,
            capacity: bytes,
        });
        self
    }

    pub fn build(mut self) -> PoolSettings {
        self.pools.sort_by_key(|p| p.tier.rank());
        PoolSettings { pools: self.pools }
    }
}

/// Engine-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    pub pools: PoolSettings,
    /// Time-to-live from entry creation; `None` disables expiry.
    pub ttl: Option<Duration>,
    /// Deferred propagation to the system of record; `None` selects
    /// synchronous write-through when a loader-writer is configured.
    pub write_behind: Option<WriteBehindConfig>,
    /// Backing directory for the disk tier.
    pub persistence_dir: Option<PathBuf>,
    /// Worker threads for asynchronous event delivery.
    pub event_delivery_threads: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            pools: ResourcePoolsBuilder::new().heap_entries(10_000).build(),
            ttl: None,
            write_behind: None,
            persistence_dir: None,
            event_delivery_threads: 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pools_sort_fastest_first() {
        let pools = ResourcePoolsBuilder::new()
            .disk_bytes(1 << 20)
            .heap_entries(10)
            .offheap_bytes(1 << 16)
            .build();
        let order: Vec<TierId> = pools.iter().map(|p| p.tier).collect();
        assert_eq!(order, vec![TierId::Heap, TierId::OffHeap, TierId::Disk]);
    }

    #[test]
    fn lookup_by_tier() {
        let pools = ResourcePoolsBuilder::new().heap_entries(7).build();
        assert_eq!(pools.get(TierId::Heap).map(|p| p.capacity), Some(7));
        assert!(pools.get(TierId::Disk).is_none());
    }
}
