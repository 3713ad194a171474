//! Per-tier capacity accounting
//!
//! Each tier owns one resource pool and accounts only against it; no
//! cross-tier lock exists. Reservation is a CAS loop over cache-padded
//! atomics, so concurrent reservations and releases from independent
//! tiers never contend on shared state.

use std::sync::atomic::{AtomicU64, Ordering};

use crossbeam_utils::CachePadded;
use serde::{Deserialize, Serialize};

use super::tier::TierId;

/// Unit a resource pool is measured in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResourceUnit {
    /// Capacity counted in entries.
    Entries,
    /// Capacity counted in bytes.
    Bytes,
}

impl ResourceUnit {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceUnit::Entries => "entries",
            ResourceUnit::Bytes => "bytes",
        }
    }
}

/// Point-in-time view of one tier's pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolSnapshot {
    pub tier: TierId,
    pub unit: ResourceUnit,
    pub capacity: u64,
    pub usage: u64,
}

/// Read-only snapshot of all configured pools.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourcePools {
    pools: Vec<PoolSnapshot>,
}

impl ResourcePools {
    /// Snapshot for one tier, if that tier was configured.
    pub fn pool(&self, tier: TierId) -> Option<&PoolSnapshot> {
        self.pools.iter().find(|p| p.tier == tier)
    }

    /// All pool snapshots, fastest tier first.
    pub fn iter(&self) -> impl Iterator<Item = &PoolSnapshot> {
        self.pools.iter()
    }
}

struct PoolCell {
    tier: TierId,
    unit: ResourceUnit,
    capacity: CachePadded<AtomicU64>,
    usage: CachePadded<AtomicU64>,
}

/// Live capacity/usage accounting for every configured tier.
pub struct PoolAccountant {
    cells: Vec<PoolCell>,
}

impl PoolAccountant {
    /// Build an accountant from `(tier, unit, capacity)` pool settings,
    /// fastest tier first.
    pub fn new(pools: &[(TierId, ResourceUnit, u64)]) -> Self {
        let cells = pools
            .iter()
            .map(|&(tier, unit, capacity)| PoolCell {
                tier,
                unit,
                capacity: CachePadded::new(AtomicU64::new(capacity)),
                usage: CachePadded::new(AtomicU64::new(0)),
            })
            .collect();
        Self { cells }
    }

    fn cell(&self, tier: TierId) -> Option<&PoolCell> {
        self.cells.iter().find(|c| c.tier == tier)
    }

    /// Try to reserve `cost` units in `tier`. Returns `false` when the
    /// reservation would push usage past capacity.
    pub fn try_reserve(&self, tier: TierId, cost: u64) -> bool {
        let Some(cell) = self.cell(tier) else {
            return false;
        };
        let mut current = cell.usage.load(Ordering::Acquire);
        loop {
            let capacity = cell.capacity.load(Ordering::Acquire);
            let Some(next) = current.checked_add(cost) else {
                return false;
            };
            if next > capacity {
                return false;
            }
            match cell
                .usage
                .compare_exchange_weak(current, next, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return true,
                Err(observed) => current = observed,
            }
        }
    }

    /// Reserve `cost` units unconditionally. Used for the veto-all soft
    /// bound and for re-indexing a persistent tier on open; usage may
    /// exceed capacity afterwards.
    pub fn force_reserve(&self, tier: TierId, cost: u64) {
        if let Some(cell) = self.cell(tier) {
            cell.usage.fetch_add(cost, Ordering::AcqRel);
        }
    }

    /// Release `cost` units back to `tier`, saturating at zero.
    pub fn release(&self, tier: TierId, cost: u64) {
        if let Some(cell) = self.cell(tier) {
            let mut current = cell.usage.load(Ordering::Acquire);
            loop {
                let next = current.saturating_sub(cost);
                match cell
                    .usage
                    .compare_exchange_weak(current, next, Ordering::AcqRel, Ordering::Acquire)
                {
                    Ok(_) => return,
                    Err(observed) => current = observed,
                }
            }
        }
    }

    /// Swap in a new capacity for `tier`, effective for all subsequent
    /// admission decisions.
    pub fn set_capacity(&self, tier: TierId, capacity: u64) {
        if let Some(cell) = self.cell(tier) {
            cell.capacity.store(capacity, Ordering::Release);
        }
    }

    pub fn usage(&self, tier: TierId) -> u64 {
        self.cell(tier)
            .map(|c| c.usage.load(Ordering::Acquire))
            .unwrap_or(0)
    }

    pub fn capacity(&self, tier: TierId) -> u64 {
        self.cell(tier)
            .map(|c| c.capacity.load(Ordering::Acquire))
            .unwrap_or(0)
    }

    pub fn unit(&self, tier: TierId) -> Option<ResourceUnit> {
        self.cell(tier).map(|c| c.unit)
    }

    /// Configured tiers, fastest first.
    pub fn tiers(&self) -> Vec<TierId> {
        self.cells.iter().map(|c| c.tier).collect()
    }

    pub fn snapshot(&self) -> ResourcePools {
        ResourcePools {
            pools: self
                .cells
                .iter()
                .map(|c| PoolSnapshot {
                    tier: c.tier,
                    unit: c.unit,
                    capacity: c.capacity.load(Ordering::Acquire),
                    usage: c.usage.load(Ordering::Acquire),
                })
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn heap_only(capacity: u64) -> PoolAccountant {
        PoolAccountant::new(&[(TierId::Heap, ResourceUnit::Entries, capacity)])
    }

    #[test]
    fn reserve_up_to_capacity_then_deny() {
        let acct = heap_only(2);
        assert!(acct.try_reserve(TierId::Heap, 1));
        assert!(acct.try_reserve(TierId::Heap, 1));
        assert!(!acct.try_reserve(TierId::Heap, 1));
        assert_eq!(acct.usage(TierId::Heap), 2);
    }

    #[test]
    fn release_makes_room_again() {
        let acct = heap_only(1);
        assert!(acct.try_reserve(TierId::Heap, 1));
        acct.release(TierId::Heap, 1);
        assert!(acct.try_reserve(TierId::Heap, 1));
    }

    #[test]
    fn release_saturates_at_zero() {
        let acct = heap_only(5);
        acct.release(TierId::Heap, 3);
        assert_eq!(acct.usage(TierId::Heap), 0);
    }

    #[test]
    fn force_reserve_overshoots() {
        let acct = heap_only(1);
        assert!(acct.try_reserve(TierId::Heap, 1));
        acct.force_reserve(TierId::Heap, 1);
        assert_eq!(acct.usage(TierId::Heap), 2);
        assert!(acct.usage(TierId::Heap) > acct.capacity(TierId::Heap));
    }

    #[test]
    fn capacity_resize_affects_subsequent_reservations() {
        let acct = heap_only(1);
        assert!(acct.try_reserve(TierId::Heap, 1));
        acct.set_capacity(TierId::Heap, 4);
        assert!(acct.try_reserve(TierId::Heap, 3));
        assert!(!acct.try_reserve(TierId::Heap, 1));
    }

    #[test]
    fn unknown_tier_denies() {
        let acct = heap_only(10);
        assert!(!acct.try_reserve(TierId::Disk, 1));
        assert_eq!(acct.usage(TierId::Disk), 0);
    }
}
