//! Stratacache: a multi-tier in-process cache.
//!
//! Entries live in up to three tiers ordered by access speed: an
//! on-heap map of native values, an off-heap tier of serialized bytes,
//! and a persistent disk tier. Reads walk the tiers fastest first and
//! promote hits toward the heap; writes land in the fastest tier with
//! room, displacing colder entries downward. An entry only leaves the
//! cache, and only fires an eviction event, when it falls off the
//! slowest tier.
//!
//! Optional layers: time-to-live expiry, a loader-writer bridging a
//! system of record (read-through plus write-through or batched
//! write-behind), eviction vetoes, and lifecycle event listeners with
//! synchronous or asynchronous delivery.
//!
//! ```no_run
//! use std::sync::Arc;
//! use stratacache::prelude::*;
//!
//! # fn main() -> Result<(), CacheError> {
//! let cache: Stratacache<u64, String> = Stratacache::builder()
//!     .resource_pools(
//!         ResourcePoolsBuilder::new()
//!             .heap_entries(1_000)
//!             .offheap_bytes(8 << 20)
//!             .build(),
//!     )
//!     .build()?;
//! cache.put(1, "one".to_string())?;
//! assert_eq!(cache.get(&1)?, Some("one".to_string()));
//! # Ok(())
//! # }
//! ```

pub mod cache;
pub mod prelude;
pub mod stratacache;

pub use crate::cache::accounting::{PoolSnapshot, ResourcePools, ResourceUnit};
pub use crate::cache::config::{CacheConfig, PoolSetting, PoolSettings, ResourcePoolsBuilder};
pub use crate::cache::error::CacheError;
pub use crate::cache::events::{
    CacheEvent, CacheEventListener, DeliveryMode, DeliveryOrdering, EventKind, ListenerHandle,
};
pub use crate::cache::tier::TierId;
pub use crate::cache::tier::heap::Weigher;
pub use crate::cache::traits::{CacheKey, CacheLoaderWriter, CacheValue, EvictionVeto};
pub use crate::cache::write_behind::{
    FailedWrite, FullQueuePolicy, WriteBehindConfig, WriteBehindFailureHandler, WriteOp,
};
pub use crate::stratacache::{Stratacache, StratacacheBuilder};
