//! Convenience re-exports for typical usage.

pub use crate::cache::accounting::{PoolSnapshot, ResourcePools, ResourceUnit};
pub use crate::cache::config::{CacheConfig, PoolSettings, ResourcePoolsBuilder};
pub use crate::cache::error::CacheError;
pub use crate::cache::events::{
    CacheEvent, CacheEventListener, DeliveryMode, DeliveryOrdering, EventKind, ListenerHandle,
};
pub use crate::cache::tier::TierId;
pub use crate::cache::traits::{CacheKey, CacheLoaderWriter, CacheValue, EvictionVeto};
pub use crate::cache::write_behind::{
    FailedWrite, FullQueuePolicy, WriteBehindConfig, WriteOp,
};
pub use crate::stratacache::{Stratacache, StratacacheBuilder};
