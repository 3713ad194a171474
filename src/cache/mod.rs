//! Core cache engine modules.
//!
//! `coordinator` ties the tier stack, eviction policy, event dispatch
//! and write propagation together; everything else is a building block
//! it composes. The public construction surface lives in the crate-root
//! facade.

pub mod accounting;
pub mod codec;
pub mod config;
pub(crate) mod coordinator;
pub mod error;
pub mod events;
pub(crate) mod eviction;
pub mod tier;
pub mod traits;
pub mod write_behind;
