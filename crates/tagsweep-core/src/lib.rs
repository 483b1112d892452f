//! # tagsweep-core
//!
//! Tag-based invalidation for a multi-backend cache layer.
//!
//! Cached items carry an optional list of `cacheTags`. Callers ask for every
//! item sharing a tag to be evicted; rather than scanning every backend per
//! request, the [`InvalidationScheduler`] buffers tags and runs one sweep per
//! debounce window.
//!
//! ```text
//! add(tags) ──► TagSet (dedup) ──► window timer ──► sweep::execute
//!                                                    │
//!                          ┌─────────────────────────┼──────────────┐
//!                          ▼                         ▼              ▼
//!                     CacheBackend              CacheBackend   CacheBackend
//!                 list / get / delete           (tag index)        ...
//! ```
//!
//! ## Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use tagsweep_core::{BackendRegistry, InMemoryBackend, InvalidationScheduler, SchedulerConfig};
//!
//! let pages = Arc::new(InMemoryBackend::new("pages"));
//! let registry = Arc::new(BackendRegistry::from_backends([pages as _]));
//! let scheduler = InvalidationScheduler::new(registry, SchedulerConfig::default());
//!
//! scheduler.add(["product:42"]);
//! ```

pub mod backend;
pub mod error;
pub mod item;
pub mod memory;
pub mod scheduler;
pub mod sweep;
pub mod tags;

pub use backend::{BackendRegistry, CacheBackend, DynBackend};
pub use error::{BackendError, BackendResult};
pub use item::CachedItem;
pub use memory::{CachedEntry, InMemoryBackend, MemoryStats};
pub use scheduler::{
    AddOutcome, DebouncePolicy, InvalidationScheduler, SchedulerConfig, SchedulerStatus,
};
pub use sweep::{BackendSweepStats, SweepReport, SweepTrigger};
pub use tags::TagSet;
