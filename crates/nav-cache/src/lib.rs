//! Versioned route and segment cache for the client prefetch pipeline.
//!
//! This crate provides:
//! - `CacheMap` - size-bounded, versioned key/value store with lazy expiry
//! - `RouteCacheEntry` / `SegmentCacheEntry` - entry state machines
//! - `PrefetchStore` - the process-wide cache service
//! - `BfCache` - back/forward cache collaborator seam
//!
//! Synchronous reads never await: asynchronous work (fetching, decoding) is
//! performed elsewhere and written into entries through the lifecycle
//! methods on `PrefetchStore`, which ping blocked tasks on resolution.

mod bfcache;
mod entry;
mod invalidate;
mod map;
mod store;

pub use bfcache::*;
pub use entry::*;
pub use map::*;
pub use store::*;
