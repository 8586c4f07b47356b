//! Core types for the client-side route prefetch cache.
//!
//! This crate provides the fundamental types shared by the cache and fetch
//! layers:
//! - `RouteCacheKey` and vary paths - canonical cache keys
//! - `RouteTree` - the in-memory shape of a page's nested layouts
//! - `PrefetchHints` - compact route metadata flags
//! - `PrefetchTask` / `Clock` - collaborator seams

mod clock;
mod hints;
mod key;
mod rsc;
mod task;
mod tree;
mod vary;

pub use clock::*;
pub use hints::*;
pub use key::*;
pub use rsc::*;
pub use task::*;
pub use tree::*;
pub use vary::*;
