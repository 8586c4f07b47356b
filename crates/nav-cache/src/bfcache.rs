//! Back/forward cache collaborator seam.

use nav_core::{RscNode, SegmentVaryPath};

/// A hit from the back/forward cache.
#[derive(Debug, Clone)]
pub struct BfCacheHit {
    /// The previously rendered content.
    pub rsc: Option<RscNode>,
    /// When the snapshot goes stale, in the bfcache's own convention.
    pub stale_at: u64,
}

/// In-memory store of previously rendered navigation results.
///
/// Lives outside this crate; the store consults it only when fulfilling
/// fully dynamic prefetches without touching the network.
pub trait BfCache: Send + Sync {
    /// Read an entry during a regular navigation.
    fn read(&self, adjusted_now: u64, path: &SegmentVaryPath) -> Option<BfCacheHit>;
}
