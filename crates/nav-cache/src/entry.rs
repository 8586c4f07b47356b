//! Route and segment cache entry state machines.
//!
//! Entries are shared cells: the map, the scheduler, and in-flight fetches
//! may all hold references to the same entry. Status transitions replace
//! the cell's contents in place, so every holder observes the resolution.
//! The entry mutex is a leaf lock - it is never held across a map
//! operation.

use std::sync::{Arc, Mutex};

use nav_core::{PrefetchTask, RouteTree, RscNode};
use tokio::sync::oneshot;

use crate::map::CacheWeight;

/// Fixed retry backoff applied to rejected entries.
pub const REJECT_BACKOFF_MS: u64 = 10_000;

/// How much dynamic content a segment fetch is expected to reveal.
///
/// The ordering is meaningful: a strategy later in the enum reveals at
/// least as much as an earlier one, which is what the upsert precedence
/// check compares.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum FetchStrategy {
    /// Static shell up to the nearest loading boundary.
    LoadingBoundary,
    /// Prerendered static shell.
    Ppr,
    /// Runtime-flavored prerender.
    PprRuntime,
    /// Fully dynamic render.
    Full,
}

/// Payload of a fulfilled route entry.
#[derive(Debug, Clone)]
pub struct FulfilledRoute {
    pub tree: Arc<RouteTree>,
    /// The page/head's own vary path, stored in tree shape for uniform
    /// traversal.
    pub metadata: Arc<RouteTree>,
    pub canonical_url: String,
    pub rendered_search: String,
    pub could_be_intercepted: bool,
    pub is_ppr_enabled: bool,
    /// Sticky: once set, this entry is never used as a prediction template.
    pub has_dynamic_rewrite: bool,
}

/// Lifecycle status of a route cache entry.
#[derive(Debug)]
pub enum RouteStatus {
    /// Created but not yet requested.
    Empty,
    /// A fetch is in flight.
    Pending,
    /// Resolved with a route tree.
    Fulfilled(FulfilledRoute),
    /// Terminal failure; `stale_at` rate-limits retries.
    Rejected,
}

/// A route cache entry cell.
pub struct RouteCacheEntry {
    status: RouteStatus,
    /// Tasks awaiting resolution, pinged on fulfill/reject. Allocated on
    /// first block.
    blocked_tasks: Option<Vec<Arc<dyn PrefetchTask>>>,
    stale_at: u64,
    version: u64,
    size: usize,
}

impl std::fmt::Debug for RouteCacheEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RouteCacheEntry")
            .field("status", &self.status)
            .field(
                "blocked_tasks",
                &self.blocked_tasks.as_ref().map_or(0, Vec::len),
            )
            .field("stale_at", &self.stale_at)
            .field("version", &self.version)
            .field("size", &self.size)
            .finish()
    }
}

pub type SharedRouteEntry = Arc<Mutex<RouteCacheEntry>>;

impl RouteCacheEntry {
    pub(crate) fn new_empty(version: u64) -> Self {
        Self {
            status: RouteStatus::Empty,
            blocked_tasks: None,
            // Pending entries do not expire by time; an in-flight fetch is
            // cancelled by staleness only through version bumps.
            stale_at: u64::MAX,
            version,
            size: 64,
        }
    }

    /// The entry's current status.
    pub fn status(&self) -> &RouteStatus {
        &self.status
    }

    /// The fulfilled payload, if resolved successfully.
    pub fn fulfilled(&self) -> Option<&FulfilledRoute> {
        match &self.status {
            RouteStatus::Fulfilled(f) => Some(f),
            _ => None,
        }
    }

    /// Whether the entry is still awaiting resolution.
    pub fn is_pending(&self) -> bool {
        matches!(self.status, RouteStatus::Empty | RouteStatus::Pending)
    }

    /// Whether the entry resolved with a terminal failure.
    pub fn is_rejected(&self) -> bool {
        matches!(self.status, RouteStatus::Rejected)
    }

    /// Millisecond timestamp after which the entry is stale.
    pub fn stale_at(&self) -> u64 {
        self.stale_at
    }

    /// Cache version the entry was created or fulfilled under.
    pub fn version(&self) -> u64 {
        self.version
    }

    /// Block a task on this entry. No-op if already blocked.
    pub(crate) fn block_task(&mut self, task: &Arc<dyn PrefetchTask>) {
        let tasks = self.blocked_tasks.get_or_insert_with(Vec::new);
        if !tasks.iter().any(|t| Arc::ptr_eq(t, task)) {
            tasks.push(Arc::clone(task));
        }
    }

    pub(crate) fn mark_pending(&mut self) {
        if matches!(self.status, RouteStatus::Empty) {
            self.status = RouteStatus::Pending;
        }
    }

    /// Resolve in place. Returns the tasks to ping, which the caller fires
    /// after releasing the entry lock.
    pub(crate) fn fulfill(
        &mut self,
        fulfilled: FulfilledRoute,
        stale_at: u64,
        version: u64,
    ) -> Vec<Arc<dyn PrefetchTask>> {
        self.size = fulfilled.tree.estimated_size() + fulfilled.canonical_url.len();
        self.status = RouteStatus::Fulfilled(fulfilled);
        self.stale_at = stale_at;
        self.version = version;
        self.blocked_tasks.take().unwrap_or_default()
    }

    /// Fail in place with the fixed retry backoff.
    pub(crate) fn reject(&mut self, now: u64) -> Vec<Arc<dyn PrefetchTask>> {
        self.status = RouteStatus::Rejected;
        self.stale_at = now + REJECT_BACKOFF_MS;
        self.blocked_tasks.take().unwrap_or_default()
    }

    pub(crate) fn mark_dynamic_rewrite(&mut self) {
        if let RouteStatus::Fulfilled(f) = &mut self.status {
            f.has_dynamic_rewrite = true;
        }
    }

    pub(crate) fn set_size(&mut self, size: usize) {
        self.size = size;
    }

    /// Approximate weight used by the map's byte budget.
    pub fn size(&self) -> usize {
        self.size
    }
}

impl CacheWeight for SharedRouteEntry {
    fn weight(&self) -> usize {
        self.lock().unwrap().size
    }
    fn stale_at(&self) -> u64 {
        self.lock().unwrap().stale_at
    }
    fn version(&self) -> u64 {
        self.lock().unwrap().version
    }
}

/// Payload of a fulfilled segment entry.
#[derive(Debug, Clone)]
pub struct FulfilledSegment {
    /// The rendered content, absent when the server rendered nothing for
    /// this node.
    pub rsc: Option<RscNode>,
    /// Whether the content still contains dynamic holes.
    pub is_partial: bool,
}

/// Lifecycle status of a segment cache entry.
#[derive(Debug)]
pub enum SegmentStatus {
    /// Created but not yet requested.
    Empty,
    /// A fetch is in flight.
    Pending,
    /// Resolved with rendered content.
    Fulfilled(FulfilledSegment),
    /// Terminal failure; `stale_at` rate-limits retries.
    Rejected,
}

type SegmentWaiter = oneshot::Sender<Option<FulfilledSegment>>;

/// A segment cache entry cell.
#[derive(Debug)]
pub struct SegmentCacheEntry {
    status: SegmentStatus,
    /// Resolvers for callers awaiting this entry. Allocated on first wait,
    /// so entries nobody awaits carry no synchronization overhead.
    waiters: Option<Vec<SegmentWaiter>>,
    fetch_strategy: FetchStrategy,
    stale_at: u64,
    version: u64,
    size: usize,
}

pub type SharedSegmentEntry = Arc<Mutex<SegmentCacheEntry>>;

impl SegmentCacheEntry {
    pub(crate) fn new_empty(fetch_strategy: FetchStrategy, version: u64) -> Self {
        Self {
            status: SegmentStatus::Empty,
            waiters: None,
            fetch_strategy,
            stale_at: u64::MAX,
            version,
            size: 32,
        }
    }

    /// Build a resolved entry that is not (yet) in any map. Used for
    /// results that must go through the precedence-checked upsert instead
    /// of overwriting an entry owned by another fetch.
    pub fn detached_fulfilled(
        fetch_strategy: FetchStrategy,
        rsc: Option<RscNode>,
        is_partial: bool,
        stale_at: u64,
        version: u64,
    ) -> SharedSegmentEntry {
        Arc::new(Mutex::new(Self {
            status: SegmentStatus::Fulfilled(FulfilledSegment { rsc, is_partial }),
            waiters: None,
            fetch_strategy,
            stale_at,
            version,
            size: 32,
        }))
    }

    /// The entry's current status.
    pub fn status(&self) -> &SegmentStatus {
        &self.status
    }

    /// The fulfilled payload, if resolved successfully.
    pub fn fulfilled(&self) -> Option<&FulfilledSegment> {
        match &self.status {
            SegmentStatus::Fulfilled(f) => Some(f),
            _ => None,
        }
    }

    /// Whether the entry is still awaiting resolution.
    pub fn is_pending(&self) -> bool {
        matches!(self.status, SegmentStatus::Empty | SegmentStatus::Pending)
    }

    /// Whether the entry resolved with a terminal failure.
    pub fn is_rejected(&self) -> bool {
        matches!(self.status, SegmentStatus::Rejected)
    }

    /// The strategy this entry was (or is being) fetched with.
    pub fn fetch_strategy(&self) -> FetchStrategy {
        self.fetch_strategy
    }

    /// Millisecond timestamp after which the entry is stale.
    pub fn stale_at(&self) -> u64 {
        self.stale_at
    }

    /// Cache version the entry was created or fulfilled under.
    pub fn version(&self) -> u64 {
        self.version
    }

    pub(crate) fn mark_pending(&mut self) {
        if matches!(self.status, SegmentStatus::Empty) {
            self.status = SegmentStatus::Pending;
        }
    }

    pub(crate) fn fulfill(
        &mut self,
        fulfilled: FulfilledSegment,
        stale_at: u64,
        version: u64,
    ) -> Vec<SegmentWaiter> {
        self.status = SegmentStatus::Fulfilled(fulfilled);
        self.stale_at = stale_at;
        self.version = version;
        self.waiters.take().unwrap_or_default()
    }

    /// Fail in place; any held content is dropped so holders of a
    /// reference observe the rejection.
    pub(crate) fn reject(&mut self, now: u64) -> Vec<SegmentWaiter> {
        self.status = SegmentStatus::Rejected;
        self.stale_at = now + REJECT_BACKOFF_MS;
        self.waiters.take().unwrap_or_default()
    }

    pub(crate) fn push_waiter(&mut self, waiter: SegmentWaiter) {
        self.waiters.get_or_insert_with(Vec::new).push(waiter);
    }

    pub(crate) fn set_size(&mut self, size: usize) {
        self.size = size;
    }
}

impl CacheWeight for SharedSegmentEntry {
    fn weight(&self) -> usize {
        self.lock().unwrap().size
    }
    fn stale_at(&self) -> u64 {
        self.lock().unwrap().stale_at
    }
    fn version(&self) -> u64 {
        self.lock().unwrap().version
    }
}

/// Await a segment entry's resolution without issuing a duplicate request.
///
/// Resolved entries complete immediately. Multiple concurrent callers share
/// the in-flight fetch: each gets its own resolver, all of which fire on
/// the same status transition. Returns `None` if the entry was rejected or
/// abandoned.
pub async fn wait_for_segment_entry(entry: &SharedSegmentEntry) -> Option<FulfilledSegment> {
    let rx = {
        let mut guard = entry.lock().unwrap();
        if let Some(fulfilled) = guard.fulfilled() {
            return Some(fulfilled.clone());
        }
        if guard.is_rejected() {
            return None;
        }
        let (tx, rx) = oneshot::channel();
        guard.push_waiter(tx);
        rx
    };
    rx.await.unwrap_or(None)
}
