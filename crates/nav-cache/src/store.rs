//! The process-wide prefetch store.
//!
//! One `PrefetchStore` is constructed at startup and shared by reference
//! with every caller. All entry mutation goes through the lifecycle methods
//! here, so a status transition always resolves blocked tasks and waiters.
//!
//! Lock order: a map mutex may lock an entry mutex (weight/staleness
//! reads), never the reverse. Entry mutexes are leaf locks.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use nav_core::{
    fulfilled_route_vary_path, ping_prefetch_task, route_vary_path, PrefetchTask, RouteCacheKey,
    RouteTree, RouteVaryPath, RscNode, SegmentVaryPath,
};

use crate::bfcache::BfCache;
use crate::entry::{
    FulfilledRoute, FulfilledSegment, FetchStrategy, RouteCacheEntry, SegmentCacheEntry,
    SharedRouteEntry, SharedSegmentEntry,
};
use crate::map::{create_cache_map, is_value_expired, CacheMap, KeySlot};

/// Configuration for the prefetch store and fetch pipeline.
#[derive(Debug, Clone)]
pub struct PrefetchConfig {
    /// Deployment id of the running build; responses from other builds are
    /// treated as permanent misses.
    pub build_id: String,
    /// Byte budget for route entries.
    pub max_route_bytes: usize,
    /// Byte budget for segment entries.
    pub max_segment_bytes: usize,
    /// How long route structure stays fresh.
    pub static_stale_ms: u64,
    /// How long fully dynamic content stays fresh.
    pub dynamic_stale_ms: u64,
    /// Re-key segments to param-filtered vary paths once the server reports
    /// which params a segment depends on.
    pub vary_params: bool,
    /// Whether the output is a fully static export, which encodes segment
    /// identity into request paths instead of headers.
    pub static_export: bool,
}

impl Default for PrefetchConfig {
    fn default() -> Self {
        Self {
            build_id: "development".to_string(),
            max_route_bytes: 4 * 1024 * 1024,
            max_segment_bytes: 50 * 1024 * 1024,
            static_stale_ms: 5 * 60 * 1_000,
            dynamic_stale_ms: 30 * 1_000,
            vary_params: false,
            static_export: false,
        }
    }
}

impl PrefetchConfig {
    /// Create a configuration for the given build.
    pub fn new(build_id: impl Into<String>) -> Self {
        Self {
            build_id: build_id.into(),
            ..Default::default()
        }
    }

    /// Set the route entry byte budget.
    pub fn with_max_route_bytes(mut self, bytes: usize) -> Self {
        self.max_route_bytes = bytes;
        self
    }

    /// Set the segment entry byte budget.
    pub fn with_max_segment_bytes(mut self, bytes: usize) -> Self {
        self.max_segment_bytes = bytes;
        self
    }

    /// Set how long route structure stays fresh.
    pub fn with_static_stale_ms(mut self, ms: u64) -> Self {
        self.static_stale_ms = ms;
        self
    }

    /// Set how long fully dynamic content stays fresh.
    pub fn with_dynamic_stale_ms(mut self, ms: u64) -> Self {
        self.dynamic_stale_ms = ms;
        self
    }

    /// Enable param-filtered segment re-keying.
    pub fn with_vary_params(mut self, enabled: bool) -> Self {
        self.vary_params = enabled;
        self
    }

    /// Mark the output as a fully static export.
    pub fn with_static_export(mut self, enabled: bool) -> Self {
        self.static_export = enabled;
        self
    }
}

/// Outcome of a precedence-checked segment upsert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    /// The candidate replaced (or filled) the canonical slot.
    Inserted,
    /// A more complete entry already existed; the candidate was downgraded
    /// to rejected in place.
    Rejected,
}

type LinkRefreshHook = Box<dyn Fn() + Send + Sync>;

/// The process-wide route and segment cache.
pub struct PrefetchStore {
    routes: Mutex<CacheMap<SharedRouteEntry>>,
    segments: Mutex<CacheMap<SharedSegmentEntry>>,
    route_version: AtomicU64,
    segment_version: AtomicU64,
    listeners: Mutex<Vec<Arc<dyn PrefetchTask>>>,
    link_refresh: Mutex<Option<LinkRefreshHook>>,
    config: PrefetchConfig,
}

impl PrefetchStore {
    /// Create a store with the given configuration.
    pub fn new(config: PrefetchConfig) -> Self {
        Self {
            routes: Mutex::new(create_cache_map(config.max_route_bytes)),
            segments: Mutex::new(create_cache_map(config.max_segment_bytes)),
            route_version: AtomicU64::new(0),
            segment_version: AtomicU64::new(0),
            listeners: Mutex::new(Vec::new()),
            link_refresh: Mutex::new(None),
            config,
        }
    }

    /// The store's configuration.
    pub fn config(&self) -> &PrefetchConfig {
        &self.config
    }

    /// Current route cache version. Entries created under an older version
    /// read as misses.
    pub fn route_cache_version(&self) -> u64 {
        self.route_version.load(Ordering::SeqCst)
    }

    /// Current segment cache version.
    pub fn segment_cache_version(&self) -> u64 {
        self.segment_version.load(Ordering::SeqCst)
    }

    /// Install the hook that re-triggers prefetching of currently visible
    /// links after an invalidation.
    pub fn set_link_refresh_hook(&self, hook: impl Fn() + Send + Sync + 'static) {
        *self.link_refresh.lock().unwrap() = Some(Box::new(hook));
    }

    // === Route entries ===

    /// Read the entry stored at an exact vary path.
    pub fn read_exact_route_entry(&self, now: u64, path: &RouteVaryPath) -> Option<SharedRouteEntry> {
        self.routes.lock().unwrap().get(
            now,
            self.route_cache_version(),
            path.as_str(),
            KeySlot::Canonical,
        )
    }

    /// Probe for a route entry: first the context-qualified key, then the
    /// shared key used by routes known not to be interceptable.
    pub fn read_route_entry(&self, now: u64, key: &RouteCacheKey) -> Option<SharedRouteEntry> {
        let version = self.route_cache_version();
        let mut routes = self.routes.lock().unwrap();
        if key.next_url.is_some() {
            let qualified = route_vary_path(key);
            if let Some(entry) = routes.get(now, version, qualified.as_str(), KeySlot::Canonical) {
                return Some(entry);
            }
        }
        let shared = fulfilled_route_vary_path(key, false);
        routes.get(now, version, shared.as_str(), KeySlot::Canonical)
    }

    /// Read the entry for `key`, creating a fresh empty one on miss so all
    /// concurrent callers converge on the same entry.
    ///
    /// When a task is supplied it is attached as an invalidation listener
    /// and blocked on the entry if the entry is unresolved.
    pub fn read_or_create_route_entry(
        &self,
        now: u64,
        task: Option<&Arc<dyn PrefetchTask>>,
        key: &RouteCacheKey,
    ) -> SharedRouteEntry {
        if let Some(task) = task {
            self.attach_invalidation_listener(task);
        }
        let version = self.route_cache_version();
        let entry = {
            let mut routes = self.routes.lock().unwrap();
            let existing = if key.next_url.is_some() {
                let qualified = route_vary_path(key);
                routes.get(now, version, qualified.as_str(), KeySlot::Canonical)
            } else {
                None
            };
            let existing = existing.or_else(|| {
                let shared = fulfilled_route_vary_path(key, false);
                routes.get(now, version, shared.as_str(), KeySlot::Canonical)
            });
            match existing {
                Some(entry) => entry,
                None => {
                    let entry: SharedRouteEntry =
                        Arc::new(Mutex::new(RouteCacheEntry::new_empty(version)));
                    let probe = route_vary_path(key);
                    routes.set(probe.as_str(), KeySlot::Canonical, Arc::clone(&entry));
                    entry
                }
            }
        };
        if let Some(task) = task {
            let mut guard = entry.lock().unwrap();
            if guard.is_pending() {
                guard.block_task(task);
            }
        }
        entry
    }

    /// Record that a fetch has been issued for the entry.
    pub fn mark_route_entry_pending(&self, entry: &SharedRouteEntry) {
        entry.lock().unwrap().mark_pending();
    }

    /// Resolve a route entry in place, preserving its identity so existing
    /// references and blocked tasks remain valid. Route structure is
    /// assumed stable until the next deploy, so the entry stays fresh for
    /// the server-provided stale time, or the configured static stale time.
    #[allow(clippy::too_many_arguments)]
    pub fn fulfill_route_entry(
        &self,
        now: u64,
        entry: &SharedRouteEntry,
        tree: Arc<RouteTree>,
        metadata: Arc<RouteTree>,
        canonical_url: impl Into<String>,
        rendered_search: impl Into<String>,
        could_be_intercepted: bool,
        is_ppr_enabled: bool,
        stale_time_ms: Option<u64>,
    ) {
        let stale_at = now + stale_time_ms.unwrap_or(self.config.static_stale_ms);
        let fulfilled = FulfilledRoute {
            tree,
            metadata,
            canonical_url: canonical_url.into(),
            rendered_search: rendered_search.into(),
            could_be_intercepted,
            is_ppr_enabled,
            has_dynamic_rewrite: false,
        };
        let tasks = entry
            .lock()
            .unwrap()
            .fulfill(fulfilled, stale_at, self.route_cache_version());
        for task in &tasks {
            ping_prefetch_task(task);
        }
    }

    /// Fail a route entry in place with the fixed retry backoff. Blocked
    /// tasks are pinged so they re-poll and observe the rejection.
    pub fn reject_route_entry(&self, now: u64, entry: &SharedRouteEntry) {
        let tasks = entry.lock().unwrap().reject(now);
        for task in &tasks {
            ping_prefetch_task(task);
        }
    }

    /// Move an entry to a new vary path, preserving its identity. Used to
    /// promote a probe-keyed entry to the shareable canonical key once the
    /// response reveals the route cannot be intercepted.
    pub fn rekey_route_entry(&self, old_path: &RouteVaryPath, new_path: &RouteVaryPath) {
        let mut routes = self.routes.lock().unwrap();
        if let Some(entry) = routes.delete(old_path.as_str(), KeySlot::Canonical) {
            routes.set(new_path.as_str(), KeySlot::Canonical, entry);
        }
    }

    /// Re-attribute a route entry's weight. The map's accounting is only
    /// touched if `entry` is what the path currently maps to.
    pub fn set_route_entry_size(&self, path: &RouteVaryPath, entry: &SharedRouteEntry, size: usize) {
        entry.lock().unwrap().set_size(size);
        let mut routes = self.routes.lock().unwrap();
        let mapped = routes
            .peek(path.as_str(), KeySlot::Canonical)
            .is_some_and(|mapped| Arc::ptr_eq(mapped, entry));
        if mapped {
            routes.set_size(path.as_str(), KeySlot::Canonical, size);
        }
    }

    // === Segment entries ===

    /// Read the segment entry at a vary path.
    pub fn read_segment_entry(&self, now: u64, path: &SegmentVaryPath) -> Option<SharedSegmentEntry> {
        self.segments.lock().unwrap().get(
            now,
            self.segment_cache_version(),
            path.as_str(),
            KeySlot::Canonical,
        )
    }

    /// Read or create the canonical segment entry at a vary path.
    pub fn read_or_create_segment_entry(
        &self,
        now: u64,
        path: &SegmentVaryPath,
        strategy: FetchStrategy,
    ) -> SharedSegmentEntry {
        self.read_or_create_segment_slot(now, path, strategy, KeySlot::Canonical)
    }

    /// Read or create a revalidation entry at a vary path. The revalidation
    /// slot is separate from the canonical one, so a background refresh
    /// never disturbs an entry the UI is reading.
    pub fn read_or_create_revalidating_segment_entry(
        &self,
        now: u64,
        path: &SegmentVaryPath,
        strategy: FetchStrategy,
    ) -> SharedSegmentEntry {
        self.read_or_create_segment_slot(now, path, strategy, KeySlot::Revalidating)
    }

    fn read_or_create_segment_slot(
        &self,
        now: u64,
        path: &SegmentVaryPath,
        strategy: FetchStrategy,
        slot: KeySlot,
    ) -> SharedSegmentEntry {
        let version = self.segment_cache_version();
        let mut segments = self.segments.lock().unwrap();
        if let Some(entry) = segments.get(now, version, path.as_str(), slot) {
            return entry;
        }
        let entry: SharedSegmentEntry =
            Arc::new(Mutex::new(SegmentCacheEntry::new_empty(strategy, version)));
        segments.set(path.as_str(), slot, Arc::clone(&entry));
        entry
    }

    /// Record that a fetch has been issued for the entry.
    pub fn mark_segment_entry_pending(&self, entry: &SharedSegmentEntry) {
        entry.lock().unwrap().mark_pending();
    }

    /// Resolve a segment entry in place and fire its waiters.
    pub fn fulfill_segment_entry(
        &self,
        entry: &SharedSegmentEntry,
        rsc: Option<RscNode>,
        is_partial: bool,
        stale_at: u64,
    ) {
        let fulfilled = FulfilledSegment { rsc, is_partial };
        let waiters = {
            let mut guard = entry.lock().unwrap();
            guard.fulfill(fulfilled.clone(), stale_at, self.segment_cache_version())
        };
        for tx in waiters {
            let _ = tx.send(Some(fulfilled.clone()));
        }
    }

    /// Fail a segment entry in place with the fixed retry backoff, dropping
    /// any held content, and resolve its waiters with `None`.
    pub fn reject_segment_entry(&self, now: u64, entry: &SharedSegmentEntry) {
        let waiters = entry.lock().unwrap().reject(now);
        for tx in waiters {
            let _ = tx.send(None);
        }
    }

    /// Insert a resolved candidate at a vary path, subject to the
    /// monotonic-completeness precedence policy.
    ///
    /// The candidate loses when it is already expired, or when a fulfilled
    /// entry at the same path is more complete: a non-partial existing
    /// entry always wins, and otherwise the entry fetched with the
    /// strictly greater strategy wins. Losers are downgraded to rejected in
    /// place, never silently dropped.
    pub fn upsert_segment_entry(
        &self,
        now: u64,
        path: &SegmentVaryPath,
        candidate: &SharedSegmentEntry,
    ) -> UpsertOutcome {
        let version = self.segment_cache_version();
        let candidate_loses = {
            let guard = candidate.lock().unwrap();
            match guard.fulfilled() {
                None => true,
                Some(_) => guard.version() < version || guard.stale_at() <= now,
            }
        };
        if candidate_loses {
            tracing::debug!(path = %path, "segment candidate expired before upsert");
            self.reject_segment_entry(now, candidate);
            return UpsertOutcome::Rejected;
        }

        let existing = self.read_segment_entry(now, path);
        if let Some(existing) = &existing {
            if Arc::ptr_eq(existing, candidate) {
                return UpsertOutcome::Inserted;
            }
            let keep_existing = {
                let existing_guard = existing.lock().unwrap();
                let candidate_guard = candidate.lock().unwrap();
                match (existing_guard.fulfilled(), candidate_guard.fulfilled()) {
                    (Some(theirs), Some(_)) => {
                        !theirs.is_partial
                            || existing_guard.fetch_strategy() > candidate_guard.fetch_strategy()
                    }
                    _ => false,
                }
            };
            if keep_existing {
                tracing::debug!(path = %path, "more complete segment already cached; downgrading candidate");
                self.reject_segment_entry(now, candidate);
                return UpsertOutcome::Rejected;
            }
        }

        let mut segments = self.segments.lock().unwrap();
        // Promotion: if the candidate was the revalidation entry for this
        // path, clear that slot as it moves to the canonical one.
        let promoted = segments
            .peek(path.as_str(), KeySlot::Revalidating)
            .is_some_and(|reval| Arc::ptr_eq(reval, candidate));
        if promoted {
            segments.delete(path.as_str(), KeySlot::Revalidating);
        }
        segments.set(path.as_str(), KeySlot::Canonical, Arc::clone(candidate));
        UpsertOutcome::Inserted
    }

    /// Re-attribute a segment entry's weight, in whichever slot the entry
    /// currently occupies. Detached entries only update their own field.
    pub fn set_segment_entry_size(
        &self,
        path: &SegmentVaryPath,
        entry: &SharedSegmentEntry,
        size: usize,
    ) {
        entry.lock().unwrap().set_size(size);
        let mut segments = self.segments.lock().unwrap();
        for slot in [KeySlot::Canonical, KeySlot::Revalidating] {
            let mapped = segments
                .peek(path.as_str(), slot)
                .is_some_and(|mapped| Arc::ptr_eq(mapped, entry));
            if mapped {
                segments.set_size(path.as_str(), slot, size);
            }
        }
    }

    /// Fulfill a fully dynamic prefetch from the back/forward cache instead
    /// of the network. Only `Full`-strategy entries qualify; anything less
    /// would reveal more content than the bfcache snapshot holds.
    pub fn attempt_to_fulfill_segment_from_bfcache(
        &self,
        now: u64,
        bfcache: &dyn BfCache,
        path: &SegmentVaryPath,
        entry: &SharedSegmentEntry,
    ) -> bool {
        {
            let guard = entry.lock().unwrap();
            if guard.fetch_strategy() != FetchStrategy::Full || !guard.is_pending() {
                return false;
            }
        }
        let Some(hit) = bfcache.read(now, path) else {
            return false;
        };
        // The bfcache keeps its own stale-time convention; clamp into ours
        // so a hit never outlives the dynamic staleness ceiling.
        let stale_at = hit.stale_at.min(now + self.config.dynamic_stale_ms);
        if stale_at <= now {
            return false;
        }
        self.fulfill_segment_entry(entry, hit.rsc, false, stale_at);
        true
    }

    // === Shared ===

    pub(crate) fn bump_route_version(&self) -> u64 {
        self.route_version.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub(crate) fn bump_segment_version(&self) -> u64 {
        self.segment_version.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub(crate) fn route_map_len(&self) -> usize {
        self.routes.lock().unwrap().len()
    }

    pub(crate) fn segment_map_len(&self) -> usize {
        self.segments.lock().unwrap().len()
    }

    /// Register a task to be notified when the cache is invalidated.
    pub fn attach_invalidation_listener(&self, task: &Arc<dyn PrefetchTask>) {
        let mut listeners = self.listeners.lock().unwrap();
        if !listeners.iter().any(|t| Arc::ptr_eq(t, task)) {
            listeners.push(Arc::clone(task));
        }
    }

    pub(crate) fn take_listeners(&self) -> Vec<Arc<dyn PrefetchTask>> {
        std::mem::take(&mut *self.listeners.lock().unwrap())
    }

    pub(crate) fn run_link_refresh_hook(&self) {
        if let Some(hook) = &*self.link_refresh.lock().unwrap() {
            hook();
        }
    }
}

/// Staleness convenience used by readers holding an entry.
pub fn is_route_entry_stale(store: &PrefetchStore, now: u64, entry: &SharedRouteEntry) -> bool {
    is_value_expired(now, store.route_cache_version(), entry)
}

/// Staleness convenience for segment entries.
pub fn is_segment_entry_stale(store: &PrefetchStore, now: u64, entry: &SharedSegmentEntry) -> bool {
    is_value_expired(now, store.segment_cache_version(), entry)
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use nav_core::{PrefetchHints, SegmentValue, SegmentVaryPathBuilder, TreeKind};

    use super::*;
    use crate::bfcache::BfCacheHit;
    use crate::entry::{wait_for_segment_entry, REJECT_BACKOFF_MS};

    struct TestTask {
        key: RouteCacheKey,
        pings: AtomicUsize,
        invalidations: AtomicUsize,
        dirty: bool,
    }

    impl TestTask {
        fn shared(key: RouteCacheKey, dirty: bool) -> (Arc<TestTask>, Arc<dyn PrefetchTask>) {
            let task = Arc::new(Self {
                key,
                pings: AtomicUsize::new(0),
                invalidations: AtomicUsize::new(0),
                dirty,
            });
            let as_dyn: Arc<dyn PrefetchTask> = Arc::clone(&task) as Arc<dyn PrefetchTask>;
            (task, as_dyn)
        }
    }

    impl PrefetchTask for TestTask {
        fn key(&self) -> &RouteCacheKey {
            &self.key
        }
        fn ping(&self) {
            self.pings.fetch_add(1, Ordering::SeqCst);
        }
        fn on_invalidate(&self) {
            self.invalidations.fetch_add(1, Ordering::SeqCst);
        }
        fn is_dirty(&self, _next_url: Option<&str>, _tree: Option<&RouteTree>) -> bool {
            self.dirty
        }
    }

    fn page_tree(request_key: &str, search: &str) -> Arc<RouteTree> {
        let builder = SegmentVaryPathBuilder::root().descend(request_key.trim_start_matches('/'));
        Arc::new(RouteTree {
            request_key: request_key.to_string(),
            segment: SegmentValue::Static(request_key.trim_start_matches('/').to_string()),
            refresh_state: None,
            slots: None,
            kind: TreeKind::Page {
                vary_path: builder.finalize_page(search),
            },
            hints: PrefetchHints::new(),
        })
    }

    fn metadata_tree(request_key: &str, search: &str) -> Arc<RouteTree> {
        let builder = SegmentVaryPathBuilder::root().descend(request_key.trim_start_matches('/'));
        Arc::new(RouteTree {
            request_key: request_key.to_string(),
            segment: SegmentValue::Static("~metadata".to_string()),
            refresh_state: None,
            slots: None,
            kind: TreeKind::Page {
                vary_path: builder.finalize_metadata(search),
            },
            hints: PrefetchHints::new(),
        })
    }

    fn store() -> PrefetchStore {
        PrefetchStore::new(PrefetchConfig::new("build-1"))
    }

    fn fulfill_basic(store: &PrefetchStore, now: u64, entry: &SharedRouteEntry, key: &RouteCacheKey) {
        store.fulfill_route_entry(
            now,
            entry,
            page_tree(&key.pathname, &key.search),
            metadata_tree(&key.pathname, &key.search),
            key.href(),
            key.search.clone(),
            false,
            true,
            None,
        );
    }

    fn segment_path(raw: &str) -> SegmentVaryPath {
        SegmentVaryPathBuilder::root().descend(raw).finalize_layout()
    }

    // === Single-flight Tests ===

    #[test]
    fn test_concurrent_readers_converge_on_one_entry() {
        let store = store();
        let key = RouteCacheKey::new("/a", "", None);
        let first = store.read_or_create_route_entry(0, None, &key);
        let second = store.read_or_create_route_entry(0, None, &key);
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn test_segment_single_flight() {
        let store = store();
        let path = segment_path("a");
        let first = store.read_or_create_segment_entry(0, &path, FetchStrategy::Ppr);
        let second = store.read_or_create_segment_entry(0, &path, FetchStrategy::Full);
        assert!(Arc::ptr_eq(&first, &second));
        // The in-flight strategy wins; the second caller shares it.
        assert_eq!(first.lock().unwrap().fetch_strategy(), FetchStrategy::Ppr);
    }

    #[test]
    fn test_blocked_tasks_pinged_on_fulfill() {
        let store = store();
        let key = RouteCacheKey::new("/a", "", None);
        let (task, as_dyn) = TestTask::shared(key.clone(), false);
        let entry = store.read_or_create_route_entry(0, Some(&as_dyn), &key);
        fulfill_basic(&store, 0, &entry, &key);
        assert_eq!(task.pings.load(Ordering::SeqCst), 1);
    }

    // === Expiry Tests ===

    #[test]
    fn test_expired_read_is_idempotent() {
        let store = store();
        let key = RouteCacheKey::new("/a", "", None);
        let entry = store.read_or_create_route_entry(0, None, &key);
        fulfill_basic(&store, 0, &entry, &key);
        let after = store.config().static_stale_ms;
        assert!(store.read_route_entry(after, &key).is_none());
        assert!(store.read_route_entry(after, &key).is_none());
    }

    #[test]
    fn test_rejected_entry_retries_after_backoff() {
        let store = store();
        let key = RouteCacheKey::new("/a", "", None);
        let entry = store.read_or_create_route_entry(1_000, None, &key);
        store.reject_route_entry(1_000, &entry);
        // Within the backoff the rejected entry is still served, so callers
        // do not re-request.
        let again = store.read_or_create_route_entry(1_000, None, &key);
        assert!(Arc::ptr_eq(&entry, &again));
        assert!(again.lock().unwrap().is_rejected());
        // After the backoff the read misses and a fresh entry is created.
        let fresh = store.read_or_create_route_entry(1_000 + REJECT_BACKOFF_MS, None, &key);
        assert!(!Arc::ptr_eq(&entry, &fresh));
        assert!(fresh.lock().unwrap().is_pending());
    }

    // === Invalidation Tests ===

    #[test]
    fn test_invalidation_does_not_evict_eagerly() {
        let store = store();
        let key = RouteCacheKey::new("/a", "", None);
        let entry = store.read_or_create_route_entry(0, None, &key);
        fulfill_basic(&store, 0, &entry, &key);
        let path = segment_path("a");
        let seg = store.read_or_create_segment_entry(0, &path, FetchStrategy::Ppr);
        store.fulfill_segment_entry(&seg, None, false, u64::MAX);

        store.invalidate_entire_prefetch_cache(None, None);
        assert_eq!(store.route_map_len(), 1);
        assert_eq!(store.segment_map_len(), 1);

        // Only the next read drops them.
        assert!(store.read_route_entry(0, &key).is_none());
        assert!(store.read_segment_entry(0, &path).is_none());
        assert_eq!(store.route_map_len(), 0);
        assert_eq!(store.segment_map_len(), 0);
    }

    #[test]
    fn test_invalidation_fires_dirty_listeners_and_clears_set() {
        let store = store();
        let key = RouteCacheKey::new("/a", "", None);
        let (dirty, dirty_dyn) = TestTask::shared(key.clone(), true);
        let (clean, clean_dyn) = TestTask::shared(key.clone(), false);
        store.attach_invalidation_listener(&dirty_dyn);
        store.attach_invalidation_listener(&clean_dyn);
        store.invalidate_route_entries(None, None);

        assert_eq!(dirty.invalidations.load(Ordering::SeqCst), 1);
        assert_eq!(clean.invalidations.load(Ordering::SeqCst), 0);

        // The set was cleared; a second invalidation fires nothing.
        store.invalidate_route_entries(None, None);
        assert_eq!(dirty.invalidations.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_invalidation_runs_link_refresh_hook() {
        let store = store();
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&runs);
        store.set_link_refresh_hook(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        store.invalidate_segment_entries(None, None);
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    // === Upsert Precedence Tests ===

    #[test]
    fn test_upsert_replaces_partial_lower_strategy() {
        let store = store();
        let path = segment_path("a");
        let existing = SegmentCacheEntry::detached_fulfilled(
            FetchStrategy::LoadingBoundary,
            None,
            true,
            u64::MAX,
            0,
        );
        assert_eq!(
            store.upsert_segment_entry(0, &path, &existing),
            UpsertOutcome::Inserted
        );
        let candidate = SegmentCacheEntry::detached_fulfilled(
            FetchStrategy::PprRuntime,
            None,
            false,
            u64::MAX,
            0,
        );
        assert_eq!(
            store.upsert_segment_entry(0, &path, &candidate),
            UpsertOutcome::Inserted
        );
        let current = store.read_segment_entry(0, &path).unwrap();
        assert!(Arc::ptr_eq(&current, &candidate));
    }

    #[test]
    fn test_upsert_rejects_candidate_against_complete_entry() {
        let store = store();
        let path = segment_path("a");
        let existing =
            SegmentCacheEntry::detached_fulfilled(FetchStrategy::Full, None, false, u64::MAX, 0);
        store.upsert_segment_entry(0, &path, &existing);
        let candidate =
            SegmentCacheEntry::detached_fulfilled(FetchStrategy::Ppr, None, true, u64::MAX, 0);
        assert_eq!(
            store.upsert_segment_entry(0, &path, &candidate),
            UpsertOutcome::Rejected
        );
        // The loser is downgraded in place, not silently dropped.
        {
            let guard = candidate.lock().unwrap();
            assert!(guard.is_rejected());
            assert!(guard.fulfilled().is_none());
        }
        // The cache still holds the complete entry.
        let current = store.read_segment_entry(0, &path).unwrap();
        assert!(Arc::ptr_eq(&current, &existing));
    }

    #[test]
    fn test_upsert_non_partial_existing_beats_higher_strategy() {
        let store = store();
        let path = segment_path("a");
        let existing = SegmentCacheEntry::detached_fulfilled(
            FetchStrategy::LoadingBoundary,
            None,
            false,
            u64::MAX,
            0,
        );
        store.upsert_segment_entry(0, &path, &existing);
        let candidate =
            SegmentCacheEntry::detached_fulfilled(FetchStrategy::Full, None, false, u64::MAX, 0);
        assert_eq!(
            store.upsert_segment_entry(0, &path, &candidate),
            UpsertOutcome::Rejected
        );
    }

    #[test]
    fn test_upsert_rejects_expired_candidate() {
        let store = store();
        let path = segment_path("a");
        let candidate =
            SegmentCacheEntry::detached_fulfilled(FetchStrategy::Full, None, false, 100, 0);
        assert_eq!(
            store.upsert_segment_entry(100, &path, &candidate),
            UpsertOutcome::Rejected
        );
        assert!(store.read_segment_entry(0, &path).is_none());
    }

    #[test]
    fn test_upsert_promotes_revalidation_entry() {
        let store = store();
        let path = segment_path("a");
        let reval =
            store.read_or_create_revalidating_segment_entry(0, &path, FetchStrategy::PprRuntime);
        store.fulfill_segment_entry(&reval, None, false, u64::MAX);
        assert_eq!(
            store.upsert_segment_entry(0, &path, &reval),
            UpsertOutcome::Inserted
        );
        let canonical = store.read_segment_entry(0, &path).unwrap();
        assert!(Arc::ptr_eq(&canonical, &reval));
        // The revalidation slot is free again.
        let fresh = store.read_or_create_revalidating_segment_entry(0, &path, FetchStrategy::Ppr);
        assert!(!Arc::ptr_eq(&fresh, &reval));
    }

    #[test]
    fn test_revalidation_slot_does_not_disturb_canonical() {
        let store = store();
        let path = segment_path("a");
        let canonical = store.read_or_create_segment_entry(0, &path, FetchStrategy::Ppr);
        store.fulfill_segment_entry(&canonical, None, false, u64::MAX);
        let reval = store.read_or_create_revalidating_segment_entry(0, &path, FetchStrategy::Full);
        assert!(!Arc::ptr_eq(&canonical, &reval));
        let read_back = store.read_segment_entry(0, &path).unwrap();
        assert!(Arc::ptr_eq(&read_back, &canonical));
    }

    // === Waiter Tests ===

    #[tokio::test]
    async fn test_waiters_resolve_through_store_fulfill() {
        let store = store();
        let path = segment_path("a");
        let entry = store.read_or_create_segment_entry(0, &path, FetchStrategy::Full);
        let waiter = {
            let entry = Arc::clone(&entry);
            tokio::spawn(async move { wait_for_segment_entry(&entry).await })
        };
        tokio::task::yield_now().await;
        store.fulfill_segment_entry(&entry, None, true, u64::MAX);
        let got = waiter.await.unwrap().unwrap();
        assert!(got.is_partial);
    }

    #[tokio::test]
    async fn test_waiters_observe_rejection() {
        let store = store();
        let path = segment_path("a");
        let entry = store.read_or_create_segment_entry(0, &path, FetchStrategy::Full);
        let waiter = {
            let entry = Arc::clone(&entry);
            tokio::spawn(async move { wait_for_segment_entry(&entry).await })
        };
        tokio::task::yield_now().await;
        store.reject_segment_entry(0, &entry);
        assert!(waiter.await.unwrap().is_none());
    }

    // === BfCache Tests ===

    struct FixedBfCache {
        hit: Option<BfCacheHit>,
    }

    impl BfCache for FixedBfCache {
        fn read(&self, _adjusted_now: u64, _path: &SegmentVaryPath) -> Option<BfCacheHit> {
            self.hit.clone()
        }
    }

    #[test]
    fn test_bfcache_fulfills_full_strategy_only() {
        let store = store();
        let bf = FixedBfCache {
            hit: Some(BfCacheHit {
                rsc: None,
                stale_at: u64::MAX,
            }),
        };
        let path = segment_path("a");
        let partial_entry = store.read_or_create_segment_entry(0, &path, FetchStrategy::Ppr);
        assert!(!store.attempt_to_fulfill_segment_from_bfcache(0, &bf, &path, &partial_entry));

        let other = segment_path("b");
        let full_entry = store.read_or_create_segment_entry(0, &other, FetchStrategy::Full);
        assert!(store.attempt_to_fulfill_segment_from_bfcache(0, &bf, &other, &full_entry));
        let guard = full_entry.lock().unwrap();
        let fulfilled = guard.fulfilled().unwrap();
        assert!(!fulfilled.is_partial);
        // Clamped into the store's dynamic staleness ceiling.
        assert_eq!(guard.stale_at(), store.config().dynamic_stale_ms);
    }

    #[test]
    fn test_bfcache_stale_hit_is_ignored() {
        let store = store();
        let bf = FixedBfCache {
            hit: Some(BfCacheHit {
                rsc: None,
                stale_at: 50,
            }),
        };
        let path = segment_path("a");
        let entry = store.read_or_create_segment_entry(100, &path, FetchStrategy::Full);
        assert!(!store.attempt_to_fulfill_segment_from_bfcache(100, &bf, &path, &entry));
        assert!(entry.lock().unwrap().is_pending());
    }

    // === Rekey Tests ===

    #[test]
    fn test_rekey_preserves_identity_and_shares_across_contexts() {
        let store = store();
        let key = RouteCacheKey::new("/blog/hello", "", Some("/feed".to_string()));
        let entry = store.read_or_create_route_entry(0, None, &key);
        fulfill_basic(&store, 0, &entry, &key);
        store.rekey_route_entry(&route_vary_path(&key), &fulfilled_route_vary_path(&key, false));

        // A different referring context now hits the same canonical entry.
        let other = RouteCacheKey::new("/blog/hello", "", Some("/dashboard".to_string()));
        let found = store.read_route_entry(0, &other).unwrap();
        assert!(Arc::ptr_eq(&found, &entry));
    }
}
