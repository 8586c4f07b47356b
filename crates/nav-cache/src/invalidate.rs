//! Invalidation and optimistic route prediction.
//!
//! Invalidation bumps the global version counters and notifies listeners;
//! it never walks the maps. Entries created under an older version read as
//! misses and are dropped by the next read that observes them, which keeps
//! invalidation O(listeners) rather than O(cache size).

use std::sync::{Arc, Mutex};

use nav_core::{is_prefetch_task_dirty, substitute_search, RouteCacheKey, RouteTree};

use crate::entry::{FulfilledRoute, RouteCacheEntry, SharedRouteEntry};
use crate::store::PrefetchStore;

impl PrefetchStore {
    /// Drop every cached route and segment from the reader's point of view.
    pub fn invalidate_entire_prefetch_cache(
        &self,
        next_url: Option<&str>,
        tree: Option<&RouteTree>,
    ) {
        self.bump_route_version();
        self.bump_segment_version();
        tracing::debug!("prefetch cache invalidated");
        self.notify_invalidation(next_url, tree);
    }

    /// Drop every cached route from the reader's point of view.
    pub fn invalidate_route_entries(&self, next_url: Option<&str>, tree: Option<&RouteTree>) {
        let version = self.bump_route_version();
        tracing::debug!(version, "route entries invalidated");
        self.notify_invalidation(next_url, tree);
    }

    /// Drop every cached segment from the reader's point of view.
    pub fn invalidate_segment_entries(&self, next_url: Option<&str>, tree: Option<&RouteTree>) {
        let version = self.bump_segment_version();
        tracing::debug!(version, "segment entries invalidated");
        self.notify_invalidation(next_url, tree);
    }

    fn notify_invalidation(&self, next_url: Option<&str>, tree: Option<&RouteTree>) {
        self.run_link_refresh_hook();
        for task in self.take_listeners() {
            if is_prefetch_task_dirty(&*task, next_url, tree) {
                task.on_invalidate();
            }
        }
    }

    /// Predict a route entry for `(pathname, search)` from the cached entry
    /// for `(pathname, "")`.
    ///
    /// Interim heuristic kept only to avoid a blocking navigation while the
    /// real request is in flight: it assumes rewrites and redirects are
    /// invariant to the search string. When that assumption is caught being
    /// wrong, [`PrefetchStore::mark_route_entry_as_dynamic_rewrite`]
    /// disqualifies the template from further predictions; already-derived
    /// entries must be invalidated by the caller, the flag is not
    /// retroactive.
    ///
    /// The clone is single-use and is never inserted into the cache.
    pub fn request_optimistic_route_entry(
        &self,
        now: u64,
        key: &RouteCacheKey,
    ) -> Option<SharedRouteEntry> {
        let template_key = key.with_search("");
        let template = self.read_route_entry(now, &template_key)?;
        let guard = template.lock().unwrap();
        let fulfilled = guard.fulfilled()?;
        if fulfilled.has_dynamic_rewrite {
            return None;
        }
        let tree = Arc::new(fulfilled.tree.with_search(&key.search));
        let metadata = RouteTree {
            kind: match &fulfilled.metadata.kind {
                nav_core::TreeKind::Page { vary_path } => nav_core::TreeKind::Page {
                    vary_path: substitute_search(vary_path, &key.search),
                },
                other => other.clone(),
            },
            ..(*fulfilled.metadata).clone()
        };
        let canonical_url = {
            let raw = fulfilled.canonical_url.as_str();
            let base = raw.split_once('?').map_or(raw, |(base, _)| base);
            format!("{base}{}", key.search)
        };
        let predicted = FulfilledRoute {
            tree,
            metadata: Arc::new(metadata),
            canonical_url,
            rendered_search: key.search.clone(),
            could_be_intercepted: fulfilled.could_be_intercepted,
            is_ppr_enabled: fulfilled.is_ppr_enabled,
            has_dynamic_rewrite: false,
        };
        let mut entry = RouteCacheEntry::new_empty(guard.version());
        entry.fulfill(predicted, guard.stale_at(), guard.version());
        Some(Arc::new(Mutex::new(entry)))
    }

    /// Record that the prediction heuristic produced a wrong answer for
    /// this template. Sticky: the entry is never used as a template again.
    pub fn mark_route_entry_as_dynamic_rewrite(&self, entry: &SharedRouteEntry) {
        entry.lock().unwrap().mark_dynamic_rewrite();
        tracing::debug!("route entry disqualified as prediction template");
    }
}
