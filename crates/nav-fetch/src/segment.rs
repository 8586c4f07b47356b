//! Segment fetch orchestration.

use std::collections::HashMap;
use std::sync::Arc;

use nav_cache::{
    FetchStrategy, SegmentCacheEntry, SharedRouteEntry, SharedSegmentEntry, UpsertOutcome,
};
use nav_core::{fulfilled_segment_vary_path, RouteCacheKey, RouteTree, RscNode, SegmentVaryPath};

use crate::decode::{count_bytes, strip_stage_marker, StageMarker};
use crate::error::{log_fetch_failure, FetchError};
use crate::fetcher::PrefetchFetcher;
use crate::protocol::{
    static_export_segment_url, NAV_URL_HEADER, PREFETCH_MODE_HEADER, PREFETCH_MODE_RUNTIME,
    PREFETCH_MODE_SHELL, ROUTER_STATE_HEADER, SEGMENT_REQUEST_HEADER,
};
use crate::route::pathname_of;
use crate::transport::FetchRequest;
use crate::wire::DynamicSeed;

use crate::convert::route_tree_to_router_state;

/// Entries created by one dynamic fetch, keyed by vary path.
///
/// The map is a write-ownership token: the fetch that spawned an entry may
/// write into it directly; results for anything else must go through the
/// precedence-checked upsert so a concurrently owned entry is never
/// clobbered.
#[derive(Default)]
pub struct SpawnedEntries {
    entries: HashMap<SegmentVaryPath, SharedSegmentEntry>,
}

impl SpawnedEntries {
    /// An empty ownership map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim an entry for this fetch.
    pub fn insert(&mut self, path: SegmentVaryPath, entry: SharedSegmentEntry) {
        self.entries.insert(path, entry);
    }

    /// Look up an entry this fetch owns.
    pub fn get(&self, path: &SegmentVaryPath) -> Option<&SharedSegmentEntry> {
        self.entries.get(path)
    }

    /// Number of owned entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the fetch owns no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterate over owned entries.
    pub fn iter(&self) -> impl Iterator<Item = (&SegmentVaryPath, &SharedSegmentEntry)> {
        self.entries.iter()
    }
}

impl PrefetchFetcher {
    /// Fetch one segment's content and resolve `entry` with it.
    ///
    /// Never returns an error: any failure rejects the entry with the fixed
    /// retry backoff, and callers re-poll the cache.
    pub async fn fetch_segment_on_cache_miss(
        &self,
        route_entry: &SharedRouteEntry,
        entry: &SharedSegmentEntry,
        key: &RouteCacheKey,
        path: &SegmentVaryPath,
        request_key: &str,
    ) {
        self.store.mark_segment_entry_pending(entry);
        if let Err(err) = self
            .fetch_segment(route_entry, entry, key, path, request_key)
            .await
        {
            log_fetch_failure("segment prefetch", &err);
            self.store.reject_segment_entry(self.now(), entry);
        }
    }

    async fn fetch_segment(
        &self,
        route_entry: &SharedRouteEntry,
        entry: &SharedSegmentEntry,
        key: &RouteCacheKey,
        path: &SegmentVaryPath,
        request_key: &str,
    ) -> Result<(), FetchError> {
        let (canonical_url, route_stale_at) = {
            let guard = route_entry.lock().unwrap();
            let fulfilled = guard.fulfilled().ok_or_else(|| {
                FetchError::Protocol("segment fetch issued without a fulfilled route".to_string())
            })?;
            (fulfilled.canonical_url.clone(), guard.stale_at())
        };
        let strategy = entry.lock().unwrap().fetch_strategy();

        let mut response = if self.store.config().static_export {
            let url = static_export_segment_url(&pathname_of(&canonical_url), request_key);
            self.transport.fetch(FetchRequest::get(url)).await?
        } else {
            let mut request =
                FetchRequest::get(&canonical_url).header(SEGMENT_REQUEST_HEADER, request_key);
            request = match strategy {
                FetchStrategy::LoadingBoundary | FetchStrategy::Ppr => {
                    request.header(PREFETCH_MODE_HEADER, PREFETCH_MODE_SHELL)
                }
                FetchStrategy::PprRuntime => {
                    request.header(PREFETCH_MODE_HEADER, PREFETCH_MODE_RUNTIME)
                }
                FetchStrategy::Full => request,
            };
            if let Some(next_url) = &key.next_url {
                request = request.header(NAV_URL_HEADER, next_url);
            }
            self.transport.fetch(request).await?
        };
        self.validate_response(&response)?;
        let body = response.take_body().ok_or(FetchError::MissingBody)?;

        // Attribute bytes as they stream in; the final total sticks.
        let body = {
            let store = Arc::clone(&self.store);
            let sized_path = path.clone();
            let sized_entry = Arc::clone(entry);
            count_bytes(body, move |total| {
                store.set_segment_entry_size(&sized_path, &sized_entry, total);
            })
        };

        let (marker, body) = if strategy == FetchStrategy::PprRuntime {
            strip_stage_marker(body).await?
        } else {
            (None, body)
        };
        let payload = self.decoder.decode_segment(body).await?;
        let is_partial = match marker {
            Some(StageMarker::Partial) => true,
            Some(StageMarker::Complete) => false,
            None => payload.is_partial,
        };

        let now = self.now();
        let stale_at = match strategy {
            FetchStrategy::Full => route_stale_at.min(now + self.store.config().dynamic_stale_ms),
            _ => route_stale_at,
        };
        self.store
            .fulfill_segment_entry(entry, payload.rsc.clone(), is_partial, stale_at);

        // Once the server reports the params this segment actually depends
        // on, share the entry across all values of the other params.
        if self.store.config().vary_params {
            if let Some(vary) = &payload.vary_params {
                let refined = fulfilled_segment_vary_path(path, vary);
                if &refined != path {
                    tracing::debug!(from = %path, to = %refined, "re-keying segment to param-filtered path");
                    self.store.upsert_segment_entry(now, &refined, entry);
                }
            }
        }
        Ok(())
    }

    /// Fetch several pending segments with one dynamic request.
    ///
    /// Entries in `spawned` belong to this call. Segments the response
    /// carries seed data for are fulfilled; everything else this fetch
    /// spawned is rejected with the fixed backoff, because a segment the
    /// server deliberately omitted (it sits behind a loading boundary) must
    /// not be retried as if it were still in flight.
    pub async fn fetch_segments_using_dynamic_request(
        &self,
        key: &RouteCacheKey,
        route_entry: &SharedRouteEntry,
        spawned: SpawnedEntries,
    ) {
        for (_, entry) in spawned.iter() {
            self.store.mark_segment_entry_pending(entry);
        }
        if let Err(err) = self.fetch_dynamic(key, route_entry, &spawned).await {
            log_fetch_failure("dynamic segment prefetch", &err);
        }
        let now = self.now();
        for (_, entry) in spawned.iter() {
            if entry.lock().unwrap().is_pending() {
                self.store.reject_segment_entry(now, entry);
            }
        }
    }

    async fn fetch_dynamic(
        &self,
        key: &RouteCacheKey,
        route_entry: &SharedRouteEntry,
        spawned: &SpawnedEntries,
    ) -> Result<(), FetchError> {
        let (canonical_url, tree, metadata_path, route_stale_at) = {
            let guard = route_entry.lock().unwrap();
            let fulfilled = guard.fulfilled().ok_or_else(|| {
                FetchError::Protocol("dynamic fetch issued without a fulfilled route".to_string())
            })?;
            (
                fulfilled.canonical_url.clone(),
                Arc::clone(&fulfilled.tree),
                fulfilled.metadata.vary_path().clone(),
                guard.stale_at(),
            )
        };

        // When only the head is still pending, a minimal request tree spares
        // the server from re-rendering segments we already have.
        let head_only = spawned.len() == 1 && spawned.get(&metadata_path).is_some();
        let request_state = if head_only {
            let mut state = route_tree_to_router_state(&tree);
            state.parallel.clear();
            state
        } else {
            route_tree_to_router_state(&tree)
        };
        let state_json = serde_json::to_string(&request_state)
            .map_err(|e| FetchError::Protocol(e.to_string()))?;

        let mut request =
            FetchRequest::get(&canonical_url).header(ROUTER_STATE_HEADER, state_json);
        if let Some(next_url) = &key.next_url {
            request = request.header(NAV_URL_HEADER, next_url);
        }
        let mut response = self.transport.fetch(request).await?;
        self.validate_response(&response)?;
        let body = response.take_body().ok_or(FetchError::MissingBody)?;

        // Exact per-segment sizes are unknowable until the stream resolves;
        // split the bytes-so-far evenly across everything this request
        // spawned.
        let body = {
            let store = Arc::clone(&self.store);
            let shares: Vec<(SegmentVaryPath, SharedSegmentEntry)> = spawned
                .iter()
                .map(|(path, entry)| (path.clone(), Arc::clone(entry)))
                .collect();
            count_bytes(body, move |total| {
                let share = total / shares.len().max(1);
                for (path, entry) in &shares {
                    store.set_segment_entry_size(path, entry, share);
                }
            })
        };

        let payload = self.decoder.decode_dynamic(body).await?;
        let now = self.now();
        let stale_at = route_stale_at.min(now + self.store.config().dynamic_stale_ms);
        for seed in &payload.seeds {
            self.write_seed_into_cache(now, &tree, &metadata_path, spawned, seed, stale_at)?;
        }
        Ok(())
    }

    /// Locate the node a seed belongs to and write its payload in.
    fn write_seed_into_cache(
        &self,
        now: u64,
        tree: &Arc<RouteTree>,
        metadata_path: &SegmentVaryPath,
        spawned: &SpawnedEntries,
        seed: &DynamicSeed,
        stale_at: u64,
    ) -> Result<(), FetchError> {
        let path = if seed.is_head {
            metadata_path.clone()
        } else {
            let mut node = tree;
            for slot in &seed.path {
                node = node.slot(slot).ok_or_else(|| {
                    FetchError::Protocol(format!("seed path names unknown slot `{slot}`"))
                })?;
            }
            node.vary_path().clone()
        };
        self.fulfill_entry_spawned_by_runtime_prefetch(
            now,
            spawned,
            &path,
            seed.rsc.clone(),
            seed.is_partial,
            stale_at,
        );
        Ok(())
    }

    /// Write a result into an entry only if this fetch owns it; otherwise
    /// build a detached candidate and let the precedence check decide.
    fn fulfill_entry_spawned_by_runtime_prefetch(
        &self,
        now: u64,
        spawned: &SpawnedEntries,
        path: &SegmentVaryPath,
        rsc: Option<RscNode>,
        is_partial: bool,
        stale_at: u64,
    ) {
        if let Some(entry) = spawned.get(path) {
            self.store
                .fulfill_segment_entry(entry, rsc, is_partial, stale_at);
            return;
        }
        let candidate = SegmentCacheEntry::detached_fulfilled(
            FetchStrategy::Full,
            rsc,
            is_partial,
            stale_at,
            self.store.segment_cache_version(),
        );
        if self.store.upsert_segment_entry(now, path, &candidate) == UpsertOutcome::Rejected {
            tracing::debug!(path = %path, "unowned dynamic seed lost to a more complete entry");
        }
    }

    /// Fulfill a fully dynamic prefetch from the back/forward cache,
    /// skipping the network entirely. Returns whether it succeeded.
    pub fn attempt_to_fulfill_dynamic_segment_from_bfcache(
        &self,
        path: &SegmentVaryPath,
        entry: &SharedSegmentEntry,
    ) -> bool {
        let Some(bfcache) = &self.bfcache else {
            return false;
        };
        self.store
            .attempt_to_fulfill_segment_from_bfcache(self.now(), bfcache.as_ref(), path, entry)
    }
}
