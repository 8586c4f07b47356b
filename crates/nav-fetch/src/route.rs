//! Route-tree fetch orchestration.

use nav_cache::SharedRouteEntry;
use nav_core::{fulfilled_route_vary_path, route_vary_path, RouteCacheKey};

use crate::convert::{router_state_to_route_tree, tree_prefetch_to_route_tree, ConvertedRoute};
use crate::error::{log_fetch_failure, FetchError};
use crate::fetcher::PrefetchFetcher;
use crate::protocol::{
    static_export_tree_url, NAV_URL_HEADER, PREFETCH_MODE_HEADER, PREFETCH_MODE_SHELL,
    SEGMENT_REQUEST_HEADER, TREE_REQUEST_KEY,
};
use crate::transport::{FetchRequest, FetchResponse};
use crate::wire::RoutePayload;

/// Reduce a possibly absolute URL to its path-and-search form.
fn href_of_url(url: &str) -> String {
    if url.starts_with('/') {
        return url.to_string();
    }
    let after_scheme = url.split_once("://").map_or(url, |(_, rest)| rest);
    match after_scheme.find('/') {
        Some(idx) => after_scheme[idx..].to_string(),
        None => "/".to_string(),
    }
}

/// Path portion of an href.
pub(crate) fn pathname_of(href: &str) -> String {
    let href = href_of_url(href);
    href.split_once('?').map_or(href.clone(), |(path, _)| path.to_string())
}

impl PrefetchFetcher {
    /// Fetch the structural tree for `key` and resolve `entry` with it.
    ///
    /// Never returns an error: any failure rejects the entry with the fixed
    /// retry backoff, and callers re-poll the cache.
    pub async fn fetch_route_on_cache_miss(&self, entry: &SharedRouteEntry, key: &RouteCacheKey) {
        self.store.mark_route_entry_pending(entry);
        if let Err(err) = self.fetch_route(entry, key).await {
            log_fetch_failure("route prefetch", &err);
            self.store.reject_route_entry(self.now(), entry);
        }
    }

    async fn fetch_route(
        &self,
        entry: &SharedRouteEntry,
        key: &RouteCacheKey,
    ) -> Result<(), FetchError> {
        let mut response = if self.store.config().static_export {
            self.fetch_route_from_static_export(key).await?
        } else {
            let mut request = FetchRequest::get(key.href())
                .header(SEGMENT_REQUEST_HEADER, TREE_REQUEST_KEY)
                .header(PREFETCH_MODE_HEADER, PREFETCH_MODE_SHELL);
            if let Some(next_url) = &key.next_url {
                request = request.header(NAV_URL_HEADER, next_url);
            }
            self.transport.fetch(request).await?
        };
        self.validate_response(&response)?;
        let body = response.take_body().ok_or(FetchError::MissingBody)?;
        let payload = self.decoder.decode_route(body).await?;

        // Interception sensitivity is revealed by the response varying on
        // the navigation context.
        let could_be_intercepted = response
            .header("vary")
            .is_some_and(|vary| vary.to_ascii_lowercase().contains(NAV_URL_HEADER));
        let canonical_url = if response.redirected {
            href_of_url(&response.url)
        } else {
            key.href()
        };

        let (converted, is_ppr_enabled, stale_time_ms) = match &payload {
            RoutePayload::Tree(tree) => (
                tree_prefetch_to_route_tree(&tree.tree, key)?,
                true,
                tree.stale_time_ms,
            ),
            RoutePayload::Legacy(legacy) => (
                router_state_to_route_tree(&legacy.state, key)?,
                false,
                legacy.stale_time_ms,
            ),
        };

        self.discover_known_route(
            entry,
            key,
            converted,
            canonical_url,
            could_be_intercepted,
            is_ppr_enabled,
            stale_time_ms,
        );
        Ok(())
    }

    /// Static exports cannot branch on request headers, so the tree lives
    /// at a well-known path and redirects are resolved by a HEAD probe
    /// against the page URL first.
    async fn fetch_route_from_static_export(
        &self,
        key: &RouteCacheKey,
    ) -> Result<FetchResponse, FetchError> {
        let probe = self.transport.fetch(FetchRequest::head(key.href())).await?;
        if !probe.ok() {
            return Err(FetchError::Status(probe.status));
        }
        let resolved = href_of_url(&probe.url);
        let mut response = self
            .transport
            .fetch(FetchRequest::get(static_export_tree_url(&pathname_of(&resolved))))
            .await?;
        response.redirected = probe.redirected;
        response.url = resolved;
        Ok(response)
    }

    /// Record a freshly discovered route: dynamic-rewrite bookkeeping
    /// against the search-less template, fulfillment, and re-keying to the
    /// shareable canonical vary path when the route cannot be intercepted.
    #[allow(clippy::too_many_arguments)]
    fn discover_known_route(
        &self,
        entry: &SharedRouteEntry,
        key: &RouteCacheKey,
        converted: ConvertedRoute,
        canonical_url: String,
        could_be_intercepted: bool,
        is_ppr_enabled: bool,
        stale_time_ms: Option<u64>,
    ) {
        let now = self.now();
        if !key.search.is_empty() {
            self.check_rewrite_prediction(now, key, &canonical_url);
        }
        self.store.fulfill_route_entry(
            now,
            entry,
            converted.tree,
            converted.metadata,
            canonical_url,
            key.search.clone(),
            could_be_intercepted,
            is_ppr_enabled,
            stale_time_ms,
        );
        if !could_be_intercepted && key.next_url.is_some() {
            self.store
                .rekey_route_entry(&route_vary_path(key), &fulfilled_route_vary_path(key, false));
        }
        let final_path = fulfilled_route_vary_path(key, could_be_intercepted);
        let size = entry.lock().unwrap().size();
        self.store.set_route_entry_size(&final_path, entry, size);
    }

    /// If a search-less template exists for this pathname, check whether it
    /// would have predicted this response's canonical URL. A disagreement
    /// means rewrites here are search-sensitive: disqualify the template
    /// and drop segments derived from past predictions, since the flag
    /// alone is not retroactive.
    fn check_rewrite_prediction(&self, now: u64, key: &RouteCacheKey, canonical_url: &str) {
        let template_key = key.with_search("");
        let Some(template) = self.store.read_route_entry(now, &template_key) else {
            return;
        };
        let mispredicted = {
            let guard = template.lock().unwrap();
            guard.fulfilled().is_some_and(|f| {
                !f.has_dynamic_rewrite && pathname_of(&f.canonical_url) != pathname_of(canonical_url)
            })
        };
        if mispredicted {
            tracing::warn!(
                pathname = %key.pathname,
                "rewrite is search-sensitive; disabling optimistic predictions for this route"
            );
            self.store.mark_route_entry_as_dynamic_rewrite(&template);
            self.store
                .invalidate_segment_entries(key.next_url.as_deref(), None);
        }
    }
}
