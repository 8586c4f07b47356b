//! Route-level cache key composition.

use serde::{Deserialize, Serialize};

/// Identifies a logical navigation target.
///
/// Not itself stored in any map; used to derive a [`RouteVaryPath`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RouteCacheKey {
    /// URL pathname, always beginning with `/`.
    pub pathname: String,
    /// Rendered search string, including the leading `?` when non-empty.
    pub search: String,
    /// Referring navigation context, when the page was reached under one.
    pub next_url: Option<String>,
}

impl RouteCacheKey {
    /// Create a key for a navigation target.
    pub fn new(
        pathname: impl Into<String>,
        search: impl Into<String>,
        next_url: Option<String>,
    ) -> Self {
        Self {
            pathname: pathname.into(),
            search: search.into(),
            next_url,
        }
    }

    /// The target URL without the navigation context.
    pub fn href(&self) -> String {
        format!("{}{}", self.pathname, self.search)
    }

    /// The same target with a different search string.
    pub fn with_search(&self, search: impl Into<String>) -> Self {
        Self {
            pathname: self.pathname.clone(),
            search: search.into(),
            next_url: self.next_url.clone(),
        }
    }
}

/// Canonical cache key for a route cache entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RouteVaryPath(String);

impl RouteVaryPath {
    /// Get the key string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for RouteVaryPath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Key used for the initial cache probe, before response headers reveal
/// whether the route is sensitive to the referring context.
pub fn route_vary_path(key: &RouteCacheKey) -> RouteVaryPath {
    fulfilled_route_vary_path(key, true)
}

/// Key used once interception sensitivity is known.
///
/// When the route cannot be intercepted the referring context is dropped, so
/// every client shares one entry for the same pathname and search.
pub fn fulfilled_route_vary_path(key: &RouteCacheKey, could_be_intercepted: bool) -> RouteVaryPath {
    let mut path = String::with_capacity(key.pathname.len() + key.search.len() + 1);
    path.push_str(&key.pathname);
    path.push_str(&key.search);
    if could_be_intercepted {
        if let Some(next_url) = &key.next_url {
            // NUL cannot appear in a URL, so the join is unambiguous.
            path.push('\u{0}');
            path.push_str(next_url);
        }
    }
    RouteVaryPath(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_href_joins_pathname_and_search() {
        let key = RouteCacheKey::new("/blog/hello", "?tab=1", None);
        assert_eq!(key.href(), "/blog/hello?tab=1");
    }

    #[test]
    fn test_probe_path_includes_next_url() {
        let key = RouteCacheKey::new("/a", "", Some("/feed".to_string()));
        let with = route_vary_path(&key);
        let without = route_vary_path(&RouteCacheKey::new("/a", "", None));
        assert_ne!(with, without);
    }

    #[test]
    fn test_fulfilled_path_drops_next_url_when_not_interceptable() {
        let a = RouteCacheKey::new("/a", "?q=1", Some("/feed".to_string()));
        let b = RouteCacheKey::new("/a", "?q=1", Some("/other".to_string()));
        assert_eq!(
            fulfilled_route_vary_path(&a, false),
            fulfilled_route_vary_path(&b, false)
        );
        assert_ne!(
            fulfilled_route_vary_path(&a, true),
            fulfilled_route_vary_path(&b, true)
        );
    }

    #[test]
    fn test_vary_path_is_deterministic() {
        let key = RouteCacheKey::new("/x/y", "?a=1&b=2", Some("/ctx".to_string()));
        assert_eq!(route_vary_path(&key), route_vary_path(&key));
    }
}
