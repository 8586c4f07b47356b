//! The in-memory route tree.
//!
//! A `RouteTree` is the static shape of a page: its nested layouts, the page
//! node itself, and any parallel-route branches. Nodes are immutable; the
//! tree is rebuilt per fetch, never mutated in place.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::{PrefetchHints, SegmentVaryPath};

/// Name of the primary slot present in every non-leaf node.
pub const PRIMARY_SLOT: &str = "children";

/// Resolved value of a dynamic route param.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParamValue {
    /// A single pathname segment.
    Single(String),
    /// The trailing segments matched by a catch-all.
    Segments(Vec<String>),
}

impl ParamValue {
    /// The param's contribution to a vary path.
    pub fn cache_key(&self) -> String {
        match self {
            Self::Single(v) => crate::vary::escape_step(v),
            Self::Segments(parts) => parts
                .iter()
                .map(|p| crate::vary::escape_step(p))
                .collect::<Vec<_>>()
                .join("/"),
        }
    }
}

/// How a dynamic segment binds to the URL.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParamType {
    /// Matches exactly one pathname segment.
    Dynamic,
    /// Matches one or more trailing segments.
    CatchAll,
    /// Matches zero or more trailing segments.
    OptionalCatchAll,
    /// Bound by the interception context rather than the pathname.
    Intercepted,
}

impl ParamType {
    /// Whether the param's value can be recovered positionally from the URL.
    pub fn is_url_visible(&self) -> bool {
        !matches!(self, Self::Intercepted)
    }

    /// Whether the param consumes all trailing pathname segments.
    pub fn is_catch_all(&self) -> bool {
        matches!(self, Self::CatchAll | Self::OptionalCatchAll)
    }

    /// Whether the param may legitimately match nothing.
    pub fn is_optional(&self) -> bool {
        matches!(self, Self::OptionalCatchAll)
    }
}

/// A node's segment identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SegmentValue {
    /// Plain literal segment.
    Static(String),
    /// Dynamic or catch-all segment with its resolved value.
    Dynamic {
        name: String,
        value: ParamValue,
        param_type: ParamType,
        /// Param names defined by sibling parallel routes at this level.
        siblings: Vec<String>,
    },
}

impl SegmentValue {
    /// The value-free step this segment contributes to a request key.
    pub fn request_step(&self) -> String {
        match self {
            Self::Static(s) => s.clone(),
            Self::Dynamic {
                name, param_type, ..
            } => match param_type {
                ParamType::Dynamic => format!("[{name}]"),
                ParamType::CatchAll => format!("[...{name}]"),
                ParamType::OptionalCatchAll => format!("[[...{name}]]"),
                ParamType::Intercepted => format!("[~{name}]"),
            },
        }
    }
}

/// Rendered-query bookkeeping for an inactive parallel branch.
///
/// Inactive branches were rendered under an earlier URL; their pages must
/// keep varying on the search string that produced them, not the ambient
/// one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefreshState {
    /// The URL the branch was rendered for.
    pub canonical_url: String,
    /// The search string of that URL.
    pub rendered_search: String,
}

/// Discriminates page nodes, whose cache key varies on the rendered search,
/// from layout nodes, whose key does not.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TreeKind {
    Page { vary_path: SegmentVaryPath },
    Layout { vary_path: SegmentVaryPath },
}

/// One node of a route tree.
#[derive(Debug, Clone, PartialEq)]
pub struct RouteTree {
    /// Path-like identifier used both to request this node from the server
    /// and to derive child identifiers.
    pub request_key: String,
    /// The node's segment identity.
    pub segment: SegmentValue,
    /// Present only on inactive parallel branches.
    pub refresh_state: Option<RefreshState>,
    /// Child branches keyed by parallel-route name; `None` for leaves. The
    /// `"children"` slot is the primary chain.
    pub slots: Option<BTreeMap<String, Arc<RouteTree>>>,
    /// Page/layout discriminant carrying the node's vary path.
    pub kind: TreeKind,
    /// Router-relevant metadata propagated from the server.
    pub hints: PrefetchHints,
}

impl RouteTree {
    /// The node's cache key.
    pub fn vary_path(&self) -> &SegmentVaryPath {
        match &self.kind {
            TreeKind::Page { vary_path } | TreeKind::Layout { vary_path } => vary_path,
        }
    }

    /// Whether this node is a page.
    pub fn is_page(&self) -> bool {
        matches!(self.kind, TreeKind::Page { .. })
    }

    /// Child slots in canonical traversal order: the primary slot first,
    /// then the rest in sorted order. Recomputed walks over rebuilt trees
    /// visit nodes in the same order.
    pub fn visit_slots(&self) -> impl Iterator<Item = (&str, &Arc<RouteTree>)> {
        let slots = self.slots.as_ref();
        let primary = slots
            .and_then(|s| s.get(PRIMARY_SLOT))
            .map(|child| (PRIMARY_SLOT, child));
        let rest = slots
            .into_iter()
            .flat_map(|s| s.iter())
            .filter(|(name, _)| name.as_str() != PRIMARY_SLOT)
            .map(|(name, child)| (name.as_str(), child));
        primary.into_iter().chain(rest)
    }

    /// Look up a child branch by slot name.
    pub fn slot(&self, name: &str) -> Option<&Arc<RouteTree>> {
        self.slots.as_ref()?.get(name)
    }

    /// Clone the tree substituting a new rendered search into every page
    /// vary path. Branches carrying a refresh state keep the search they
    /// were rendered under.
    pub fn with_search(&self, search: &str) -> RouteTree {
        let kind = match &self.kind {
            TreeKind::Page { vary_path } if self.refresh_state.is_none() => TreeKind::Page {
                vary_path: substitute_search(vary_path, search),
            },
            other => other.clone(),
        };
        let slots = self.slots.as_ref().map(|slots| {
            slots
                .iter()
                .map(|(name, child)| {
                    let child = if child.refresh_state.is_some() {
                        Arc::clone(child)
                    } else {
                        Arc::new(child.with_search(search))
                    };
                    (name.clone(), child)
                })
                .collect()
        });
        RouteTree {
            request_key: self.request_key.clone(),
            segment: self.segment.clone(),
            refresh_state: self.refresh_state.clone(),
            slots,
            kind,
            hints: self.hints,
        }
    }

    /// Approximate in-memory weight, used for the cache map's byte budget
    /// before any payload sizes are known.
    pub fn estimated_size(&self) -> usize {
        let mut size = 64 + self.request_key.len() + self.vary_path().as_str().len();
        if let Some(slots) = &self.slots {
            for (name, child) in slots {
                size += name.len() + child.estimated_size();
            }
        }
        size
    }
}

/// Replace the search component of a finalized page or metadata vary path.
///
/// Finalizers are the only producers of `?` in a key, so splitting on the
/// first `?` recovers the search-free base exactly.
pub fn substitute_search(path: &SegmentVaryPath, search: &str) -> SegmentVaryPath {
    let raw = path.as_str();
    let base = raw.split_once('?').map_or(raw, |(base, _)| base);
    let search = search.strip_prefix('?').unwrap_or(search);
    SegmentVaryPath::from_raw(format!("{base}?{search}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::SegmentVaryPathBuilder;

    fn leaf_page(request_key: &str, vary_path: SegmentVaryPath) -> Arc<RouteTree> {
        Arc::new(RouteTree {
            request_key: request_key.to_string(),
            segment: SegmentValue::Static("page".to_string()),
            refresh_state: None,
            slots: None,
            kind: TreeKind::Page { vary_path },
            hints: PrefetchHints::new(),
        })
    }

    #[test]
    fn test_visit_slots_primary_first() {
        let builder = SegmentVaryPathBuilder::root();
        let mut slots = BTreeMap::new();
        slots.insert(
            "aside".to_string(),
            leaf_page("/aside", builder.descend("aside").finalize_page("")),
        );
        slots.insert(
            PRIMARY_SLOT.to_string(),
            leaf_page("/page", builder.descend("page").finalize_page("")),
        );
        let root = RouteTree {
            request_key: "/".to_string(),
            segment: SegmentValue::Static("".to_string()),
            refresh_state: None,
            slots: Some(slots),
            kind: TreeKind::Layout {
                vary_path: builder.finalize_layout(),
            },
            hints: PrefetchHints::new().with_root_layout(),
        };
        let order: Vec<&str> = root.visit_slots().map(|(name, _)| name).collect();
        assert_eq!(order, vec![PRIMARY_SLOT, "aside"]);
    }

    #[test]
    fn test_with_search_rewrites_page_keys() {
        let builder = SegmentVaryPathBuilder::root().descend("shop");
        let page = leaf_page("/shop", builder.finalize_page("?sort=asc"));
        let rewritten = page.with_search("?sort=desc");
        assert_eq!(rewritten.vary_path().as_str(), "/shop?sort=desc");
    }

    #[test]
    fn test_with_search_preserves_refreshed_branches() {
        let builder = SegmentVaryPathBuilder::root().descend("modal");
        let mut branch = (*leaf_page("/modal", builder.finalize_page("?photo=3"))).clone();
        branch.refresh_state = Some(RefreshState {
            canonical_url: "/gallery?photo=3".to_string(),
            rendered_search: "?photo=3".to_string(),
        });
        let branch = Arc::new(branch);
        let rewritten = branch.with_search("?photo=9");
        assert_eq!(rewritten.vary_path().as_str(), "/modal?photo=3");
    }

    #[test]
    fn test_request_step_markers() {
        let dynamic = SegmentValue::Dynamic {
            name: "slug".to_string(),
            value: ParamValue::Single("a".to_string()),
            param_type: ParamType::Dynamic,
            siblings: Vec::new(),
        };
        assert_eq!(dynamic.request_step(), "[slug]");
        let catch_all = SegmentValue::Dynamic {
            name: "rest".to_string(),
            value: ParamValue::Segments(vec!["a".to_string(), "b".to_string()]),
            param_type: ParamType::OptionalCatchAll,
            siblings: Vec::new(),
        };
        assert_eq!(catch_all.request_step(), "[[...rest]]");
    }

    #[test]
    fn test_param_value_cache_key_escapes_separators() {
        let value = ParamValue::Single("a/b".to_string());
        assert_eq!(value.cache_key(), "a%2Fb");
        let parts = ParamValue::Segments(vec!["a".to_string(), "b".to_string()]);
        assert_eq!(parts.cache_key(), "a/b");
    }
}
