//! Converters between the wire formats and the route tree.
//!
//! Both route formats walk the same way: top-down, threading a vary-path
//! builder that accumulates request-key steps and dynamic-param values, and
//! visiting the primary slot before the rest so recomputed walks are
//! deterministic. The tree-prefetch format additionally recovers omitted
//! param values positionally from the URL.

use std::collections::BTreeMap;
use std::sync::Arc;

use nav_core::{
    ParamType, ParamValue, PrefetchHints, RefreshState, RouteCacheKey, RouteTree, SegmentValue,
    SegmentVaryPath, SegmentVaryPathBuilder, TreeKind, PRIMARY_SLOT,
};

use crate::wire::{RefreshMarker, RouterState, WireSegment, WireTreeNode};

/// Error type for wire-to-tree conversion. These indicate a protocol
/// mismatch between server and client, not a transient condition.
#[derive(Debug, thiserror::Error)]
pub enum ConvertError {
    /// A required param had no inline value and could not be recovered
    /// from the URL.
    #[error("required param `{0}` could not be resolved")]
    UnresolvedParam(String),

    /// The payload contains no page node to derive metadata from.
    #[error("route has no page node")]
    NoPageNode,
}

/// A converted route: the tree plus the metadata/head node, which is kept
/// in tree shape so readers traverse both uniformly.
#[derive(Debug, Clone)]
pub struct ConvertedRoute {
    pub tree: Arc<RouteTree>,
    pub metadata: Arc<RouteTree>,
}

fn metadata_node(vary_path: SegmentVaryPath) -> Arc<RouteTree> {
    Arc::new(RouteTree {
        request_key: "/_head".to_string(),
        segment: SegmentValue::Static("_head".to_string()),
        refresh_state: None,
        slots: None,
        kind: TreeKind::Page { vary_path },
        hints: PrefetchHints::new(),
    })
}

fn child_request_key(parent: &str, step: &str) -> String {
    format!("{}/{}", parent.trim_end_matches('/'), step)
}

/// Whether a literal segment occupies a position in the URL. Route groups
/// and the empty root segment are structural only.
fn consumes_pathname(segment: &str) -> bool {
    !(segment.is_empty() || (segment.starts_with('(') && segment.ends_with(')')))
}

fn wire_hints(node: &WireTreeNode) -> PrefetchHints {
    let mut hints = PrefetchHints::new();
    if node.is_root_layout {
        hints = hints.with_root_layout();
    }
    if node.has_loading {
        hints = hints.with_loading_boundary();
    }
    if node.instant_prefetch {
        hints = hints.with_instant_prefetch();
    }
    hints
}

/// Resolve a URL-visible param positionally against the pathname.
fn resolve_url_param(
    name: &str,
    param_type: ParamType,
    url_segments: &[&str],
    pos: usize,
) -> Result<(ParamValue, usize), ConvertError> {
    match param_type {
        ParamType::Dynamic => match url_segments.get(pos) {
            Some(segment) => Ok((ParamValue::Single((*segment).to_string()), pos + 1)),
            None => Err(ConvertError::UnresolvedParam(name.to_string())),
        },
        ParamType::CatchAll => {
            if pos >= url_segments.len() {
                return Err(ConvertError::UnresolvedParam(name.to_string()));
            }
            let rest = url_segments[pos..].iter().map(|s| s.to_string()).collect();
            Ok((ParamValue::Segments(rest), url_segments.len()))
        }
        ParamType::OptionalCatchAll => {
            let rest = url_segments[pos..].iter().map(|s| s.to_string()).collect();
            Ok((ParamValue::Segments(rest), url_segments.len()))
        }
        ParamType::Intercepted => Err(ConvertError::UnresolvedParam(name.to_string())),
    }
}

/// Walk child slots primary-first, mirroring `RouteTree::visit_slots`.
fn ordered_slots<T>(slots: &BTreeMap<String, T>) -> impl Iterator<Item = (&String, &T)> {
    let primary = slots.get_key_value(PRIMARY_SLOT);
    primary
        .into_iter()
        .chain(slots.iter().filter(|(name, _)| name.as_str() != PRIMARY_SLOT))
}

/// Convert a tree-prefetch payload into a route tree.
///
/// Side effect of the walk: the first page node encountered in traversal
/// order donates the metadata vary path, an arbitrary but deterministic
/// choice among parallel pages.
pub fn tree_prefetch_to_route_tree(
    wire: &WireTreeNode,
    key: &RouteCacheKey,
) -> Result<ConvertedRoute, ConvertError> {
    let url_segments: Vec<&str> = key
        .pathname
        .split('/')
        .filter(|s| !s.is_empty())
        .collect();
    let mut metadata = None;
    let tree = convert_prefetch_node(
        wire,
        &SegmentVaryPathBuilder::root(),
        "",
        &url_segments,
        0,
        &key.search,
        &mut metadata,
    )?;
    let metadata = metadata.ok_or(ConvertError::NoPageNode)?;
    Ok(ConvertedRoute {
        tree,
        metadata: metadata_node(metadata),
    })
}

fn convert_prefetch_node(
    wire: &WireTreeNode,
    parent_builder: &SegmentVaryPathBuilder,
    parent_request_key: &str,
    url_segments: &[&str],
    pos: usize,
    search: &str,
    metadata: &mut Option<SegmentVaryPath>,
) -> Result<Arc<RouteTree>, ConvertError> {
    let (segment, builder, pos) = match &wire.segment {
        WireSegment::Static(name) => {
            let pos = if consumes_pathname(name) { pos + 1 } else { pos };
            // The empty root segment is structural; it contributes no step.
            let builder = if name.is_empty() {
                parent_builder.clone()
            } else {
                parent_builder.descend(name)
            };
            (SegmentValue::Static(name.clone()), builder, pos)
        }
        WireSegment::Param {
            name,
            param_type,
            value,
            siblings,
        } => {
            let (value, pos) = match value {
                Some(value) => {
                    // Inline values still occupy their URL position.
                    let pos = if param_type.is_url_visible() && !param_type.is_catch_all() {
                        pos + 1
                    } else if param_type.is_catch_all() {
                        url_segments.len()
                    } else {
                        pos
                    };
                    (value.clone(), pos)
                }
                None => resolve_url_param(name, *param_type, url_segments, pos)?,
            };
            let builder = parent_builder.descend_param(name, &value.cache_key());
            (
                SegmentValue::Dynamic {
                    name: name.clone(),
                    value,
                    param_type: *param_type,
                    siblings: siblings.clone(),
                },
                builder,
                pos,
            )
        }
    };
    let request_key = child_request_key(parent_request_key, &segment.request_step());

    let (slots, kind) = match &wire.slots {
        None => {
            let vary_path = builder.finalize_page(search);
            if metadata.is_none() {
                *metadata = Some(builder.finalize_metadata(search));
            }
            (None, TreeKind::Page { vary_path })
        }
        Some(wire_slots) => {
            let mut slots = BTreeMap::new();
            for (name, child) in ordered_slots(wire_slots) {
                let child = convert_prefetch_node(
                    child,
                    &builder,
                    &request_key,
                    url_segments,
                    pos,
                    search,
                    metadata,
                )?;
                slots.insert(name.clone(), child);
            }
            (
                Some(slots),
                TreeKind::Layout {
                    vary_path: builder.finalize_layout(),
                },
            )
        }
    };

    Ok(Arc::new(RouteTree {
        request_key,
        segment,
        refresh_state: None,
        slots,
        kind,
        hints: wire_hints(wire),
    }))
}

/// Convert a legacy router state into a route tree.
///
/// Param values are always inline in this format. A refresh marker on a
/// branch restores the search string that rendered it; the ambient search
/// inherited from the parent would be wrong for that branch.
pub fn router_state_to_route_tree(
    state: &RouterState,
    key: &RouteCacheKey,
) -> Result<ConvertedRoute, ConvertError> {
    let mut metadata = None;
    let tree = convert_state_node(
        state,
        &SegmentVaryPathBuilder::root(),
        "",
        &key.search,
        &mut metadata,
    )?;
    let metadata = metadata.ok_or(ConvertError::NoPageNode)?;
    Ok(ConvertedRoute {
        tree,
        metadata: metadata_node(metadata),
    })
}

fn search_of_url(url: &str) -> String {
    url.split_once('?')
        .map(|(_, search)| format!("?{search}"))
        .unwrap_or_default()
}

fn convert_state_node(
    state: &RouterState,
    parent_builder: &SegmentVaryPathBuilder,
    parent_request_key: &str,
    ambient_search: &str,
    metadata: &mut Option<SegmentVaryPath>,
) -> Result<Arc<RouteTree>, ConvertError> {
    let refresh_state = state.refresh.as_ref().map(|marker| RefreshState {
        canonical_url: marker.canonical_url.clone(),
        rendered_search: search_of_url(&marker.canonical_url),
    });
    let search = refresh_state
        .as_ref()
        .map(|r| r.rendered_search.clone())
        .unwrap_or_else(|| ambient_search.to_string());

    let (segment, builder) = match &state.segment {
        WireSegment::Static(name) => {
            let builder = if name.is_empty() {
                parent_builder.clone()
            } else {
                parent_builder.descend(name)
            };
            (SegmentValue::Static(name.clone()), builder)
        }
        WireSegment::Param {
            name,
            param_type,
            value,
            siblings,
        } => {
            let value = value
                .clone()
                .ok_or_else(|| ConvertError::UnresolvedParam(name.clone()))?;
            let builder = parent_builder.descend_param(name, &value.cache_key());
            (
                SegmentValue::Dynamic {
                    name: name.clone(),
                    value,
                    param_type: *param_type,
                    siblings: siblings.clone(),
                },
                builder,
            )
        }
    };
    let request_key = child_request_key(parent_request_key, &segment.request_step());

    let (slots, kind) = if state.parallel.is_empty() {
        let vary_path = builder.finalize_page(&search);
        if metadata.is_none() {
            *metadata = Some(builder.finalize_metadata(&search));
        }
        (None, TreeKind::Page { vary_path })
    } else {
        let mut slots = BTreeMap::new();
        for (name, child) in ordered_slots(&state.parallel) {
            let child = convert_state_node(child, &builder, &request_key, &search, metadata)?;
            slots.insert(name.clone(), child);
        }
        (
            Some(slots),
            TreeKind::Layout {
                vary_path: builder.finalize_layout(),
            },
        )
    };

    let mut hints = PrefetchHints::new();
    if state.is_root_layout {
        hints = hints.with_root_layout();
    }

    Ok(Arc::new(RouteTree {
        request_key,
        segment,
        refresh_state,
        slots,
        kind,
        hints,
    }))
}

enum Resolution {
    Node(Arc<RouteTree>),
    /// An optional catch-all was legitimately absent; the subtree is
    /// omitted without failing the whole resolution.
    Stop,
}

/// Splice a previously cached branch in under a new parent.
///
/// Used when a parallel-route slot is not part of the navigation target:
/// the old state supplies segment values, but vary paths must be re-derived
/// relative to the new position. Param placeholders resolve against
/// `params`; a missing optional catch-all stops traversal for that subtree,
/// while a missing required param fails the whole resolution with `None`.
pub fn reused_router_state_to_route_tree(
    state: &RouterState,
    parent_builder: &SegmentVaryPathBuilder,
    parent_request_key: &str,
    ambient_search: &str,
    params: &BTreeMap<String, ParamValue>,
) -> Option<Arc<RouteTree>> {
    match convert_reused_node(
        state,
        parent_builder,
        parent_request_key,
        ambient_search,
        params,
    ) {
        Ok(Resolution::Node(tree)) => Some(tree),
        Ok(Resolution::Stop) | Err(()) => None,
    }
}

fn convert_reused_node(
    state: &RouterState,
    parent_builder: &SegmentVaryPathBuilder,
    parent_request_key: &str,
    ambient_search: &str,
    params: &BTreeMap<String, ParamValue>,
) -> Result<Resolution, ()> {
    let refresh_state = state.refresh.as_ref().map(|marker| RefreshState {
        canonical_url: marker.canonical_url.clone(),
        rendered_search: search_of_url(&marker.canonical_url),
    });
    let search = refresh_state
        .as_ref()
        .map(|r| r.rendered_search.clone())
        .unwrap_or_else(|| ambient_search.to_string());

    let (segment, builder) = match &state.segment {
        WireSegment::Static(name) => {
            let builder = if name.is_empty() {
                parent_builder.clone()
            } else {
                parent_builder.descend(name)
            };
            (SegmentValue::Static(name.clone()), builder)
        }
        WireSegment::Param {
            name,
            param_type,
            value,
            siblings,
        } => {
            let value = match value.clone().or_else(|| params.get(name).cloned()) {
                Some(value) => value,
                None if param_type.is_optional() => return Ok(Resolution::Stop),
                None => return Err(()),
            };
            let builder = parent_builder.descend_param(name, &value.cache_key());
            (
                SegmentValue::Dynamic {
                    name: name.clone(),
                    value,
                    param_type: *param_type,
                    siblings: siblings.clone(),
                },
                builder,
            )
        }
    };
    let request_key = child_request_key(parent_request_key, &segment.request_step());

    let (slots, kind) = if state.parallel.is_empty() {
        (
            None,
            TreeKind::Page {
                vary_path: builder.finalize_page(&search),
            },
        )
    } else {
        let mut slots = BTreeMap::new();
        for (name, child) in ordered_slots(&state.parallel) {
            match convert_reused_node(child, &builder, &request_key, &search, params)? {
                Resolution::Node(child) => {
                    slots.insert(name.clone(), child);
                }
                Resolution::Stop => {}
            }
        }
        if slots.is_empty() {
            (
                None,
                TreeKind::Page {
                    vary_path: builder.finalize_page(&search),
                },
            )
        } else {
            (
                Some(slots),
                TreeKind::Layout {
                    vary_path: builder.finalize_layout(),
                },
            )
        }
    };

    let mut hints = PrefetchHints::new();
    if state.is_root_layout {
        hints = hints.with_root_layout();
    }

    Ok(Resolution::Node(Arc::new(RouteTree {
        request_key,
        segment,
        refresh_state,
        slots,
        kind,
        hints,
    })))
}

/// Hand a cached tree back to a renderer that expects the legacy shape.
/// The inverse of [`router_state_to_route_tree`], metadata aside.
pub fn route_tree_to_router_state(tree: &RouteTree) -> RouterState {
    let segment = match &tree.segment {
        SegmentValue::Static(name) => WireSegment::Static(name.clone()),
        SegmentValue::Dynamic {
            name,
            value,
            param_type,
            siblings,
        } => WireSegment::Param {
            name: name.clone(),
            param_type: *param_type,
            value: Some(value.clone()),
            siblings: siblings.clone(),
        },
    };
    let parallel = tree
        .slots
        .as_ref()
        .map(|slots| {
            slots
                .iter()
                .map(|(name, child)| (name.clone(), route_tree_to_router_state(child)))
                .collect()
        })
        .unwrap_or_default();
    RouterState {
        segment,
        parallel,
        refresh: tree.refresh_state.as_ref().map(|r| RefreshMarker {
            canonical_url: r.canonical_url.clone(),
        }),
        is_root_layout: tree.hints.is_root_layout(),
    }
}
