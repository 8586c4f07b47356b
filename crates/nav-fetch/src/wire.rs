//! Wire formats for navigation payloads.
//!
//! Two route formats coexist: the compact tree-prefetch format served when
//! the per-segment pathway is enabled, and the legacy router-state format
//! served otherwise. Segment bodies carry an opaque render payload plus
//! completeness metadata.

use std::collections::BTreeMap;

use nav_core::{ParamType, ParamValue, RscNode};
use serde::{Deserialize, Serialize};

/// A segment as it appears on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum WireSegment {
    /// Literal segment.
    Static(String),
    /// Dynamic segment. `value` is omitted when the client can recover it
    /// positionally from the URL.
    Param {
        name: String,
        param_type: ParamType,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        value: Option<ParamValue>,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        siblings: Vec<String>,
    },
}

/// One node of a tree-prefetch payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireTreeNode {
    pub segment: WireSegment,
    /// Child branches keyed by parallel-route name; absent on leaves,
    /// which are page nodes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub slots: Option<BTreeMap<String, WireTreeNode>>,
    #[serde(default)]
    pub is_root_layout: bool,
    #[serde(default)]
    pub has_loading: bool,
    #[serde(default)]
    pub instant_prefetch: bool,
}

/// Route response in the tree-prefetch format.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RouteTreePayload {
    pub tree: WireTreeNode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub head: Option<RscNode>,
    #[serde(default)]
    pub is_head_partial: bool,
    /// Server-provided freshness override, in milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stale_time_ms: Option<u64>,
}

/// Marks an inactive parallel branch and remembers the URL that rendered
/// it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RefreshMarker {
    pub canonical_url: String,
}

/// The legacy serialized router state.
///
/// Unlike the tree-prefetch format, param values are always inline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RouterState {
    pub segment: WireSegment,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub parallel: BTreeMap<String, RouterState>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh: Option<RefreshMarker>,
    #[serde(default)]
    pub is_root_layout: bool,
}

/// Route response in the legacy format.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LegacyRoutePayload {
    pub state: RouterState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub head: Option<RscNode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stale_time_ms: Option<u64>,
}

/// Decoded route response, either format.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RoutePayload {
    /// Per-segment pathway enabled.
    Tree(RouteTreePayload),
    /// Legacy pathway.
    Legacy(LegacyRoutePayload),
}

/// Per-segment prefetch response body, after any stage marker has been
/// stripped.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SegmentPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rsc: Option<RscNode>,
    #[serde(default)]
    pub is_partial: bool,
    /// Params this segment's content actually depends on, when the server
    /// reports them.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vary_params: Option<Vec<String>>,
}

/// One seed of a dynamic multi-segment response.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DynamicSeed {
    /// Slot names from the route root to the owning node. Empty for the
    /// root segment itself.
    #[serde(default)]
    pub path: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rsc: Option<RscNode>,
    #[serde(default)]
    pub is_partial: bool,
    /// Seed for the route's metadata/head rather than a tree node.
    #[serde(default)]
    pub is_head: bool,
}

/// Dynamic multi-segment response body.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DynamicPayload {
    #[serde(default)]
    pub seeds: Vec<DynamicSeed>,
}
