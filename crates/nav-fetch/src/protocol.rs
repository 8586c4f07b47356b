//! Wire protocol constants.
//!
//! Request and response headers, marker bytes, and path schemes shared
//! between the fetch orchestration and the server.

/// Header carrying the serialized parent router state on dynamic requests.
pub const ROUTER_STATE_HEADER: &str = "x-nav-router-state";

/// Header identifying which tree node a per-segment request targets.
pub const SEGMENT_REQUEST_HEADER: &str = "x-nav-segment";

/// Segment-request value asking for the route's structural tree.
pub const TREE_REQUEST_KEY: &str = "/_tree";

/// Header selecting the prefetch mode. Absent means a full render.
pub const PREFETCH_MODE_HEADER: &str = "x-nav-prefetch";

/// Prefetch-mode value requesting the loading-boundary shell.
pub const PREFETCH_MODE_SHELL: &str = "1";

/// Prefetch-mode value requesting the runtime-flavored prerender.
pub const PREFETCH_MODE_RUNTIME: &str = "2";

/// Header disambiguating the interception context of the referring page.
pub const NAV_URL_HEADER: &str = "x-nav-url";

/// Header carrying the deployment id of the build that produced a response.
pub const DEPLOYMENT_ID_HEADER: &str = "x-nav-deployment-id";

/// Response header reporting how the render resolved.
pub const POSTPONED_HEADER: &str = "x-nav-postponed";

/// The render contains dynamic holes.
pub const POSTPONED_HAS_HOLES: &str = "1";

/// The response was served from the per-segment pathway.
pub const POSTPONED_PER_SEGMENT: &str = "2";

/// Content type of streamed navigation payloads.
pub const NAV_CONTENT_TYPE: &str = "text/x-nav-stream";

/// First byte of a runtime-prefetch body whose content still has holes.
pub const STAGE_MARKER_PARTIAL: u8 = 0x7e; // '~'

/// First byte of a runtime-prefetch body whose content is complete.
pub const STAGE_MARKER_COMPLETE: u8 = 0x23; // '#'

/// Directory under which static exports expose per-segment output.
pub const STATIC_EXPORT_DIR: &str = "__nav";

/// URL of a segment's prerendered output in a static export, where segment
/// identity must live in the path because there is no server to read
/// headers.
pub fn static_export_segment_url(pathname: &str, request_key: &str) -> String {
    let base = pathname.trim_end_matches('/');
    format!(
        "{base}/{STATIC_EXPORT_DIR}/{}.seg",
        encode_path_component(request_key)
    )
}

/// URL of a route's structural tree in a static export.
pub fn static_export_tree_url(pathname: &str) -> String {
    let base = pathname.trim_end_matches('/');
    format!("{base}/{STATIC_EXPORT_DIR}/tree.seg")
}

fn encode_path_component(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for byte in raw.bytes() {
        match byte {
            b'a'..=b'z' | b'A'..=b'Z' | b'0'..=b'9' | b'-' | b'_' | b'.' => out.push(byte as char),
            other => out.push_str(&format!("%{other:02X}")),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_static_export_urls_are_path_safe() {
        let url = static_export_segment_url("/blog/hello", "/blog/[slug]");
        assert_eq!(url, "/blog/hello/__nav/%2Fblog%2F%5Bslug%5D.seg");
        assert_eq!(static_export_tree_url("/"), "/__nav/tree.seg");
    }

    #[test]
    fn test_stage_markers_are_ascii_tilde_and_hash() {
        assert_eq!(STAGE_MARKER_PARTIAL, b'~');
        assert_eq!(STAGE_MARKER_COMPLETE, b'#');
    }
}
