//! Segment-level cache key composition.
//!
//! A segment's vary path captures everything its rendered content depends
//! on: the chain of request-key steps above it, the resolved value of every
//! dynamic param along that chain, and - for page and metadata nodes only -
//! the rendered search string.

use serde::{Deserialize, Serialize};

/// Canonical cache key for a segment cache entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SegmentVaryPath(String);

impl SegmentVaryPath {
    /// Get the key string.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub(crate) fn from_raw(raw: String) -> Self {
        Self(raw)
    }
}

impl std::fmt::Display for SegmentVaryPath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One component of a segment vary path.
#[derive(Debug, Clone, PartialEq, Eq)]
enum PathStep {
    /// A literal request-key step.
    Static(String),
    /// A dynamic param's contribution, derived from its resolved value.
    Param { name: String, value_key: String },
}

/// Incremental builder for segment vary paths, filled in top-down as the
/// route tree is walked.
///
/// Invariant: identical step sequences always finalize to identical key
/// strings. The finalizers are the only producers of `?` in a key, which is
/// what makes search substitution on a finalized key well-defined.
#[derive(Debug, Clone, Default)]
pub struct SegmentVaryPathBuilder {
    steps: Vec<PathStep>,
}

impl SegmentVaryPathBuilder {
    /// Builder positioned at the route root.
    pub fn root() -> Self {
        Self::default()
    }

    /// Extend the path with a literal request-key step.
    pub fn descend(&self, step: &str) -> Self {
        let mut steps = self.steps.clone();
        steps.push(PathStep::Static(step.to_string()));
        Self { steps }
    }

    /// Extend the path with a dynamic param's cache key.
    pub fn descend_param(&self, name: &str, value_key: &str) -> Self {
        let mut steps = self.steps.clone();
        steps.push(PathStep::Param {
            name: name.to_string(),
            value_key: value_key.to_string(),
        });
        Self { steps }
    }

    /// Key for a layout node. Layouts do not vary on the rendered search;
    /// their own params are already part of the step chain.
    pub fn finalize_layout(&self) -> SegmentVaryPath {
        SegmentVaryPath(self.render())
    }

    /// Key for a page node. Pages vary on the rendered search.
    pub fn finalize_page(&self, rendered_search: &str) -> SegmentVaryPath {
        SegmentVaryPath(format!("{}?{}", self.render(), strip_question(rendered_search)))
    }

    /// Key for the route's metadata/head node.
    pub fn finalize_metadata(&self, rendered_search: &str) -> SegmentVaryPath {
        SegmentVaryPath(format!(
            "{}/~metadata?{}",
            self.render(),
            strip_question(rendered_search)
        ))
    }

    /// Drop the value contribution of every param the server reported the
    /// segment does not depend on, so the entry is shared across all values
    /// of those params.
    pub fn filtered(&self, vary_params: &[String]) -> Self {
        let steps = self
            .steps
            .iter()
            .map(|step| match step {
                PathStep::Param { name, .. } if !vary_params.contains(name) => PathStep::Param {
                    name: name.clone(),
                    value_key: String::new(),
                },
                other => other.clone(),
            })
            .collect();
        Self { steps }
    }

    fn render(&self) -> String {
        if self.steps.is_empty() {
            return "/".to_string();
        }
        let mut out = String::new();
        for step in &self.steps {
            out.push('/');
            match step {
                PathStep::Static(s) => out.push_str(&escape_step(s)),
                PathStep::Param { name, value_key } => {
                    out.push('[');
                    out.push_str(&escape_step(name));
                    if !value_key.is_empty() {
                        out.push('=');
                        out.push_str(value_key);
                    }
                    out.push(']');
                }
            }
        }
        out
    }
}

/// Re-key a finalized path once the server reports which params the segment
/// actually depends on, dropping the value contribution of every other
/// param so the entry is shared across all their values.
///
/// Equivalent to rebuilding the path with a filtered builder; operating on
/// the finalized string is possible because the escaping guarantees `[`,
/// `]`, and `=` only appear as param delimiters before the search
/// separator.
pub fn fulfilled_segment_vary_path(
    base: &SegmentVaryPath,
    vary_params: &[String],
) -> SegmentVaryPath {
    let raw = base.as_str();
    let (path, search) = match raw.split_once('?') {
        Some((path, search)) => (path, Some(search)),
        None => (raw, None),
    };
    let escaped: Vec<String> = vary_params.iter().map(|p| escape_step(p)).collect();
    let mut out = String::with_capacity(raw.len());
    let mut rest = path;
    while let Some(start) = rest.find('[') {
        out.push_str(&rest[..=start]);
        rest = &rest[start + 1..];
        let end = rest.find(']').unwrap_or(rest.len());
        let inner = &rest[..end];
        match inner.split_once('=') {
            Some((name, _)) if !escaped.iter().any(|p| p == name) => out.push_str(name),
            _ => out.push_str(inner),
        }
        rest = &rest[end..];
    }
    out.push_str(rest);
    if let Some(search) = search {
        out.push('?');
        out.push_str(search);
    }
    SegmentVaryPath(out)
}

/// Escape a step so it cannot collide with the builder's own syntax.
pub(crate) fn escape_step(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        match c {
            '%' => out.push_str("%25"),
            '/' => out.push_str("%2F"),
            '?' => out.push_str("%3F"),
            '[' => out.push_str("%5B"),
            ']' => out.push_str("%5D"),
            '=' => out.push_str("%3D"),
            '~' => out.push_str("%7E"),
            _ => out.push(c),
        }
    }
    out
}

fn strip_question(search: &str) -> &str {
    search.strip_prefix('?').unwrap_or(search)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout_key_ignores_search() {
        let b = SegmentVaryPathBuilder::root().descend("blog");
        assert_eq!(b.finalize_layout().as_str(), "/blog");
    }

    #[test]
    fn test_page_key_includes_search() {
        let b = SegmentVaryPathBuilder::root().descend("blog");
        assert_eq!(b.finalize_page("?tab=1").as_str(), "/blog?tab=1");
        assert_eq!(b.finalize_page(""), b.finalize_page("?"));
    }

    #[test]
    fn test_param_contribution() {
        let b = SegmentVaryPathBuilder::root()
            .descend("blog")
            .descend_param("slug", "hello-world");
        assert_eq!(b.finalize_layout().as_str(), "/blog/[slug=hello-world]");
    }

    #[test]
    fn test_filtered_drops_unused_param_values() {
        let a = SegmentVaryPathBuilder::root()
            .descend_param("locale", "en")
            .descend("pricing");
        let b = SegmentVaryPathBuilder::root()
            .descend_param("locale", "fr")
            .descend("pricing");
        assert_ne!(a.finalize_layout(), b.finalize_layout());
        assert_eq!(
            a.filtered(&[]).finalize_layout(),
            b.filtered(&[]).finalize_layout()
        );
        assert_ne!(
            a.filtered(&["locale".to_string()]).finalize_layout(),
            b.filtered(&["locale".to_string()]).finalize_layout()
        );
    }

    #[test]
    fn test_fulfilled_path_matches_filtered_builder() {
        let builder = SegmentVaryPathBuilder::root()
            .descend_param("locale", "en")
            .descend("shop")
            .descend_param("id", "42");
        let vary = vec!["id".to_string()];
        assert_eq!(
            fulfilled_segment_vary_path(&builder.finalize_layout(), &vary),
            builder.filtered(&vary).finalize_layout()
        );
        assert_eq!(
            fulfilled_segment_vary_path(&builder.finalize_page("?a[0]=1"), &vary),
            builder.filtered(&vary).finalize_page("?a[0]=1")
        );
    }

    #[test]
    fn test_fulfilled_path_keeps_catchall_values_with_slashes() {
        let builder = SegmentVaryPathBuilder::root().descend_param("rest", "a/b");
        let kept = fulfilled_segment_vary_path(
            &builder.finalize_layout(),
            &["rest".to_string()],
        );
        assert_eq!(kept, builder.finalize_layout());
        let dropped = fulfilled_segment_vary_path(&builder.finalize_layout(), &[]);
        assert_eq!(dropped.as_str(), "/[rest]");
    }

    #[test]
    fn test_escaping_prevents_collisions() {
        let literal = SegmentVaryPathBuilder::root().descend("[slug=x]");
        let param = SegmentVaryPathBuilder::root().descend_param("slug", "x");
        assert_ne!(literal.finalize_layout(), param.finalize_layout());
    }

    #[test]
    fn test_determinism_across_calls() {
        let b = SegmentVaryPathBuilder::root()
            .descend("shop")
            .descend_param("id", "42");
        for _ in 0..3 {
            assert_eq!(b.finalize_page("?v=2"), b.finalize_page("?v=2"));
            assert_eq!(b.finalize_metadata("?v=2"), b.finalize_metadata("?v=2"));
        }
    }
}
