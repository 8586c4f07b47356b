//! Compact route-structure flags propagated from the server.

use serde::{Deserialize, Serialize};

/// Bitmask of router-relevant route metadata.
///
/// Call sites use the named accessors; the bit positions are private to
/// this module.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PrefetchHints(u8);

impl PrefetchHints {
    const ROOT_LAYOUT: u8 = 1 << 0;
    const LOADING_BOUNDARY: u8 = 1 << 1;
    const INSTANT_PREFETCH: u8 = 1 << 2;

    /// No hints set.
    pub fn new() -> Self {
        Self(0)
    }

    /// Mark the node as the application's root layout.
    pub fn with_root_layout(self) -> Self {
        Self(self.0 | Self::ROOT_LAYOUT)
    }

    /// Mark the node as carrying a loading boundary.
    pub fn with_loading_boundary(self) -> Self {
        Self(self.0 | Self::LOADING_BOUNDARY)
    }

    /// Mark the node as configured for instant prefetching.
    pub fn with_instant_prefetch(self) -> Self {
        Self(self.0 | Self::INSTANT_PREFETCH)
    }

    /// Whether the node is the application's root layout.
    pub fn is_root_layout(&self) -> bool {
        self.0 & Self::ROOT_LAYOUT != 0
    }

    /// Whether the node carries a loading boundary.
    pub fn has_loading_boundary(&self) -> bool {
        self.0 & Self::LOADING_BOUNDARY != 0
    }

    /// Whether the node is configured for instant prefetching.
    pub fn is_instant_prefetch(&self) -> bool {
        self.0 & Self::INSTANT_PREFETCH != 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hints_default_empty() {
        let hints = PrefetchHints::new();
        assert!(!hints.is_root_layout());
        assert!(!hints.has_loading_boundary());
        assert!(!hints.is_instant_prefetch());
    }

    #[test]
    fn test_hints_compose() {
        let hints = PrefetchHints::new()
            .with_root_layout()
            .with_loading_boundary();
        assert!(hints.is_root_layout());
        assert!(hints.has_loading_boundary());
        assert!(!hints.is_instant_prefetch());
    }
}
