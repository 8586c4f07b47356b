//! Opaque render payload handle.

use std::sync::Arc;

use serde::de::Deserializer;
use serde::ser::Serializer;
use serde::{Deserialize, Serialize};

/// A decoded render-node payload.
///
/// The cache stores and hands these out without interpreting them; only the
/// renderer understands their contents. Cloning is cheap.
#[derive(Debug, Clone, PartialEq)]
pub struct RscNode(Arc<serde_json::Value>);

impl RscNode {
    /// Wrap a decoded payload.
    pub fn new(value: serde_json::Value) -> Self {
        Self(Arc::new(value))
    }

    /// Borrow the underlying payload.
    pub fn value(&self) -> &serde_json::Value {
        &self.0
    }
}

impl Serialize for RscNode {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.0.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for RscNode {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        serde_json::Value::deserialize(deserializer).map(Self::new)
    }
}
