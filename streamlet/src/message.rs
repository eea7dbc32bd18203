//! Message and option types exchanged across the bridge.

use serde::{Deserialize, Serialize};

/// The unit of exchange between controller and worker.
///
/// A message carries a routing name and an opaque payload. It is immutable
/// after construction; the bridge never inspects either field, it only
/// preserves per-channel ordering.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    name: String,
    data: String,
}

impl Message {
    pub fn new(name: impl Into<String>, data: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            data: data.into(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn data(&self) -> &str {
        &self.data
    }
}

/// Opaque initialization payload handed once, read-only, to the worker
/// factory at session creation.
///
/// The bridge attaches no meaning to the contents - workers pull whatever
/// configuration they need out of the underlying JSON value.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Options(serde_json::Value);

impl Options {
    pub fn new(value: serde_json::Value) -> Self {
        Self(value)
    }

    pub fn value(&self) -> &serde_json::Value {
        &self.0
    }

    /// Field lookup for object-shaped options. `None` for missing keys or
    /// non-object payloads.
    pub fn get(&self, key: &str) -> Option<&serde_json::Value> {
        self.0.get(key)
    }
}

impl From<serde_json::Value> for Options {
    fn from(value: serde_json::Value) -> Self {
        Self(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_accessors() {
        let m = Message::new("sensor", "42.5");
        assert_eq!(m.name(), "sensor");
        assert_eq!(m.data(), "42.5");
    }

    #[test]
    fn options_field_lookup() {
        let opts = Options::new(serde_json::json!({"interval_ms": 50}));
        assert_eq!(opts.get("interval_ms"), Some(&serde_json::json!(50)));
        assert!(opts.get("missing").is_none());
    }

    #[test]
    fn options_default_is_null() {
        let opts = Options::default();
        assert!(opts.value().is_null());
        assert!(opts.get("anything").is_none());
    }
}
