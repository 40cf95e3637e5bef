use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// A single observed value: an opaque payload, the moment it was read and a
/// free-form tag map for routing metadata (e.g. the freezer marks values it
/// served with `from_cf`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Value {
    pub v: serde_json::Value,
    /// Epoch seconds at which the payload was obtained.
    pub ts: f64,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub tags: HashMap<String, serde_json::Value>,
}

impl Value {
    pub fn new(v: serde_json::Value, ts: f64) -> Self {
        Self {
            v,
            ts,
            tags: HashMap::new(),
        }
    }

    pub fn with_tag(mut self, key: &str, value: serde_json::Value) -> Self {
        self.tags.insert(key.to_owned(), value);
        self
    }

    /// Whether this value is too old to satisfy a request anchored at
    /// `reference_ts` with the given staleness tolerance.
    pub fn is_expired(&self, reference_ts: f64, tolerance: f64) -> bool {
        self.ts + tolerance < reference_ts
    }

    /// Payload comparison used for change detection; timestamps and tags do
    /// not count as a change.
    pub fn same_payload(&self, other: &Value) -> bool {
        self.v == other.v
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        self.v == other.v && self.ts == other.ts
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn expiry_is_relative_to_reference_time() {
        let value = Value::new(json!(12.5), 100.0);
        assert!(!value.is_expired(100.0, 0.0));
        assert!(!value.is_expired(102.0, 2.0));
        assert!(value.is_expired(102.1, 2.0));
    }

    #[test]
    fn payload_comparison_ignores_timestamp_and_tags() {
        let a = Value::new(json!({"alt": 45.0}), 1.0);
        let b = Value::new(json!({"alt": 45.0}), 2.0).with_tag("from_cf", json!(true));
        assert!(a.same_payload(&b));
        assert!(!a.same_payload(&Value::new(json!({"alt": 46.0}), 1.0)));
    }
}
