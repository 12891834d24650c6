//! Versioned envelope for opaque values persisted to backing stores.
//!
//! Some stores reject or mangle certain value shapes (arrays of arrays,
//! top-level scalars). Backends wrap offending values in a tagged
//! `{ version, payload }` envelope on write and unwrap transparently on
//! read; the wrapping is invisible at the contract. The version tag leaves
//! room for in-place format evolution.

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

/// The current envelope format version.
pub const CURRENT_VERSION: u32 = 1;

/// A tagged wrapper around an opaque stored value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    /// Envelope format version.
    pub version: u32,
    /// The wrapped value.
    pub payload: JsonValue,
}

impl Envelope {
    /// Wraps a value for persistence.
    #[must_use]
    pub fn wrap(payload: JsonValue) -> JsonValue {
        serde_json::json!({
            "version": CURRENT_VERSION,
            "payload": payload,
        })
    }

    /// Unwraps a stored value.
    ///
    /// Values written before the envelope was introduced are stored bare;
    /// anything that does not look exactly like an envelope passes through
    /// unchanged.
    #[must_use]
    pub fn unwrap(stored: JsonValue) -> JsonValue {
        let is_envelope = match &stored {
            JsonValue::Object(map) => {
                map.len() == 2
                    && map.get("version").is_some_and(JsonValue::is_u64)
                    && map.contains_key("payload")
            }
            _ => false,
        };

        if is_envelope {
            if let JsonValue::Object(mut map) = stored {
                return map.remove("payload").unwrap_or(JsonValue::Null);
            }
            unreachable!("envelope shape checked above");
        }
        stored
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn wrap_then_unwrap_is_identity() {
        let value = json!([["a", "b"], ["c"]]);
        let stored = Envelope::wrap(value.clone());
        assert_ne!(stored, value);
        assert_eq!(Envelope::unwrap(stored), value);
    }

    #[test]
    fn bare_legacy_value_passes_through() {
        let value = json!({"result": 42});
        assert_eq!(Envelope::unwrap(value.clone()), value);
    }

    #[test]
    fn lookalike_object_with_extra_keys_passes_through() {
        let value = json!({"version": 1, "payload": "x", "extra": true});
        assert_eq!(Envelope::unwrap(value.clone()), value);
    }

    #[test]
    fn wrapped_null_unwraps_to_null() {
        assert_eq!(Envelope::unwrap(Envelope::wrap(JsonValue::Null)), JsonValue::Null);
    }

    #[test]
    fn envelope_json_structure() {
        let stored = Envelope::wrap(json!("chunk"));
        assert_eq!(stored["version"], CURRENT_VERSION);
        assert_eq!(stored["payload"], "chunk");
    }
}
