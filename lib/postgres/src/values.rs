//! Opaque-value codec for JSONB columns.
//!
//! Value sequences and context objects ride in the versioned envelope so
//! shapes Postgres JSONB handles poorly elsewhere in the fleet (top-level
//! scalars, deeply nested arrays) round-trip unchanged. Error detail is
//! stored bare: the reader already lifts historical plain strings.

use serde_json::Value as JsonValue;
use worldkit_core::{Envelope, ErrorDetail, WorldError};

/// Encodes a value sequence for storage.
pub(crate) fn encode_values(values: &[JsonValue]) -> JsonValue {
    Envelope::wrap(JsonValue::Array(values.to_vec()))
}

/// Decodes a stored value sequence.
pub(crate) fn decode_values(stored: JsonValue) -> Result<Vec<JsonValue>, WorldError> {
    match Envelope::unwrap(stored) {
        JsonValue::Array(items) => Ok(items),
        other => Err(WorldError::internal(format!(
            "expected a stored value sequence, got: {other}"
        ))),
    }
}

/// Encodes a single opaque value for storage.
pub(crate) fn encode_value(value: &JsonValue) -> JsonValue {
    Envelope::wrap(value.clone())
}

/// Decodes a single stored opaque value.
pub(crate) fn decode_value(stored: JsonValue) -> JsonValue {
    Envelope::unwrap(stored)
}

/// Encodes error detail for storage.
pub(crate) fn encode_error(error: &ErrorDetail) -> Result<JsonValue, WorldError> {
    serde_json::to_value(error).map_err(WorldError::internal)
}

/// Decodes stored error detail, accepting both the structured record and
/// historical bare strings.
pub(crate) fn decode_error(stored: JsonValue) -> Result<ErrorDetail, WorldError> {
    serde_json::from_value(stored).map_err(WorldError::internal)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn value_sequence_roundtrip() {
        let values = vec![json!("a"), json!([["nested"]]), json!(1)];
        let stored = encode_values(&values);
        assert_eq!(decode_values(stored).expect("decode"), values);
    }

    #[test]
    fn non_sequence_is_internal() {
        let err = decode_values(Envelope::wrap(json!("scalar"))).unwrap_err();
        assert!(matches!(err, WorldError::Internal { .. }));
    }

    #[test]
    fn error_detail_roundtrip() {
        let detail = ErrorDetail::new("boom").with_code("E1");
        let stored = encode_error(&detail).expect("encode");
        assert_eq!(decode_error(stored).expect("decode"), detail);
    }

    #[test]
    fn legacy_string_error_is_lifted() {
        let detail = decode_error(json!("it broke")).expect("decode");
        assert_eq!(detail.message, "it broke");
        assert!(detail.code.is_none());
    }
}
