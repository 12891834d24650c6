//! Error taxonomy for the World contract.
//!
//! Every World operation surfaces one of the [`WorldError`] kinds; callers
//! dispatch on the kind, not on backend-specific detail. A backend-store
//! failure that cannot be classified becomes [`WorldError::Internal`].

use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;

/// Errors surfaced by World operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorldError {
    /// The addressed entity does not exist.
    NotFound { entity: &'static str, id: String },
    /// Creation collided with an existing unique entity.
    Conflict { entity: &'static str, id: String },
    /// The requested state machine transition is illegal.
    InvalidState { message: String },
    /// A required argument is missing or malformed.
    InvalidArgument { message: String },
    /// The backend does not support the operation.
    NotImplemented { operation: &'static str },
    /// Backend failure, deserialization error, or unexpected store condition.
    Internal { message: String },
}

impl WorldError {
    /// Builds a `NotFound` error for the given entity kind and id.
    pub fn not_found(entity: &'static str, id: impl fmt::Display) -> Self {
        Self::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    /// Builds a `Conflict` error for the given entity kind and id.
    pub fn conflict(entity: &'static str, id: impl fmt::Display) -> Self {
        Self::Conflict {
            entity,
            id: id.to_string(),
        }
    }

    /// Builds an `InvalidState` error.
    pub fn invalid_state(message: impl Into<String>) -> Self {
        Self::InvalidState {
            message: message.into(),
        }
    }

    /// Builds an `InvalidArgument` error.
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::InvalidArgument {
            message: message.into(),
        }
    }

    /// Wraps an unclassifiable backend failure.
    pub fn internal(source: impl fmt::Display) -> Self {
        Self::Internal {
            message: source.to_string(),
        }
    }

    /// Returns true if this is a `NotFound` error.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// Returns true if this is a `Conflict` error.
    #[must_use]
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }

    /// Returns true if this is an `InvalidState` error.
    #[must_use]
    pub fn is_invalid_state(&self) -> bool {
        matches!(self, Self::InvalidState { .. })
    }
}

impl fmt::Display for WorldError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotFound { entity, id } => write!(f, "{entity} not found: {id}"),
            Self::Conflict { entity, id } => write!(f, "{entity} already exists: {id}"),
            Self::InvalidState { message } => write!(f, "invalid state: {message}"),
            Self::InvalidArgument { message } => write!(f, "invalid argument: {message}"),
            Self::NotImplemented { operation } => {
                write!(f, "operation not implemented: {operation}")
            }
            Self::Internal { message } => write!(f, "internal error: {message}"),
        }
    }
}

impl std::error::Error for WorldError {}

/// Structured failure detail attached to runs and steps.
///
/// The record round-trips through every backing store. Some stores carry
/// historical plain-string errors; deserialization lifts a bare string to
/// `{ message }`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ErrorDetail {
    /// Human-readable failure message.
    pub message: String,
    /// Captured stack trace, when one exists.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
    /// Machine-readable failure code.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

impl ErrorDetail {
    /// Creates a detail record carrying only a message.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            stack: None,
            code: None,
        }
    }

    /// Attaches a failure code.
    #[must_use]
    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }
}

impl<'de> Deserialize<'de> for ErrorDetail {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Repr {
            Structured {
                message: String,
                #[serde(default)]
                stack: Option<String>,
                #[serde(default)]
                code: Option<String>,
            },
            Bare(String),
        }

        Ok(match Repr::deserialize(deserializer)? {
            Repr::Structured {
                message,
                stack,
                code,
            } => Self {
                message,
                stack,
                code,
            },
            Repr::Bare(message) => Self {
                message,
                stack: None,
                code: None,
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_found_display() {
        let err = WorldError::not_found("run", "wrun_01ABC");
        assert_eq!(err.to_string(), "run not found: wrun_01ABC");
        assert!(err.is_not_found());
    }

    #[test]
    fn invalid_state_display() {
        let err = WorldError::invalid_state("cannot cancel a completed run");
        assert!(err.to_string().contains("cannot cancel"));
        assert!(err.is_invalid_state());
    }

    #[test]
    fn error_detail_roundtrip() {
        let detail = ErrorDetail::new("boom").with_code("E1");
        let json = serde_json::to_string(&detail).expect("serialize");
        let parsed: ErrorDetail = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(detail, parsed);
    }

    #[test]
    fn error_detail_skips_absent_fields() {
        let json = serde_json::to_value(ErrorDetail::new("boom")).expect("to_value");
        assert_eq!(json, serde_json::json!({"message": "boom"}));
    }

    #[test]
    fn error_detail_lifts_bare_string() {
        let parsed: ErrorDetail = serde_json::from_str(r#""disk on fire""#).expect("deserialize");
        assert_eq!(parsed.message, "disk on fire");
        assert!(parsed.stack.is_none());
        assert!(parsed.code.is_none());
    }
}
