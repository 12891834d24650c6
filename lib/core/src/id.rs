//! Strongly-typed ID types for World entities.
//!
//! Generated IDs use ULID (Universally Unique Lexicographically Sortable
//! Identifier) format, so lexicographic comparison of two ids equals their
//! temporal ordering. IDs handed out by one [`IdGenerator`] are additionally
//! strictly monotonic, even when several are generated within the same
//! millisecond.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::{Mutex, PoisonError};
use ulid::{Generator, Ulid};

/// Error returned when parsing an ID from a string fails.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseIdError {
    /// The type of ID that failed to parse.
    pub id_type: &'static str,
    /// The reason for the parse failure.
    pub reason: String,
}

impl fmt::Display for ParseIdError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "failed to parse {}: {}", self.id_type, self.reason)
    }
}

impl std::error::Error for ParseIdError {}

/// Macro to generate a strongly-typed ID wrapper around ULID.
macro_rules! define_id {
    ($(#[$meta:meta])* $name:ident, $prefix:expr) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(Ulid);

        impl $name {
            /// Creates an ID from a ULID.
            #[must_use]
            pub const fn from_ulid(ulid: Ulid) -> Self {
                Self(ulid)
            }

            /// Returns the underlying ULID.
            #[must_use]
            pub const fn as_ulid(&self) -> Ulid {
                self.0
            }

            /// Returns the prefix used for display formatting.
            #[must_use]
            pub const fn prefix() -> &'static str {
                $prefix
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}_{}", $prefix, self.0)
            }
        }

        impl FromStr for $name {
            type Err = ParseIdError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                let prefix_with_underscore = concat!($prefix, "_");
                let ulid_str = if let Some(stripped) = s.strip_prefix(prefix_with_underscore) {
                    stripped
                } else {
                    s
                };

                Ulid::from_str(ulid_str)
                    .map(Self)
                    .map_err(|e| ParseIdError {
                        id_type: stringify!($name),
                        reason: e.to_string(),
                    })
            }
        }

        impl From<Ulid> for $name {
            fn from(ulid: Ulid) -> Self {
                Self(ulid)
            }
        }

        impl From<$name> for Ulid {
            fn from(id: $name) -> Self {
                id.0
            }
        }
    };
}

define_id!(
    /// Unique identifier for a workflow run.
    RunId,
    "wrun"
);

define_id!(
    /// Unique identifier for an event on a run.
    EventId,
    "wevt"
);

define_id!(
    /// Unique identifier for a single chunk of a byte stream.
    ChunkId,
    "chnk"
);

/// Unique identifier for a queue message.
///
/// Unlike the ULID-backed ids, a message id may also be derived from a
/// caller-supplied idempotency key, in which case it is stable across
/// deduplicated enqueues of the same message.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(String);

impl MessageId {
    /// Derives the stable message id for an idempotency key.
    #[must_use]
    pub fn from_idempotency_key(key: &str) -> Self {
        Self(format!("msg_{key}"))
    }

    /// Returns the id as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Process-wide source of fresh, strictly monotonic entity ids.
///
/// The generator tracks the timestamp and random component of the last id it
/// produced; when the clock has not advanced it increments the random
/// component instead, so ids remain strictly increasing across concurrent
/// callers. Backends create one generator at construction and share it.
pub struct IdGenerator {
    inner: Mutex<Generator>,
}

impl Default for IdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

impl IdGenerator {
    /// Creates a new generator.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Generator::new()),
        }
    }

    fn next_ulid(&self) -> Ulid {
        let mut generator = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        // The monotonic increment can only be exhausted by 2^80 ids inside a
        // single millisecond; fall back to a fresh random ULID in that case.
        generator.generate().unwrap_or_else(|_| Ulid::new())
    }

    /// Returns a fresh run id.
    #[must_use]
    pub fn run_id(&self) -> RunId {
        RunId(self.next_ulid())
    }

    /// Returns a fresh event id.
    #[must_use]
    pub fn event_id(&self) -> EventId {
        EventId(self.next_ulid())
    }

    /// Returns a fresh chunk id.
    #[must_use]
    pub fn chunk_id(&self) -> ChunkId {
        ChunkId(self.next_ulid())
    }

    /// Returns a fresh randomly generated message id.
    #[must_use]
    pub fn message_id(&self) -> MessageId {
        MessageId(format!("msg_{}", self.next_ulid()))
    }
}
