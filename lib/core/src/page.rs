//! Cursor pagination shared by every list operation.
//!
//! All lists return a [`Page`]: the data, an opaque continuation cursor, and
//! a `has_more` flag. Backends fetch `limit + 1` items and slice; the cursor
//! is the base64url-encoded identifier of the last returned item.

use crate::error::WorldError;
use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use serde::{Deserialize, Serialize};

/// Page size applied when the caller does not supply a limit.
pub const DEFAULT_PAGE_LIMIT: usize = 20;

/// Pagination parameters accepted by list operations.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pagination {
    /// Maximum number of items to return. Defaults to [`DEFAULT_PAGE_LIMIT`].
    #[serde(default)]
    pub limit: Option<usize>,
    /// Opaque cursor from the previous page.
    #[serde(default)]
    pub cursor: Option<String>,
}

impl Pagination {
    /// Returns the effective page limit.
    #[must_use]
    pub fn effective_limit(&self) -> usize {
        self.limit.unwrap_or(DEFAULT_PAGE_LIMIT).max(1)
    }

    /// Decodes the cursor back into the raw identifier it encodes.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` when the cursor is not one this system
    /// produced.
    pub fn decoded_cursor(&self) -> Result<Option<String>, WorldError> {
        self.cursor.as_deref().map(decode_cursor).transpose()
    }
}

/// Requested ordering for event listings.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortOrder {
    /// Oldest first (chronological).
    #[default]
    Ascending,
    /// Newest first.
    Descending,
}

/// One page of a list result.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Page<T> {
    /// The items on this page.
    pub data: Vec<T>,
    /// Cursor for the next page, or `None` on the last page.
    pub cursor: Option<String>,
    /// True iff the store held at least one more item beyond `data`.
    pub has_more: bool,
}

impl<T> Page<T> {
    /// Returns an empty terminal page.
    #[must_use]
    pub fn empty() -> Self {
        Self {
            data: Vec::new(),
            cursor: None,
            has_more: false,
        }
    }

    /// Builds a page from an overfetched (`limit + 1`) result set.
    ///
    /// `cursor_of` extracts the raw continuation identifier of an item; it is
    /// only consulted when a next page exists.
    pub fn from_overfetched<F>(mut items: Vec<T>, limit: usize, cursor_of: F) -> Self
    where
        F: Fn(&T) -> String,
    {
        let has_more = items.len() > limit;
        items.truncate(limit);
        let cursor = if has_more {
            items.last().map(|item| encode_cursor(&cursor_of(item)))
        } else {
            None
        };
        Self {
            data: items,
            cursor,
            has_more,
        }
    }
}

/// Encodes a raw continuation identifier into an opaque cursor.
#[must_use]
pub fn encode_cursor(raw: &str) -> String {
    URL_SAFE_NO_PAD.encode(raw.as_bytes())
}

/// Decodes an opaque cursor back into the raw identifier.
///
/// # Errors
///
/// Returns `InvalidArgument` on malformed input.
pub fn decode_cursor(cursor: &str) -> Result<String, WorldError> {
    let bytes = URL_SAFE_NO_PAD
        .decode(cursor)
        .map_err(|_| WorldError::invalid_argument(format!("malformed pagination cursor '{cursor}'")))?;
    String::from_utf8(bytes)
        .map_err(|_| WorldError::invalid_argument(format!("malformed pagination cursor '{cursor}'")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn effective_limit_defaults() {
        assert_eq!(Pagination::default().effective_limit(), DEFAULT_PAGE_LIMIT);
        let explicit = Pagination {
            limit: Some(3),
            cursor: None,
        };
        assert_eq!(explicit.effective_limit(), 3);
    }

    #[test]
    fn zero_limit_is_clamped() {
        let page = Pagination {
            limit: Some(0),
            cursor: None,
        };
        assert_eq!(page.effective_limit(), 1);
    }

    #[test]
    fn cursor_roundtrip() {
        let raw = "wrun_01J8F7V9K2M3N4P5Q6R7S8T9V0";
        let encoded = encode_cursor(raw);
        assert_ne!(encoded, raw);
        assert_eq!(decode_cursor(&encoded).expect("decode"), raw);
    }

    #[test]
    fn malformed_cursor_is_invalid_argument() {
        let err = decode_cursor("!!!not-base64!!!").unwrap_err();
        assert!(matches!(err, WorldError::InvalidArgument { .. }));
    }

    #[test]
    fn overfetched_page_slices_and_flags() {
        let page = Page::from_overfetched(vec![1, 2, 3, 4], 3, |n| n.to_string());
        assert_eq!(page.data, vec![1, 2, 3]);
        assert!(page.has_more);
        assert_eq!(decode_cursor(page.cursor.as_deref().unwrap()).unwrap(), "3");
    }

    #[test]
    fn exact_page_has_no_cursor() {
        let page = Page::from_overfetched(vec![1, 2, 3], 3, |n| n.to_string());
        assert_eq!(page.data, vec![1, 2, 3]);
        assert!(!page.has_more);
        assert!(page.cursor.is_none());
    }
}
