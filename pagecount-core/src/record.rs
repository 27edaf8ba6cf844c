//! The logical shape of a page-view event and its wire codec.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A single page-view event as produced upstream.
///
/// Events are immutable once produced. The `id` names the viewed page and is
/// the aggregation key; `user` identifies the viewer and is carried through
/// untouched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageView {
    /// Page identifier, the partitioning and counting key
    pub id: String,
    /// User who viewed the page
    pub user: String,
}

/// Errors raised when a raw payload does not deserialize into a valid
/// [PageView]. These are non-retriable: the offending event is logged and
/// skipped, it will not become valid by trying again.
#[derive(Debug, Error)]
pub enum SchemaError {
    /// Payload is not valid JSON or misses/mistypes a required field
    #[error("payload is not a valid page view record")]
    Malformed(#[source] serde_json::Error),
    /// The id is the partition key, a record without one is unroutable
    #[error("page view record has an empty id")]
    EmptyId,
}

impl PageView {
    /// Create a new page-view event
    pub fn new(id: impl Into<String>, user: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            user: user.into(),
        }
    }

    /// Validate and deserialize a raw byte payload.
    ///
    /// Fails with [SchemaError] when the payload is not JSON, a required
    /// field is missing or mistyped, or the id is empty. Unknown extra
    /// fields are tolerated, upstream producers may evolve their schema.
    pub fn from_bytes(payload: &[u8]) -> Result<Self, SchemaError> {
        let view: PageView = serde_json::from_slice(payload).map_err(SchemaError::Malformed)?;
        if view.id.is_empty() {
            return Err(SchemaError::EmptyId);
        }
        Ok(view)
    }

    /// Serialize for the wire. Symmetric with [PageView::from_bytes]:
    /// `from_bytes(to_bytes(x)) == x` for every valid `x`.
    pub fn to_bytes(&self) -> Vec<u8> {
        // PANIC: a struct of two strings always serializes
        serde_json::to_vec(self).expect("Error serializing page view")
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::{PageView, SchemaError};

    #[test]
    fn roundtrip() {
        let view = PageView::new("p1", "u1");
        let restored = PageView::from_bytes(&view.to_bytes()).unwrap();
        assert_eq!(restored, view);
    }

    #[test]
    fn missing_field_is_malformed() {
        let err = PageView::from_bytes(br#"{"id": "p1"}"#).unwrap_err();
        assert!(matches!(err, SchemaError::Malformed(_)));
    }

    #[test]
    fn mistyped_field_is_malformed() {
        let err = PageView::from_bytes(br#"{"id": 7, "user": "u1"}"#).unwrap_err();
        assert!(matches!(err, SchemaError::Malformed(_)));
    }

    #[test]
    fn garbage_is_malformed() {
        let err = PageView::from_bytes(b"\x00\x01notjson").unwrap_err();
        assert!(matches!(err, SchemaError::Malformed(_)));
    }

    #[test]
    fn empty_id_rejected() {
        let err = PageView::from_bytes(br#"{"id": "", "user": "u1"}"#).unwrap_err();
        assert!(matches!(err, SchemaError::EmptyId));
    }

    #[test]
    fn extra_fields_tolerated() {
        let view =
            PageView::from_bytes(br#"{"id": "p1", "user": "u1", "referrer": "/home"}"#).unwrap();
        assert_eq!(view, PageView::new("p1", "u1"));
    }

    proptest! {
        #[test]
        fn roundtrip_any_valid_event(id in "\\PC{1,64}", user in "\\PC{0,64}") {
            let view = PageView::new(id, user);
            let restored = PageView::from_bytes(&view.to_bytes()).unwrap();
            prop_assert_eq!(restored, view);
        }
    }
}
