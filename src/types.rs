//! Core write-operation types.
//!
//! A [`WriteItem`] is what producers hand to the stream: the operation kind
//! may be omitted and filled in from the stream-level default at accept
//! time. A [`BatchOp`] is the resolved form delivered to the sink, with the
//! kind decided and delete values stripped.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Kind of a single batch operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationKind {
    Put,
    Delete,
}

impl OperationKind {
    /// Parse a wire spelling. Accepts the short alias `"del"` alongside
    /// `"delete"`; anything else is not a valid operation kind.
    pub fn parse(s: &str) -> Option<OperationKind> {
        match s {
            "put" => Some(OperationKind::Put),
            "del" | "delete" => Some(OperationKind::Delete),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            OperationKind::Put => "put",
            OperationKind::Delete => "delete",
        }
    }
}

impl std::fmt::Display for OperationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single write request as issued by the producer.
///
/// Immutable once accepted by the stream. An item without a kind inherits
/// the stream's configured default; an item with a kind always wins over
/// the default.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteItem {
    pub kind: Option<OperationKind>,
    pub key: Bytes,
    pub value: Option<Bytes>,
}

impl WriteItem {
    /// Bare item carrying only a key; kind and value come from
    /// [`WriteItem::with_kind`] / [`WriteItem::with_value`] or the stream
    /// default.
    pub fn new(key: impl Into<Bytes>) -> Self {
        WriteItem {
            kind: None,
            key: key.into(),
            value: None,
        }
    }

    /// Item that explicitly puts `value` under `key`.
    pub fn put(key: impl Into<Bytes>, value: impl Into<Bytes>) -> Self {
        WriteItem {
            kind: Some(OperationKind::Put),
            key: key.into(),
            value: Some(value.into()),
        }
    }

    /// Item that explicitly deletes `key`.
    pub fn delete(key: impl Into<Bytes>) -> Self {
        WriteItem {
            kind: Some(OperationKind::Delete),
            key: key.into(),
            value: None,
        }
    }

    /// Attach a value.
    pub fn with_value(mut self, value: impl Into<Bytes>) -> Self {
        self.value = Some(value.into());
        self
    }

    /// Override the operation kind for this item only.
    pub fn with_kind(mut self, kind: OperationKind) -> Self {
        self.kind = Some(kind);
        self
    }
}

/// A resolved operation as delivered to the sink.
///
/// `value` is always `None` for deletes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchOp {
    pub kind: OperationKind,
    pub key: Bytes,
    pub value: Option<Bytes>,
}

impl BatchOp {
    pub fn put(key: impl Into<Bytes>, value: impl Into<Bytes>) -> Self {
        BatchOp {
            kind: OperationKind::Put,
            key: key.into(),
            value: Some(value.into()),
        }
    }

    pub fn delete(key: impl Into<Bytes>) -> Self {
        BatchOp {
            kind: OperationKind::Delete,
            key: key.into(),
            value: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_operation_kind() {
        assert_eq!(OperationKind::parse("put"), Some(OperationKind::Put));
        assert_eq!(OperationKind::parse("del"), Some(OperationKind::Delete));
        assert_eq!(OperationKind::parse("delete"), Some(OperationKind::Delete));
        assert_eq!(OperationKind::parse("merge"), None);
        assert_eq!(OperationKind::parse(""), None);
    }

    #[test]
    fn test_operation_kind_serde_lowercase() {
        assert_eq!(
            serde_json::to_string(&OperationKind::Put).unwrap(),
            "\"put\""
        );
        let kind: OperationKind = serde_json::from_str("\"delete\"").unwrap();
        assert_eq!(kind, OperationKind::Delete);
        assert!(serde_json::from_str::<OperationKind>("\"foo\"").is_err());
    }

    #[test]
    fn test_item_constructors() {
        let item = WriteItem::put("a", "1");
        assert_eq!(item.kind, Some(OperationKind::Put));
        assert_eq!(item.value, Some(Bytes::from("1")));

        let item = WriteItem::delete("a");
        assert_eq!(item.kind, Some(OperationKind::Delete));
        assert_eq!(item.value, None);

        let item = WriteItem::new("a").with_value("1");
        assert_eq!(item.kind, None);
        assert_eq!(item.value, Some(Bytes::from("1")));
    }

    #[test]
    fn test_item_kind_override() {
        let item = WriteItem::new("a")
            .with_value("1")
            .with_kind(OperationKind::Delete);
        assert_eq!(item.kind, Some(OperationKind::Delete));
    }
}
