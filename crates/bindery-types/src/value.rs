//! Tagged-union value type for cross-step context data.
//!
//! Steps pass arbitrary structured context to later steps through the
//! checkpoint's `data` map. `ContextValue` keeps that open-ended without
//! giving up type safety: the five variants cover everything the book
//! workflows produce, and untagged serde keeps checkpoints readable as
//! plain JSON.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// A value a step computes and a later step consumes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ContextValue {
    Bool(bool),
    Number(f64),
    Text(String),
    List(Vec<ContextValue>),
    Map(BTreeMap<String, ContextValue>),
}

impl ContextValue {
    /// Shorthand for a text value.
    pub fn text(s: impl Into<String>) -> Self {
        ContextValue::Text(s.into())
    }

    /// Shorthand for a map value built from `(key, value)` pairs.
    pub fn map<I, K>(entries: I) -> Self
    where
        I: IntoIterator<Item = (K, ContextValue)>,
        K: Into<String>,
    {
        ContextValue::Map(entries.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            ContextValue::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_number(&self) -> Option<f64> {
        match self {
            ContextValue::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            ContextValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[ContextValue]> {
        match self {
            ContextValue::List(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&BTreeMap<String, ContextValue>> {
        match self {
            ContextValue::Map(entries) => Some(entries),
            _ => None,
        }
    }

    /// Fetch a map entry by key. Returns `None` for non-map values.
    pub fn get(&self, key: &str) -> Option<&ContextValue> {
        self.as_map().and_then(|m| m.get(key))
    }
}

impl From<&str> for ContextValue {
    fn from(s: &str) -> Self {
        ContextValue::Text(s.to_string())
    }
}

impl From<String> for ContextValue {
    fn from(s: String) -> Self {
        ContextValue::Text(s)
    }
}

impl From<f64> for ContextValue {
    fn from(n: f64) -> Self {
        ContextValue::Number(n)
    }
}

impl From<bool> for ContextValue {
    fn from(b: bool) -> Self {
        ContextValue::Bool(b)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn untagged_json_representation() {
        assert_eq!(
            serde_json::to_string(&ContextValue::text("hello")).unwrap(),
            "\"hello\""
        );
        assert_eq!(serde_json::to_string(&ContextValue::Number(3.0)).unwrap(), "3.0");
        assert_eq!(serde_json::to_string(&ContextValue::Bool(true)).unwrap(), "true");

        let value = ContextValue::map([
            ("chapters", ContextValue::Number(12.0)),
            ("approved", ContextValue::Bool(false)),
        ]);
        let json = serde_json::to_string(&value).unwrap();
        assert_eq!(json, r#"{"approved":false,"chapters":12.0}"#);
    }

    #[test]
    fn roundtrip_nested_value() {
        let value = ContextValue::map([
            (
                "items",
                ContextValue::List(vec![ContextValue::text("ch01"), ContextValue::text("ch02")]),
            ),
            ("pass", ContextValue::Number(2.0)),
        ]);
        let json = serde_json::to_string(&value).unwrap();
        let parsed: ContextValue = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, value);
        assert_eq!(parsed.get("pass").and_then(ContextValue::as_number), Some(2.0));
        assert_eq!(
            parsed.get("items").and_then(ContextValue::as_list).map(|l| l.len()),
            Some(2)
        );
    }

    #[test]
    fn accessors_reject_wrong_variant() {
        let v = ContextValue::text("not a number");
        assert!(v.as_number().is_none());
        assert!(v.as_bool().is_none());
        assert!(v.as_map().is_none());
        assert!(v.get("anything").is_none());
        assert_eq!(v.as_text(), Some("not a number"));
    }
}
