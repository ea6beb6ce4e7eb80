//! Session state and output-cache entry types.
//!
//! Both are closed enums: decoding stored bytes can only ever produce these
//! shapes. Application types that need to travel through the session ride in
//! [`SessionValue::Opaque`] and must be named on the codec's allow-list.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// A single session item value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SessionValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Bytes(Vec<u8>),
    List(Vec<SessionValue>),
    Map(BTreeMap<String, SessionValue>),
    /// An application-defined type, stored as bytes under a registered tag.
    Opaque { type_tag: String, bytes: Vec<u8> },
}

impl From<&str> for SessionValue {
    fn from(s: &str) -> Self {
        SessionValue::Text(s.to_string())
    }
}

impl From<String> for SessionValue {
    fn from(s: String) -> Self {
        SessionValue::Text(s)
    }
}

impl From<i64> for SessionValue {
    fn from(n: i64) -> Self {
        SessionValue::Int(n)
    }
}

impl From<bool> for SessionValue {
    fn from(b: bool) -> Self {
        SessionValue::Bool(b)
    }
}

/// The items of one session plus the keys removed since it was loaded.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionState {
    pub items: BTreeMap<String, SessionValue>,
    pub deleted: BTreeSet<String>,
}

impl SessionState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&SessionValue> {
        self.items.get(key)
    }

    /// Insert or replace an item. Clears any pending deletion of the key.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<SessionValue>) {
        let key = key.into();
        self.deleted.remove(&key);
        self.items.insert(key, value.into());
    }

    /// Remove an item and record the deletion.
    pub fn remove(&mut self, key: &str) -> Option<SessionValue> {
        let removed = self.items.remove(key);
        if removed.is_some() {
            self.deleted.insert(key.to_string());
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

/// An output-cache entry. Only these shapes are ever stored or decoded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum OutputCacheEntry {
    /// A complete rendered response.
    Response(CachedResponse),
    /// The vary-by rules that select between cached responses.
    Vary(CachedVary),
    /// An opaque fragment.
    Raw(Vec<u8>),
}

/// A cached HTTP response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

/// Vary-by descriptor for a cached URL.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedVary {
    pub headers: Vec<String>,
    pub params: Vec<String>,
    pub content_encodings: Vec<String>,
    pub vary_by_custom: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remove_records_deletion() {
        let mut state = SessionState::new();
        state.insert("cart", "3 items");
        state.remove("cart");
        assert!(state.is_empty());
        assert!(state.deleted.contains("cart"));
    }

    #[test]
    fn remove_missing_is_not_recorded() {
        let mut state = SessionState::new();
        assert!(state.remove("nothing").is_none());
        assert!(state.deleted.is_empty());
    }

    #[test]
    fn reinsert_clears_deletion() {
        let mut state = SessionState::new();
        state.insert("user", 42i64);
        state.remove("user");
        state.insert("user", 43i64);
        assert!(state.deleted.is_empty());
        assert_eq!(state.get("user"), Some(&SessionValue::Int(43)));
    }
}
