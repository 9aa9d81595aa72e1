//! Query objects carried by query sync and subscriptions.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// A filter over synced keys.
///
/// Evaluation and planning belong to storage; the sync engine only needs a
/// stable identity per query and the few flags that change watermark handling.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct QueryObject {
    /// Table the query applies to, if any.
    pub table: Option<String>,
    /// Keys must start with this prefix.
    pub key_prefix: Vec<u8>,
    /// Keys must be one of these, when non-empty.
    pub in_keys: Vec<Vec<u8>>,
    /// Ordering columns.
    pub order_by: Vec<String>,
    /// Row limit.
    pub limit: Option<u32>,
    /// Opaque predicate text handed to storage.
    pub predicate: String,
}

impl QueryObject {
    /// Creates an empty (match-all) query.
    pub fn new() -> Self {
        Self::default()
    }

    /// Restricts the query to a table.
    pub fn with_table(mut self, table: impl Into<String>) -> Self {
        self.table = Some(table.into());
        self
    }

    /// Restricts keys to a prefix.
    pub fn with_prefix(mut self, prefix: impl Into<Vec<u8>>) -> Self {
        self.key_prefix = prefix.into();
        self
    }

    /// Restricts keys to an explicit set.
    pub fn with_in_keys(mut self, keys: Vec<Vec<u8>>) -> Self {
        self.in_keys = keys;
        self
    }

    /// Adds an ordering column.
    pub fn with_order_by(mut self, column: impl Into<String>) -> Self {
        self.order_by.push(column.into());
        self
    }

    /// Sets a row limit.
    pub fn with_limit(mut self, limit: u32) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Sets the predicate text.
    pub fn with_predicate(mut self, predicate: impl Into<String>) -> Self {
        self.predicate = predicate.into();
        self
    }

    /// Returns true if a limit is set.
    pub fn has_limit(&self) -> bool {
        self.limit.is_some()
    }

    /// Returns true if any ordering is requested.
    pub fn has_order_by(&self) -> bool {
        !self.order_by.is_empty()
    }

    /// Returns true if the query names explicit keys.
    pub fn has_in_keys(&self) -> bool {
        !self.in_keys.is_empty()
    }

    /// Checks a key against the prefix and key-set restrictions.
    pub fn matches_key(&self, key: &[u8]) -> bool {
        if !key.starts_with(&self.key_prefix) {
            return false;
        }
        self.in_keys.is_empty() || self.in_keys.iter().any(|k| k.as_slice() == key)
    }

    /// Stable identity of this query, used as the query-sync watermark key.
    pub fn identify(&self) -> String {
        let mut hasher = Sha256::new();
        if let Some(table) = &self.table {
            hasher.update(b"t:");
            hasher.update(table.as_bytes());
        }
        hasher.update(b"p:");
        hasher.update(&self.key_prefix);
        for key in &self.in_keys {
            hasher.update(b"k:");
            hasher.update((key.len() as u64).to_le_bytes());
            hasher.update(key);
        }
        for column in &self.order_by {
            hasher.update(b"o:");
            hasher.update(column.as_bytes());
        }
        if let Some(limit) = self.limit {
            hasher.update(b"l:");
            hasher.update(limit.to_le_bytes());
        }
        hasher.update(b"w:");
        hasher.update(self.predicate.as_bytes());
        hasher
            .finalize()
            .iter()
            .map(|b| format!("{b:02x}"))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_is_stable_and_distinguishes_queries() {
        let a = QueryObject::new().with_prefix(b"user/".to_vec());
        let b = QueryObject::new().with_prefix(b"user/".to_vec());
        let c = QueryObject::new().with_prefix(b"order/".to_vec());
        assert_eq!(a.identify(), b.identify());
        assert_ne!(a.identify(), c.identify());
        assert_eq!(a.identify().len(), 64);
    }

    #[test]
    fn key_matching() {
        let query = QueryObject::new()
            .with_prefix(b"k".to_vec())
            .with_in_keys(vec![b"k1".to_vec(), b"k2".to_vec()]);
        assert!(query.matches_key(b"k1"));
        assert!(!query.matches_key(b"k3"));
        assert!(!query.matches_key(b"x1"));
        assert!(QueryObject::new().matches_key(b"anything"));
    }
}
