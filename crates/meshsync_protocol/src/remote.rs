//! Remote query packets and result sets.

use crate::ack::AckCode;
use crate::prepared_stmt::PreparedStmt;
use crate::security::SecurityOption;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Remote executor packet version.
pub const REMOTE_EXECUTOR_PACKET_VERSION: u32 = 1;

/// A single column value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FieldValue {
    /// SQL NULL.
    Null,
    /// Integer.
    Integer(i64),
    /// Floating point.
    Real(f64),
    /// Text.
    Text(String),
    /// Blob.
    Blob(Vec<u8>),
}

/// Rows returned by a remote query.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RelationalRowDataSet {
    /// Column names.
    pub columns: Vec<String>,
    /// Rows in column order.
    pub rows: Vec<Vec<FieldValue>>,
}

impl RelationalRowDataSet {
    /// Creates a set with columns and no rows.
    pub fn with_columns(columns: Vec<String>) -> Self {
        Self {
            columns,
            rows: Vec::new(),
        }
    }

    /// Number of rows.
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// Returns true if there are no rows.
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Appends another page.
    pub fn merge(&mut self, mut page: RelationalRowDataSet) {
        if self.columns.is_empty() {
            self.columns = std::mem::take(&mut page.columns);
        }
        self.rows.append(&mut page.rows);
    }

    /// Concatenates pages in key order.
    pub fn from_pages(pages: BTreeMap<u32, RelationalRowDataSet>) -> Self {
        pages.into_values().fold(Self::default(), |mut acc, page| {
            acc.merge(page);
            acc
        })
    }
}

/// Remote query request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteExecutorRequestPacket {
    /// Packet version.
    pub version: u32,
    /// Statement to run.
    pub stmt: PreparedStmt,
    /// Extra key/value conditions.
    pub extra_conditions: BTreeMap<String, String>,
}

impl RemoteExecutorRequestPacket {
    /// Wraps a statement.
    pub fn new(stmt: PreparedStmt) -> Self {
        Self {
            version: REMOTE_EXECUTOR_PACKET_VERSION,
            stmt,
            extra_conditions: BTreeMap::new(),
        }
    }
}

/// One page of a remote query answer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteExecutorAckPacket {
    /// Packet version.
    pub version: u32,
    /// Result code.
    pub ack_code: AckCode,
    /// Set on the final page.
    pub last: bool,
    /// Responder's security option.
    pub security: SecurityOption,
    /// Rows of this page.
    pub rows: RelationalRowDataSet,
}

impl RemoteExecutorAckPacket {
    /// Builds a failure ack.
    pub fn failed(ack_code: AckCode, security: SecurityOption) -> Self {
        Self {
            version: REMOTE_EXECUTOR_PACKET_VERSION,
            ack_code,
            last: true,
            security,
            rows: RelationalRowDataSet::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pages_merge_in_sequence_order() {
        let mut pages = BTreeMap::new();
        pages.insert(
            2,
            RelationalRowDataSet {
                columns: vec!["id".into()],
                rows: vec![vec![FieldValue::Integer(2)]],
            },
        );
        pages.insert(
            1,
            RelationalRowDataSet {
                columns: vec!["id".into()],
                rows: vec![vec![FieldValue::Integer(1)]],
            },
        );
        let merged = RelationalRowDataSet::from_pages(pages);
        assert_eq!(merged.columns, vec!["id".to_string()]);
        assert_eq!(
            merged.rows,
            vec![vec![FieldValue::Integer(1)], vec![FieldValue::Integer(2)]]
        );
    }
}
