//! In-memory [`SyncStorage`] with paging and fault injection.

use meshsync_engine::{
    now_ticks, ContinueToken, DataSizeSpec, QueryPage, SyncDataPage, SyncError, SyncResult,
    SyncStorage,
};
use meshsync_protocol::{
    CompressAlgorithm, DataItem, FieldValue, PreparedStmt, QueryObject, RelationalRowDataSet,
    SecurityOption,
};
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};

enum Cursor {
    Data(VecDeque<DataItem>),
    Rows {
        columns: Vec<String>,
        rows: VecDeque<Vec<FieldValue>>,
    },
}

/// Key-value store kept in memory.
///
/// Sync reads page by entry count and encoded size. Remote queries accept
/// `SELECT ... FROM <table>` against tables added with
/// [`with_table`](Self::with_table).
pub struct MemoryStorage {
    entries: Mutex<BTreeMap<Vec<u8>, DataItem>>,
    meta: Mutex<HashMap<Vec<u8>, Vec<u8>>>,
    tables: Mutex<HashMap<String, RelationalRowDataSet>>,
    cursors: Mutex<HashMap<u64, Cursor>>,
    next_token: AtomicU64,
    schema: String,
    security: SecurityOption,
    compression: Vec<CompressAlgorithm>,
    query_page_rows: Option<usize>,
    put_error: Mutex<Option<SyncError>>,
    get_error: Mutex<Option<SyncError>>,
    query_error: Mutex<Option<SyncError>>,
    put_batches: AtomicU64,
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStorage {
    /// Creates an empty store with the default schema.
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(BTreeMap::new()),
            meta: Mutex::new(HashMap::new()),
            tables: Mutex::new(HashMap::new()),
            cursors: Mutex::new(HashMap::new()),
            next_token: AtomicU64::new(1),
            schema: fingerprint("default"),
            security: SecurityOption::default(),
            compression: Vec::new(),
            query_page_rows: None,
            put_error: Mutex::new(None),
            get_error: Mutex::new(None),
            query_error: Mutex::new(None),
            put_batches: AtomicU64::new(0),
        }
    }

    /// Uses the fingerprint of `schema`.
    pub fn with_schema(mut self, schema: &str) -> Self {
        self.schema = fingerprint(schema);
        self
    }

    /// Sets the security option.
    pub fn with_security(mut self, security: SecurityOption) -> Self {
        self.security = security;
        self
    }

    /// Sets the accepted compression algorithms.
    pub fn with_compression(mut self, algorithms: Vec<CompressAlgorithm>) -> Self {
        self.compression = algorithms;
        self
    }

    /// Caps the rows of each remote query page.
    pub fn with_query_page_rows(mut self, rows: usize) -> Self {
        self.query_page_rows = Some(rows.max(1));
        self
    }

    /// Adds a relational table for remote queries.
    pub fn with_table(self, name: &str, columns: &[&str], rows: Vec<Vec<FieldValue>>) -> Self {
        let set = RelationalRowDataSet {
            columns: columns.iter().map(|c| (*c).to_string()).collect(),
            rows,
        };
        self.tables.lock().insert(name.to_string(), set);
        self
    }

    /// Writes a local entry stamped with the current time, and after every
    /// existing entry.
    pub fn put(&self, key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) -> u64 {
        let mut entries = self.entries.lock();
        let last = entries.values().map(|e| e.timestamp).max().unwrap_or(0);
        let timestamp = now_ticks().max(last + 1);
        let key = key.into();
        entries.insert(key.clone(), DataItem::new(key, value, timestamp));
        timestamp
    }

    /// Value stored under `key`.
    pub fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
        self.entries
            .lock()
            .get(key)
            .filter(|e| !e.deleted)
            .map(|e| e.value.clone())
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        self.entries.lock().values().filter(|e| !e.deleted).count()
    }

    /// Returns true when no live entry exists.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Calls to `put_sync_data` that stored data.
    pub fn put_batches(&self) -> u64 {
        self.put_batches.load(Ordering::Relaxed)
    }

    /// Continue tokens neither consumed nor released.
    pub fn open_tokens(&self) -> usize {
        self.cursors.lock().len()
    }

    /// Makes every following `put_sync_data` fail with `err`.
    pub fn fail_puts_with(&self, err: Option<SyncError>) {
        *self.put_error.lock() = err;
    }

    /// Makes every following sync data read fail with `err`.
    pub fn fail_gets_with(&self, err: Option<SyncError>) {
        *self.get_error.lock() = err;
    }

    fn check_get(&self) -> SyncResult<()> {
        match self.get_error.lock().clone() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Makes every following `execute_query` fail with `err`.
    pub fn fail_queries_with(&self, err: Option<SyncError>) {
        *self.query_error.lock() = err;
    }

    fn open_token(&self, cursor: Cursor) -> ContinueToken {
        let handle = self.next_token.fetch_add(1, Ordering::Relaxed);
        self.cursors.lock().insert(handle, cursor);
        ContinueToken::new(handle)
    }

    fn data_page(&self, mut pending: VecDeque<DataItem>, spec: &DataSizeSpec) -> SyncDataPage {
        let mut entries = Vec::new();
        let mut bytes = 0usize;
        while let Some(entry) = pending.front() {
            let size = entry_size(entry);
            let full = entries.len() >= spec.packet_size.max(1) || bytes + size > spec.block_size;
            if full && !entries.is_empty() {
                break;
            }
            bytes += size;
            if let Some(entry) = pending.pop_front() {
                entries.push(entry);
            }
        }
        let token = (!pending.is_empty()).then(|| self.open_token(Cursor::Data(pending)));
        SyncDataPage { entries, token }
    }

    fn rows_page(
        &self,
        columns: Vec<String>,
        mut pending: VecDeque<Vec<FieldValue>>,
        budget: usize,
    ) -> QueryPage {
        let cap = self.query_page_rows.unwrap_or(usize::MAX);
        let mut rows = Vec::new();
        let mut bytes = 0usize;
        while let Some(row) = pending.front() {
            let size = row_size(row);
            if !rows.is_empty() && (rows.len() >= cap || bytes + size > budget) {
                break;
            }
            bytes += size;
            if let Some(row) = pending.pop_front() {
                rows.push(row);
            }
        }
        let token = (!pending.is_empty()).then(|| {
            self.open_token(Cursor::Rows {
                columns: columns.clone(),
                rows: pending,
            })
        });
        QueryPage {
            rows: RelationalRowDataSet { columns, rows },
            token,
        }
    }

    fn in_range(&self, begin: u64, end: u64, query: Option<&QueryObject>) -> VecDeque<DataItem> {
        let mut items: Vec<DataItem> = self
            .entries
            .lock()
            .values()
            .filter(|e| e.timestamp >= begin && e.timestamp <= end)
            .filter(|e| query.map_or(true, |q| q.matches_key(&e.key)))
            .cloned()
            .collect();
        items.sort_by_key(|e| e.timestamp);
        if let Some(limit) = query.and_then(|q| q.limit) {
            items.truncate(limit as usize);
        }
        items.into()
    }
}

impl SyncStorage for MemoryStorage {
    fn get_meta_data(&self, key: &[u8]) -> SyncResult<Option<Vec<u8>>> {
        Ok(self.meta.lock().get(key).cloned())
    }

    fn put_meta_data(&self, key: &[u8], value: &[u8]) -> SyncResult<()> {
        self.meta.lock().insert(key.to_vec(), value.to_vec());
        Ok(())
    }

    fn delete_meta_data(&self, keys: &[Vec<u8>]) -> SyncResult<()> {
        let mut meta = self.meta.lock();
        for key in keys {
            meta.remove(key);
        }
        Ok(())
    }

    fn get_max_timestamp(&self) -> u64 {
        self.entries
            .lock()
            .values()
            .map(|e| e.timestamp)
            .max()
            .unwrap_or(0)
    }

    fn get_sync_data(&self, begin: u64, end: u64, spec: &DataSizeSpec) -> SyncResult<SyncDataPage> {
        self.check_get()?;
        Ok(self.data_page(self.in_range(begin, end, None), spec))
    }

    fn get_sync_data_by_query(
        &self,
        query: &QueryObject,
        begin: u64,
        end: u64,
        spec: &DataSizeSpec,
    ) -> SyncResult<SyncDataPage> {
        self.check_get()?;
        Ok(self.data_page(self.in_range(begin, end, Some(query)), spec))
    }

    fn get_sync_data_next(&self, token: ContinueToken, spec: &DataSizeSpec) -> SyncResult<SyncDataPage> {
        let cursor = self.cursors.lock().remove(&token.handle());
        self.check_get()?;
        match cursor {
            Some(Cursor::Data(pending)) => Ok(self.data_page(pending, spec)),
            _ => Err(SyncError::storage("unknown continue token")),
        }
    }

    fn release_continue_token(&self, token: ContinueToken) {
        self.cursors.lock().remove(&token.handle());
    }

    fn put_sync_data(&self, entries: &[DataItem], _device: &str) -> SyncResult<()> {
        if let Some(err) = self.put_error.lock().clone() {
            return Err(err);
        }
        let mut stored = self.entries.lock();
        for entry in entries {
            let newer = stored
                .get(&entry.key)
                .map_or(true, |existing| existing.timestamp < entry.timestamp);
            if newer {
                stored.insert(entry.key.clone(), entry.clone());
            }
        }
        self.put_batches.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn get_security_option(&self) -> SecurityOption {
        self.security
    }

    fn get_compression_algo(&self) -> Vec<CompressAlgorithm> {
        self.compression.clone()
    }

    fn schema_fingerprint(&self) -> String {
        self.schema.clone()
    }

    fn execute_query(
        &self,
        stmt: &PreparedStmt,
        packet_budget: usize,
        token: Option<ContinueToken>,
    ) -> SyncResult<QueryPage> {
        if let Some(err) = self.query_error.lock().clone() {
            if let Some(token) = token {
                self.release_continue_token(token);
            }
            return Err(err);
        }
        if let Some(token) = token {
            return match self.cursors.lock().remove(&token.handle()) {
                Some(Cursor::Rows { columns, rows }) => Ok(self.rows_page(columns, rows, packet_budget)),
                _ => Err(SyncError::storage("unknown continue token")),
            };
        }
        let table = table_name(&stmt.sql).ok_or(SyncError::InvalidQueryFormat)?;
        let set = self
            .tables
            .lock()
            .get(table)
            .cloned()
            .ok_or(SyncError::InvalidQueryField)?;
        Ok(self.rows_page(set.columns, set.rows.into(), packet_budget))
    }
}

fn fingerprint(schema: &str) -> String {
    Sha256::digest(schema.as_bytes())
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect()
}

fn table_name(sql: &str) -> Option<&str> {
    let mut words = sql.split_whitespace();
    words.find(|w| w.eq_ignore_ascii_case("from"))?;
    words.next().map(|w| w.trim_end_matches(';'))
}

fn entry_size(entry: &DataItem) -> usize {
    entry.key.len() + entry.value.len() + entry.origin_device.len() + 16
}

fn row_size(row: &[FieldValue]) -> usize {
    row.iter()
        .map(|field| match field {
            FieldValue::Null => 1,
            FieldValue::Integer(_) | FieldValue::Real(_) => 9,
            FieldValue::Text(s) => s.len() + 4,
            FieldValue::Blob(b) => b.len() + 4,
        })
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(packet_size: usize) -> DataSizeSpec {
        DataSizeSpec {
            block_size: 1024 * 1024,
            packet_size,
        }
    }

    #[test]
    fn pages_sync_data_by_count() {
        let storage = MemoryStorage::new();
        for i in 0..5u8 {
            storage.put(vec![i], vec![i]);
        }
        let first = storage.get_sync_data(0, u64::MAX, &spec(2)).unwrap();
        assert_eq!(first.entries.len(), 2);
        let second = storage
            .get_sync_data_next(first.token.unwrap(), &spec(2))
            .unwrap();
        assert_eq!(second.entries[0].key, vec![2]);
        let third = storage
            .get_sync_data_next(second.token.unwrap(), &spec(2))
            .unwrap();
        assert_eq!(third.entries.len(), 1);
        assert!(third.token.is_none());
        assert_eq!(storage.open_tokens(), 0);
    }

    #[test]
    fn older_remote_entries_do_not_overwrite() {
        let storage = MemoryStorage::new();
        storage.put("k", "local");
        storage.put("k", "newer");
        storage
            .put_sync_data(&[DataItem::new("k", "remote", 1)], "dev-b")
            .unwrap();
        assert_eq!(storage.get(b"k"), Some(b"newer".to_vec()));
    }

    #[test]
    fn remote_query_pages_rows() {
        let rows = (0..5).map(|i| vec![FieldValue::Integer(i)]).collect();
        let storage = MemoryStorage::new()
            .with_table("t", &["id"], rows)
            .with_query_page_rows(2);
        let stmt = PreparedStmt::query("SELECT id FROM t;");
        let first = storage.execute_query(&stmt, 4096, None).unwrap();
        assert_eq!(first.rows.len(), 2);
        let token = first.token.unwrap();
        assert_eq!(storage.open_tokens(), 1);
        storage.release_continue_token(token);
        assert_eq!(storage.open_tokens(), 0);
    }

    #[test]
    fn unknown_table_is_a_field_error() {
        let storage = MemoryStorage::new();
        let err = storage
            .execute_query(&PreparedStmt::query("SELECT * FROM missing"), 4096, None)
            .unwrap_err();
        assert_eq!(err, SyncError::InvalidQueryField);
    }

    #[test]
    fn schemas_fingerprint_differently() {
        let a = MemoryStorage::new().with_schema("v1");
        let b = MemoryStorage::new().with_schema("v2");
        assert_ne!(a.schema_fingerprint(), b.schema_fingerprint());
    }
}
