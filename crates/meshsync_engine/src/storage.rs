//! Storage contract consumed by the sync engine.

use crate::error::SyncResult;
use meshsync_protocol::{
    CompressAlgorithm, DataItem, PreparedStmt, QueryObject, RelationalRowDataSet, SecurityOption,
};

/// Opaque paging handle owned by storage.
///
/// A token is consumed by [`SyncStorage::get_sync_data_next`] or released
/// with [`SyncStorage::release_continue_token`]; it cannot be copied.
#[derive(Debug, PartialEq, Eq)]
pub struct ContinueToken(u64);

impl ContinueToken {
    /// Wraps a storage-defined handle.
    pub fn new(handle: u64) -> Self {
        Self(handle)
    }

    /// The storage-defined handle.
    pub fn handle(&self) -> u64 {
        self.0
    }
}

/// Page size limits for a data read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataSizeSpec {
    /// Maximum encoded bytes.
    pub block_size: usize,
    /// Maximum entries.
    pub packet_size: usize,
}

/// One page of sync data.
#[derive(Debug, Default)]
pub struct SyncDataPage {
    /// Entries in timestamp order.
    pub entries: Vec<DataItem>,
    /// Set when more pages remain.
    pub token: Option<ContinueToken>,
}

/// One page of a relational query.
#[derive(Debug, Default)]
pub struct QueryPage {
    /// Rows of this page.
    pub rows: RelationalRowDataSet,
    /// Set when more pages remain.
    pub token: Option<ContinueToken>,
}

/// The local store as seen by the sync engine.
pub trait SyncStorage: Send + Sync {
    /// Reads a metadata value.
    fn get_meta_data(&self, key: &[u8]) -> SyncResult<Option<Vec<u8>>>;

    /// Writes a metadata value.
    fn put_meta_data(&self, key: &[u8], value: &[u8]) -> SyncResult<()>;

    /// Deletes metadata values.
    fn delete_meta_data(&self, keys: &[Vec<u8>]) -> SyncResult<()>;

    /// Largest timestamp of any local entry, or 0 when empty.
    fn get_max_timestamp(&self) -> u64;

    /// First page of entries with `begin <= timestamp <= end`.
    fn get_sync_data(&self, begin: u64, end: u64, spec: &DataSizeSpec) -> SyncResult<SyncDataPage>;

    /// First page of entries matching `query` in the timestamp range.
    fn get_sync_data_by_query(
        &self,
        query: &QueryObject,
        begin: u64,
        end: u64,
        spec: &DataSizeSpec,
    ) -> SyncResult<SyncDataPage>;

    /// Next page for a token returned earlier.
    fn get_sync_data_next(&self, token: ContinueToken, spec: &DataSizeSpec) -> SyncResult<SyncDataPage>;

    /// Releases a token without reading further.
    fn release_continue_token(&self, token: ContinueToken);

    /// Saves entries received from `device`.
    fn put_sync_data(&self, entries: &[DataItem], device: &str) -> SyncResult<()>;

    /// Security option of the store.
    fn get_security_option(&self) -> SecurityOption;

    /// Compression algorithms the store accepts.
    fn get_compression_algo(&self) -> Vec<CompressAlgorithm>;

    /// Fingerprint of the schema; peers with different fingerprints do not sync.
    fn schema_fingerprint(&self) -> String;

    /// Validates a query before data is read or saved for it.
    fn check_query(&self, _query: &QueryObject) -> SyncResult<()> {
        Ok(())
    }

    /// Runs a statement and returns one page of at most `packet_budget` bytes.
    fn execute_query(
        &self,
        stmt: &PreparedStmt,
        packet_budget: usize,
        token: Option<ContinueToken>,
    ) -> SyncResult<QueryPage>;

    /// Returns false when the store's key is unavailable.
    fn is_readable(&self) -> bool {
        true
    }
}
