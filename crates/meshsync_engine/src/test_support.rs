//! In-crate doubles for unit tests.

use crate::communicator::{Communicator, MessageHandler, OnSendResult, SendConfig};
use crate::error::SyncResult;
use crate::storage::{ContinueToken, DataSizeSpec, QueryPage, SyncDataPage, SyncStorage};
use meshsync_protocol::{
    CompressAlgorithm, DataItem, Message, PreparedStmt, QueryObject, SecurityOption,
};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

/// Unpaged in-memory store.
#[derive(Default)]
pub(crate) struct FakeStorage {
    pub(crate) meta: Mutex<HashMap<Vec<u8>, Vec<u8>>>,
    pub(crate) entries: Mutex<Vec<DataItem>>,
    pub(crate) received: Mutex<Vec<DataItem>>,
    pub(crate) security: SecurityOption,
    pub(crate) query_delay: Duration,
    pub(crate) queries_running: AtomicUsize,
    pub(crate) queries_peak: AtomicUsize,
}

impl FakeStorage {
    pub(crate) fn with_entries(entries: Vec<DataItem>) -> Self {
        Self {
            entries: Mutex::new(entries),
            ..Self::default()
        }
    }
}

impl SyncStorage for FakeStorage {
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
            .iter()
            .map(|e| e.timestamp)
            .max()
            .unwrap_or(0)
    }

    fn get_sync_data(&self, begin: u64, end: u64, _spec: &DataSizeSpec) -> SyncResult<SyncDataPage> {
        let entries = self
            .entries
            .lock()
            .iter()
            .filter(|e| e.timestamp >= begin && e.timestamp <= end)
            .cloned()
            .collect();
        Ok(SyncDataPage {
            entries,
            token: None,
        })
    }

    fn get_sync_data_by_query(
        &self,
        query: &QueryObject,
        begin: u64,
        end: u64,
        spec: &DataSizeSpec,
    ) -> SyncResult<SyncDataPage> {
        let mut page = self.get_sync_data(begin, end, spec)?;
        page.entries.retain(|e| query.matches_key(&e.key));
        Ok(page)
    }

    fn get_sync_data_next(&self, _token: ContinueToken, _spec: &DataSizeSpec) -> SyncResult<SyncDataPage> {
        Ok(SyncDataPage::default())
    }

    fn release_continue_token(&self, _token: ContinueToken) {}

    fn put_sync_data(&self, entries: &[DataItem], _device: &str) -> SyncResult<()> {
        self.received.lock().extend_from_slice(entries);
        Ok(())
    }

    fn get_security_option(&self) -> SecurityOption {
        self.security
    }

    fn get_compression_algo(&self) -> Vec<CompressAlgorithm> {
        Vec::new()
    }

    fn schema_fingerprint(&self) -> String {
        "fake-schema".to_string()
    }

    fn execute_query(
        &self,
        _stmt: &PreparedStmt,
        _packet_budget: usize,
        _token: Option<ContinueToken>,
    ) -> SyncResult<QueryPage> {
        let running = self.queries_running.fetch_add(1, Ordering::SeqCst) + 1;
        self.queries_peak.fetch_max(running, Ordering::SeqCst);
        if !self.query_delay.is_zero() {
            thread::sleep(self.query_delay);
        }
        self.queries_running.fetch_sub(1, Ordering::SeqCst);
        Ok(QueryPage::default())
    }
}

/// Records every sent message and reports success synchronously.
pub(crate) struct RecordingCommunicator {
    pub(crate) local: String,
    pub(crate) version: u16,
    pub(crate) sent: Mutex<Vec<(String, Message)>>,
    pub(crate) handler: Mutex<Option<MessageHandler>>,
}

impl RecordingCommunicator {
    pub(crate) fn new(local: &str) -> Self {
        Self {
            local: local.to_string(),
            version: 1,
            sent: Mutex::new(Vec::new()),
            handler: Mutex::new(None),
        }
    }

    pub(crate) fn take_sent(&self) -> Vec<(String, Message)> {
        std::mem::take(&mut *self.sent.lock())
    }
}

impl Communicator for RecordingCommunicator {
    fn send_message(
        &self,
        target: &str,
        message: Message,
        _config: &SendConfig,
        on_send_result: Option<OnSendResult>,
    ) -> SyncResult<()> {
        self.sent.lock().push((target.to_string(), message));
        if let Some(callback) = on_send_result {
            callback(Ok(()));
        }
        Ok(())
    }

    fn local_identity(&self) -> String {
        self.local.clone()
    }

    fn remote_communicator_version(&self, _device: &str) -> u16 {
        self.version
    }

    fn timeout(&self, _device: &str) -> Duration {
        Duration::from_secs(5)
    }

    fn mtu_size(&self, _device: &str) -> usize {
        64 * 1024
    }

    fn register_message_handler(&self, handler: MessageHandler) -> SyncResult<()> {
        *self.handler.lock() = Some(handler);
        Ok(())
    }
}
