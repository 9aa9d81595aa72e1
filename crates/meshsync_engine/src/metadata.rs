//! Per-device sync metadata persisted through storage.

use crate::error::{SyncError, SyncResult};
use crate::storage::SyncStorage;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

const KEY_PREFIX: &str = "meshsync/meta/";

/// Watermarks and clock offsets, cached in memory and written through.
pub(crate) struct Metadata {
    storage: Arc<dyn SyncStorage>,
    cache: Mutex<HashMap<String, u64>>,
}

impl Metadata {
    pub(crate) fn new(storage: Arc<dyn SyncStorage>) -> Self {
        Self {
            storage,
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Next timestamp to send to `device`.
    pub(crate) fn local_watermark(&self, device: &str) -> SyncResult<u64> {
        self.get(&format!("local/{device}"))
    }

    pub(crate) fn set_local_watermark(&self, device: &str, value: u64) -> SyncResult<()> {
        self.put_max(&format!("local/{device}"), value)
    }

    /// Next timestamp expected from `device`.
    pub(crate) fn peer_watermark(&self, device: &str) -> SyncResult<u64> {
        self.get(&format!("peer/{device}"))
    }

    pub(crate) fn set_peer_watermark(&self, device: &str, value: u64) -> SyncResult<()> {
        self.put_max(&format!("peer/{device}"), value)
    }

    pub(crate) fn send_query_watermark(&self, query_id: &str, device: &str) -> SyncResult<u64> {
        self.get(&format!("query-send/{query_id}/{device}"))
    }

    pub(crate) fn set_send_query_watermark(
        &self,
        query_id: &str,
        device: &str,
        value: u64,
    ) -> SyncResult<()> {
        self.put_max(&format!("query-send/{query_id}/{device}"), value)
    }

    pub(crate) fn recv_query_watermark(&self, query_id: &str, device: &str) -> SyncResult<u64> {
        self.get(&format!("query-recv/{query_id}/{device}"))
    }

    pub(crate) fn set_recv_query_watermark(
        &self,
        query_id: &str,
        device: &str,
        value: u64,
    ) -> SyncResult<()> {
        self.put_max(&format!("query-recv/{query_id}/{device}"), value)
    }

    /// Clock offset of `device` relative to this device, in ticks.
    pub(crate) fn time_offset(&self, device: &str) -> SyncResult<i64> {
        Ok(self.get(&format!("offset/{device}"))? as i64)
    }

    pub(crate) fn set_time_offset(&self, device: &str, offset: i64) -> SyncResult<()> {
        self.put(&format!("offset/{device}"), offset as u64)
    }

    /// Forgets everything recorded for `device`.
    pub(crate) fn clear_device(&self, device: &str) -> SyncResult<()> {
        let suffix = format!("/{device}");
        let keys: Vec<String> = {
            let mut cache = self.cache.lock();
            let keys = cache
                .keys()
                .filter(|k| k.ends_with(&suffix))
                .cloned()
                .collect::<Vec<_>>();
            for key in &keys {
                cache.remove(key);
            }
            keys
        };
        let mut raw: Vec<Vec<u8>> = keys.iter().map(|k| storage_key(k)).collect();
        raw.push(storage_key(&format!("local{suffix}")));
        raw.push(storage_key(&format!("peer{suffix}")));
        raw.push(storage_key(&format!("offset{suffix}")));
        raw.sort();
        raw.dedup();
        self.storage.delete_meta_data(&raw)
    }

    fn get(&self, key: &str) -> SyncResult<u64> {
        if let Some(value) = self.cache.lock().get(key) {
            return Ok(*value);
        }
        let value = match self.storage.get_meta_data(&storage_key(key))? {
            None => 0,
            Some(bytes) => {
                let raw: [u8; 8] = bytes.as_slice().try_into().map_err(|_| {
                    SyncError::internal(format!("metadata {key} has {} bytes", bytes.len()))
                })?;
                u64::from_le_bytes(raw)
            }
        };
        self.cache.lock().insert(key.to_string(), value);
        Ok(value)
    }

    fn put(&self, key: &str, value: u64) -> SyncResult<()> {
        self.storage
            .put_meta_data(&storage_key(key), &value.to_le_bytes())?;
        self.cache.lock().insert(key.to_string(), value);
        Ok(())
    }

    /// Watermarks never move backwards.
    fn put_max(&self, key: &str, value: u64) -> SyncResult<()> {
        if value <= self.get(key)? {
            return Ok(());
        }
        self.put(key, value)
    }
}

fn storage_key(key: &str) -> Vec<u8> {
    format!("{KEY_PREFIX}{key}").into_bytes()
}
