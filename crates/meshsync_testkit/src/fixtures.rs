//! Engines wired to a virtual network.

use crate::network::{VirtualCommunicator, VirtualHub};
use crate::storage::MemoryStorage;
use meshsync_engine::{SyncConfig, SyncEngine, SyncResult};
use std::sync::Arc;
use std::time::Duration;

/// One engine with its store and transport.
pub struct TestDevice {
    /// Device id.
    pub id: String,
    /// The local store.
    pub storage: Arc<MemoryStorage>,
    /// The device's transport.
    pub communicator: Arc<VirtualCommunicator>,
    /// The engine under test.
    pub engine: Arc<SyncEngine>,
}

impl TestDevice {
    /// Starts an engine for `id` on `hub`.
    pub fn spawn(hub: &VirtualHub, id: &str, storage: MemoryStorage, config: SyncConfig) -> SyncResult<Self> {
        let storage = Arc::new(storage);
        let communicator = hub.communicator(id);
        let engine = SyncEngine::new(config, storage.clone(), communicator.clone())?;
        Ok(Self {
            id: id.to_string(),
            storage,
            communicator,
            engine,
        })
    }
}

impl Drop for TestDevice {
    fn drop(&mut self) {
        self.engine.close();
    }
}

/// Configuration with short timeouts for `id`.
pub fn test_config(id: &str) -> SyncConfig {
    SyncConfig::new(id)
        .with_default_timeout(Duration::from_secs(2))
        .with_data_notify(Duration::from_millis(200), 5)
}
