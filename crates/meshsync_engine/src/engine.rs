//! The engine facade.
//!
//! [`SyncEngine`] owns the scheduler, the remote executor and one state
//! machine per peer. Machines are created on first use and live until the
//! engine is closed.

use crate::communicator::Communicator;
use crate::config::SyncConfig;
use crate::error::{SyncError, SyncResult};
use crate::metadata::Metadata;
use crate::operation::{OperationStatus, SyncHandle, SyncOperation, SyncRequest};
use crate::remote_executor::{RemoteExecutor, RemoteQueryHandle};
use crate::scheduler::{TaskScheduler, INVALID_TASK_ID};
use crate::state_machine::{State, SyncStateMachine};
use crate::storage::SyncStorage;
use crate::subscribe::SubscribeManager;
use crate::time_helper::{mask_device, now_ticks};
use meshsync_protocol::{Message, MessageId, PreparedStmt, RelationalRowDataSet, SyncMode};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::{debug, info, warn};

/// State shared by the engine and every state machine.
pub(crate) struct EngineShared {
    pub(crate) config: Arc<SyncConfig>,
    pub(crate) storage: Arc<dyn SyncStorage>,
    pub(crate) communicator: Arc<dyn Communicator>,
    pub(crate) scheduler: Arc<TaskScheduler>,
    pub(crate) metadata: Arc<Metadata>,
    pub(crate) subscribes: Arc<SubscribeManager>,
}

/// Syncs a local store with its peers.
///
/// ```no_run
/// # use std::sync::Arc;
/// # use std::time::Duration;
/// # use meshsync_engine::{SyncConfig, SyncEngine, SyncRequest, SyncStorage, Communicator};
/// # use meshsync_protocol::SyncMode;
/// # fn demo(storage: Arc<dyn SyncStorage>, comm: Arc<dyn Communicator>) -> meshsync_engine::SyncResult<()> {
/// let engine = SyncEngine::new(SyncConfig::new("phone"), storage, comm)?;
/// let handle = engine.sync(SyncRequest::new(vec!["tablet".into()], SyncMode::Push))?;
/// let report = handle.wait(Duration::from_secs(30))?;
/// # let _ = report;
/// engine.close();
/// # Ok(())
/// # }
/// ```
pub struct SyncEngine {
    shared: Arc<EngineShared>,
    executor: Arc<RemoteExecutor>,
    machines: Mutex<HashMap<String, Arc<SyncStateMachine>>>,
    next_sync_id: AtomicU32,
    closed: AtomicBool,
}

impl SyncEngine {
    /// Builds the engine and installs its inbound message handler.
    ///
    /// # Errors
    ///
    /// Fails when the scheduler thread cannot start or the communicator
    /// rejects the handler.
    pub fn new(
        config: SyncConfig,
        storage: Arc<dyn SyncStorage>,
        communicator: Arc<dyn Communicator>,
    ) -> SyncResult<Arc<Self>> {
        let scheduler = Arc::new(TaskScheduler::new(config.scheduler_capacity)?);
        let config = Arc::new(config);
        let executor = RemoteExecutor::new(
            config.remote_executor.clone(),
            Arc::clone(&config),
            Arc::clone(&storage),
            Arc::clone(&communicator),
            Arc::clone(&scheduler),
        );
        let shared = Arc::new(EngineShared {
            config,
            metadata: Arc::new(Metadata::new(Arc::clone(&storage))),
            storage,
            communicator: Arc::clone(&communicator),
            scheduler,
            subscribes: Arc::new(SubscribeManager::new()),
        });
        let engine = Arc::new(Self {
            shared,
            executor,
            machines: Mutex::new(HashMap::new()),
            next_sync_id: AtomicU32::new(1),
            closed: AtomicBool::new(false),
        });
        let weak: Weak<SyncEngine> = Arc::downgrade(&engine);
        communicator.register_message_handler(Arc::new(move |source: &str, message: Message| {
            if let Some(engine) = weak.upgrade() {
                if let Err(e) = engine.receive_message(source, message) {
                    debug!(device = %mask_device(source), error = %e, "[SyncEngine] inbound message rejected");
                }
            }
        }))?;
        info!(device = %mask_device(&engine.shared.config.local_device), "[SyncEngine] started");
        Ok(engine)
    }

    /// Identity of this device.
    pub fn local_device(&self) -> &str {
        &self.shared.config.local_device
    }

    /// Starts a sync operation.
    ///
    /// # Errors
    ///
    /// `InvalidArgs` for an empty device list, an empty or local device id,
    /// a query mode without a query or the internal `ResponsePull` mode.
    /// `Busy` once the engine is closed.
    pub fn sync(&self, request: SyncRequest) -> SyncResult<SyncHandle> {
        if self.closed.load(Ordering::Acquire) {
            return Err(SyncError::Busy);
        }
        self.check_request(&request)?;
        if request.mode.is_control() {
            if let Some(query) = &request.query {
                for device in &request.devices {
                    self.shared.subscribes.reserve_local(device, query)?;
                }
            }
        }
        let sync_id = self.next_sync_id();
        let (operation, handle) = SyncOperation::new(sync_id, request);
        let local_max = self.shared.storage.get_max_timestamp();
        let end_watermark = if operation.mode().receives_data() {
            now_ticks().max(local_max)
        } else {
            local_max
        };
        info!(sync_id, mode = ?operation.mode(), devices = operation.devices().len(),
            "[SyncEngine] sync requested");
        for device in operation.devices() {
            let machine = self.machine(device);
            if machine.context().add_sync_operation(&operation, end_watermark) {
                self.start_machine(&machine);
            }
        }
        Ok(handle)
    }

    fn check_request(&self, request: &SyncRequest) -> SyncResult<()> {
        if request.devices.is_empty() {
            return Err(SyncError::invalid_args("no devices"));
        }
        let local = &self.shared.config.local_device;
        if let Some(device) = request.devices.iter().find(|d| d.is_empty() || *d == local) {
            return Err(SyncError::invalid_args(format!(
                "invalid target device {:?}",
                mask_device(device)
            )));
        }
        if request.mode == SyncMode::ResponsePull {
            return Err(SyncError::invalid_args("response pull is not a request mode"));
        }
        if (request.mode.is_query() || request.mode.is_control()) && request.query.is_none() {
            return Err(SyncError::invalid_args("query mode without a query"));
        }
        Ok(())
    }

    fn next_sync_id(&self) -> u32 {
        loop {
            let id = self.next_sync_id.fetch_add(1, Ordering::Relaxed);
            if id != 0 {
                return id;
            }
        }
    }

    fn machine(&self, device: &str) -> Arc<SyncStateMachine> {
        let mut machines = self.machines.lock();
        let machine = machines
            .entry(device.to_string())
            .or_insert_with(|| SyncStateMachine::new(device, Arc::clone(&self.shared)));
        Arc::clone(machine)
    }

    fn start_machine(&self, machine: &Arc<SyncStateMachine>) {
        let weak = Arc::downgrade(machine);
        let id = self.shared.scheduler.execute(move || {
            if let Some(machine) = weak.upgrade() {
                machine.start_sync();
            }
        });
        if id == INVALID_TASK_ID {
            machine.start_sync();
        }
    }

    /// Routes an inbound message from `source`.
    pub fn receive_message(&self, source: &str, message: Message) -> SyncResult<()> {
        let received_at = now_ticks();
        if self.closed.load(Ordering::Acquire) {
            return Err(SyncError::Busy);
        }
        match message.id() {
            Some(MessageId::RemoteExecute) => self.executor.receive_message(source, message),
            Some(_) => self.machine(source).receive_message(message, received_at),
            None => {
                warn!(device = %mask_device(source), message_id = message.message_id,
                    "[SyncEngine] unknown message id");
                Err(SyncError::UnknownMessage)
            }
        }
    }

    /// Runs `stmt` on `device` and blocks until its rows arrive.
    pub fn remote_query(
        &self,
        device: &str,
        stmt: PreparedStmt,
        timeout: Duration,
        connection_id: u64,
    ) -> SyncResult<RelationalRowDataSet> {
        self.executor.remote_query(device, stmt, timeout, connection_id)
    }

    /// Queues a remote query and returns without waiting for it.
    pub fn submit_remote_query(
        &self,
        device: &str,
        stmt: PreparedStmt,
        timeout: Duration,
        connection_id: u64,
    ) -> SyncResult<RemoteQueryHandle> {
        self.executor
            .submit_remote_query(device, stmt, timeout, connection_id)
    }

    /// Fails every task of `device` and forgets what was negotiated with it.
    pub fn notify_device_offline(&self, device: &str) {
        info!(device = %mask_device(device), "[SyncEngine] device offline");
        let machine = self.machines.lock().get(device).cloned();
        if let Some(machine) = machine {
            machine.context().clear_all_sync_task();
            machine.abort(OperationStatus::CommAbnormal);
            machine.reset_peer_state();
        }
        self.shared.subscribes.clear_device(device);
        self.executor.notify_device_offline(device);
    }

    /// Fails running work after the local account changed.
    pub fn notify_user_change(&self) {
        info!("[SyncEngine] user changed");
        let machines: Vec<_> = self.machines.lock().values().cloned().collect();
        for machine in machines {
            machine.context().clear_all_sync_task();
            machine.abort(OperationStatus::UserChanged);
        }
        self.executor.notify_user_change();
    }

    /// Fails remote queries submitted on `connection_id`.
    pub fn notify_connection_closed(&self, connection_id: u64) {
        self.executor.notify_connection_closed(connection_id);
    }

    /// Pushes local changes to every peer holding an active subscription.
    pub fn notify_local_data_changed(&self) -> SyncResult<Vec<SyncHandle>> {
        let subscribers = self.shared.subscribes.remote_subscribers();
        let mut handles = Vec::with_capacity(subscribers.len());
        for (device, query) in subscribers {
            let request = SyncRequest::new(vec![device], SyncMode::QueryPush)
                .with_query(query)
                .with_auto(true);
            handles.push(self.sync(request)?);
        }
        Ok(handles)
    }

    /// Current state of the machine for `device`, if one exists.
    pub fn machine_state(&self, device: &str) -> Option<State> {
        self.machines.lock().get(device).map(|m| m.state())
    }

    /// Stops every machine, closes the executor and stops the scheduler.
    ///
    /// Must not be called from a callback the engine runs.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        info!("[SyncEngine] close");
        let machines: Vec<_> = self.machines.lock().drain().map(|(_, m)| m).collect();
        for machine in machines {
            machine.kill();
        }
        self.executor.close();
        self.shared.scheduler.shutdown();
    }
}

impl Drop for SyncEngine {
    fn drop(&mut self) {
        self.close();
    }
}
