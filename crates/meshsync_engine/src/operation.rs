//! Sync operations and their per-device outcome.

use crate::error::{SyncError, SyncResult};
use meshsync_protocol::{QueryObject, SyncMode};
use parking_lot::{Condvar, Mutex};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Per-device outcome of a sync operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationStatus {
    /// Queued.
    Waiting,
    /// Running.
    Syncing,
    /// Local data sent; still receiving.
    SendFinished,
    /// Remote data received; still sending.
    RecvFinished,
    /// Failed for an unclassified reason.
    Failed,
    /// Completed in both directions.
    FinishedAll,
    /// Timed out.
    Timeout,
    /// Permission denied.
    PermissionCheckFailed,
    /// The peer became unreachable.
    CommAbnormal,
    /// Security labels are incompatible.
    SecurityOptionCheckFailure,
    /// The data key was revoked.
    EkeyrevokedFailure,
    /// The peer was busy.
    BusyFailure,
    /// The schemas are incompatible.
    SchemaIncompatible,
    /// The query could not be parsed.
    QueryFormatFailure,
    /// The query names an unknown field.
    QueryFieldFailure,
    /// The peer does not support the request.
    NotSupport,
    /// A data interceptor rejected the data.
    InterceptDataFail,
    /// A resource limit was hit.
    MaxLimits,
    /// The schema changed during the sync.
    SchemaChanged,
    /// The request was malformed.
    InvalidArgs,
    /// The active user changed.
    UserChanged,
    /// The statement was denied.
    DeniedSql,
}

impl OperationStatus {
    /// Returns true once the device needs no further work.
    pub fn is_terminal(self) -> bool {
        !matches!(
            self,
            OperationStatus::Waiting
                | OperationStatus::Syncing
                | OperationStatus::SendFinished
                | OperationStatus::RecvFinished
        )
    }
}

/// Final status per device.
pub type SyncReport = HashMap<String, OperationStatus>;

/// What a caller asks the engine to sync.
#[derive(Debug, Clone)]
pub struct SyncRequest {
    /// Target devices.
    pub devices: Vec<String>,
    /// Sync mode.
    pub mode: SyncMode,
    /// Query for query modes.
    pub query: Option<QueryObject>,
    /// Auto sync tasks coalesce and are dropped silently on teardown.
    pub is_auto: bool,
}

impl SyncRequest {
    /// Creates a manual request.
    pub fn new(devices: Vec<String>, mode: SyncMode) -> Self {
        Self {
            devices,
            mode,
            query: None,
            is_auto: false,
        }
    }

    /// Attaches a query.
    pub fn with_query(mut self, query: QueryObject) -> Self {
        self.query = Some(query);
        self
    }

    /// Marks the request as auto sync.
    pub fn with_auto(mut self, is_auto: bool) -> Self {
        self.is_auto = is_auto;
        self
    }
}

#[derive(Debug)]
enum ReportState {
    Pending,
    Ready(SyncReport),
    Taken,
    Abandoned,
}

/// Single-shot report slot shared by an operation and its handle.
#[derive(Debug)]
struct ReportSlot {
    state: Mutex<ReportState>,
    ready: Condvar,
}

impl ReportSlot {
    fn new() -> Self {
        Self {
            state: Mutex::new(ReportState::Pending),
            ready: Condvar::new(),
        }
    }

    /// Moves a pending slot to `next`. Returns false if it already left
    /// `Pending`.
    fn settle(&self, next: ReportState) -> bool {
        let mut state = self.state.lock();
        if !matches!(*state, ReportState::Pending) {
            return false;
        }
        *state = next;
        drop(state);
        self.ready.notify_all();
        true
    }

    fn take(state: &mut ReportState) -> Option<SyncResult<SyncReport>> {
        match std::mem::replace(state, ReportState::Taken) {
            ReportState::Ready(report) => Some(Ok(report)),
            ReportState::Abandoned => {
                *state = ReportState::Abandoned;
                Some(Err(SyncError::internal("operation dropped before completing")))
            }
            ReportState::Pending => {
                *state = ReportState::Pending;
                None
            }
            ReportState::Taken => Some(Err(SyncError::internal("report already taken"))),
        }
    }
}

/// Caller side of a sync operation's completion.
#[derive(Debug)]
pub struct SyncHandle {
    sync_id: u32,
    slot: Arc<ReportSlot>,
}

impl SyncHandle {
    /// Id of the operation.
    pub fn sync_id(&self) -> u32 {
        self.sync_id
    }

    /// Returns the report if it has arrived.
    pub fn try_report(&mut self) -> Option<SyncReport> {
        let mut state = self.slot.state.lock();
        if !matches!(*state, ReportState::Ready(_)) {
            return None;
        }
        ReportSlot::take(&mut state).and_then(Result::ok)
    }

    /// Blocks until every device finished, or `timeout` elapses.
    pub fn wait(self, timeout: Duration) -> SyncResult<SyncReport> {
        let deadline = Instant::now() + timeout;
        let mut state = self.slot.state.lock();
        loop {
            if let Some(outcome) = ReportSlot::take(&mut state) {
                return outcome;
            }
            if self.slot.ready.wait_until(&mut state, deadline).timed_out() {
                return ReportSlot::take(&mut state).unwrap_or(Err(SyncError::Timeout));
            }
        }
    }
}

/// One sync request fanned out to its devices.
#[derive(Debug)]
pub struct SyncOperation {
    sync_id: u32,
    devices: Vec<String>,
    mode: SyncMode,
    is_auto: bool,
    query: Option<QueryObject>,
    query_id: String,
    statuses: Mutex<HashMap<String, OperationStatus>>,
    completion: Arc<ReportSlot>,
    killed: AtomicBool,
}

impl SyncOperation {
    /// Creates the operation and the handle its report is delivered to.
    pub fn new(sync_id: u32, request: SyncRequest) -> (Arc<Self>, SyncHandle) {
        let slot = Arc::new(ReportSlot::new());
        let statuses = request
            .devices
            .iter()
            .map(|d| (d.clone(), OperationStatus::Waiting))
            .collect();
        let query_id = request
            .query
            .as_ref()
            .map(QueryObject::identify)
            .unwrap_or_default();
        let operation = Arc::new(Self {
            sync_id,
            devices: request.devices,
            mode: request.mode,
            is_auto: request.is_auto,
            query: request.query,
            query_id,
            statuses: Mutex::new(statuses),
            completion: Arc::clone(&slot),
            killed: AtomicBool::new(false),
        });
        (operation, SyncHandle { sync_id, slot })
    }

    /// Id of the operation.
    pub fn sync_id(&self) -> u32 {
        self.sync_id
    }

    /// Target devices.
    pub fn devices(&self) -> &[String] {
        &self.devices
    }

    /// Sync mode.
    pub fn mode(&self) -> SyncMode {
        self.mode
    }

    /// Returns true for auto sync.
    pub fn is_auto(&self) -> bool {
        self.is_auto
    }

    /// Query, for query modes.
    pub fn query(&self) -> Option<&QueryObject> {
        self.query.as_ref()
    }

    /// Identity of the query, or empty.
    pub fn query_id(&self) -> &str {
        &self.query_id
    }

    /// Returns true if the operation targets a query.
    pub fn is_query_sync(&self) -> bool {
        self.query.is_some()
    }

    /// Current status of `device`.
    pub fn status(&self, device: &str) -> Option<OperationStatus> {
        self.statuses.lock().get(device).copied()
    }

    /// Sets the status of one device. A terminal status is final.
    pub fn set_status(&self, device: &str, status: OperationStatus) {
        if let Some(current) = self.statuses.lock().get_mut(device) {
            if !current.is_terminal() {
                *current = status;
            }
        }
    }

    /// Sets every non-terminal device to `status`.
    pub fn set_unfinished_status(&self, status: OperationStatus) {
        for current in self.statuses.lock().values_mut() {
            if !current.is_terminal() {
                *current = status;
            }
        }
    }

    /// Returns true once every device is terminal.
    pub fn is_all_finished(&self) -> bool {
        self.statuses.lock().values().all(|s| s.is_terminal())
    }

    /// Delivers the report if every device is terminal. Delivers at most once.
    pub fn finished(&self) -> bool {
        let report = {
            let statuses = self.statuses.lock();
            if !statuses.values().all(|s| s.is_terminal()) {
                return false;
            }
            statuses.clone()
        };
        self.completion.settle(ReportState::Ready(report))
    }

    /// Marks the operation abandoned; queued targets are skipped.
    pub fn kill(&self) {
        self.killed.store(true, Ordering::SeqCst);
    }

    /// Returns true once killed.
    pub fn is_killed(&self) -> bool {
        self.killed.load(Ordering::SeqCst)
    }
}

impl Drop for SyncOperation {
    fn drop(&mut self) {
        self.completion.settle(ReportState::Abandoned);
    }
}
