//! Per-device sync task context.
//!
//! A [`SyncTaskContext`] owns the two target queues of one peer and the live
//! fields of the task the state machine is executing. Outside callers (the
//! engine facade, teardown) only enqueue, drain or kill; everything else is
//! driven by the device's state machine.

mod single_ver;

use crate::config::{PermissionFlag, SyncConfig};
use crate::error::{SyncError, SyncResult};
use crate::metadata::Metadata;
use crate::operation::{OperationStatus, SyncOperation};
use crate::scheduler::{TaskId, TaskScheduler, INVALID_TASK_ID};
use crate::storage::{ContinueToken, SyncStorage};
use crate::target::{SyncTarget, TaskKind};
use crate::time_helper::mask_device;
use meshsync_protocol::{CapabilitySet, CompressAlgorithm, QueryObject, SecurityOption, SyncMode};
use parking_lot::Mutex;
use rand::Rng;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Largest shift applied to the auto sync retry timeout.
const MAX_RETRY_SHIFT: u32 = 5;

/// Whether a timed-out step may be retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RetryStatus {
    NeedRetry,
    NoNeedRetry,
}

/// Lifecycle of the context's task loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskExecStatus {
    /// Never started.
    Idle,
    /// A state machine is executing targets.
    Running,
    /// The queues ran dry.
    Finished,
}

struct ContextState {
    request_targets: VecDeque<SyncTarget>,
    response_targets: VecDeque<SyncTarget>,
    current: Option<SyncTarget>,
    mode: SyncMode,
    request_session_id: u32,
    last_request_session_id: u32,
    response_session_id: u32,
    response_end_watermark: u64,
    response_query: Option<QueryObject>,
    sequence_id: u32,
    continue_token: Option<ContinueToken>,
    retry_time: u32,
    retry_status: RetryStatus,
    task_err: Option<SyncError>,
    last_full_push_status: Option<OperationStatus>,
    last_query_push_status: HashMap<String, OperationStatus>,
    comm_normal: bool,
    remote_software_version: u32,
    remote_version_id: u64,
    remote_security: SecurityOption,
    remote_capabilities: CapabilitySet,
    compress: CompressAlgorithm,
    need_reset_ability_sync: bool,
    ability_finished: bool,
    exec_status: TaskExecStatus,
    time_offset: i64,
    sync_timeout: Duration,
}

struct TaskTimer {
    id: AtomicU64,
    generation: AtomicU64,
    timeout: Mutex<Duration>,
}

/// Mutable session state for one remote device.
pub(crate) struct SyncTaskContext {
    device: String,
    config: Arc<SyncConfig>,
    storage: Arc<dyn SyncStorage>,
    metadata: Arc<Metadata>,
    scheduler: Arc<TaskScheduler>,
    state: Mutex<ContextState>,
    timer: TaskTimer,
    killed: AtomicBool,
}

impl SyncTaskContext {
    pub(crate) fn new(
        device: &str,
        config: Arc<SyncConfig>,
        storage: Arc<dyn SyncStorage>,
        metadata: Arc<Metadata>,
        scheduler: Arc<TaskScheduler>,
    ) -> Self {
        let sync_timeout = config.default_timeout;
        Self {
            device: device.to_string(),
            config,
            storage,
            metadata,
            scheduler,
            state: Mutex::new(ContextState {
                request_targets: VecDeque::new(),
                response_targets: VecDeque::new(),
                current: None,
                mode: SyncMode::Push,
                request_session_id: 0,
                last_request_session_id: 0,
                response_session_id: 0,
                response_end_watermark: 0,
                response_query: None,
                sequence_id: 0,
                continue_token: None,
                retry_time: 0,
                retry_status: RetryStatus::NeedRetry,
                task_err: None,
                last_full_push_status: None,
                last_query_push_status: HashMap::new(),
                comm_normal: true,
                remote_software_version: 0,
                remote_version_id: 0,
                remote_security: SecurityOption::default(),
                remote_capabilities: CapabilitySet::new(),
                compress: CompressAlgorithm::None,
                need_reset_ability_sync: false,
                ability_finished: false,
                exec_status: TaskExecStatus::Idle,
                time_offset: 0,
                sync_timeout,
            }),
            timer: TaskTimer {
                id: AtomicU64::new(INVALID_TASK_ID),
                generation: AtomicU64::new(0),
                timeout: Mutex::new(sync_timeout),
            },
            killed: AtomicBool::new(false),
        }
    }

    pub(crate) fn device(&self) -> &str {
        &self.device
    }

    pub(crate) fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub(crate) fn storage(&self) -> &Arc<dyn SyncStorage> {
        &self.storage
    }

    pub(crate) fn metadata(&self) -> &Arc<Metadata> {
        &self.metadata
    }

    /// Queues `operation` for this device. Returns true when the caller must
    /// start the state machine.
    pub(crate) fn add_sync_operation(&self, operation: &Arc<SyncOperation>, end_watermark: u64) -> bool {
        if operation.is_auto() {
            let mut state = self.state.lock();
            // Plain auto syncs merge into any queued auto target; query auto
            // syncs only into one with the same query.
            let existing = state.request_targets.iter_mut().find(|t| {
                t.is_auto() && (!operation.is_query_sync() || t.query_id() == operation.query_id())
            });
            if let Some(target) = existing {
                target.lift_end_watermark(end_watermark);
                drop(state);
                debug!(device = %mask_device(&self.device), sync_id = operation.sync_id(),
                    "[SyncTaskContext] auto sync merged into queued target");
                operation.set_status(&self.device, OperationStatus::FinishedAll);
                operation.finished();
                return false;
            }
        }
        self.add_sync_target(SyncTarget::request(Arc::clone(operation), end_watermark))
    }

    /// Queues a target. Returns true when the caller must start the state
    /// machine.
    pub(crate) fn add_sync_target(&self, target: SyncTarget) -> bool {
        let mut state = self.state.lock();
        match target.kind() {
            TaskKind::Request => {
                let current_auto = state.current.as_ref().is_some_and(SyncTarget::is_auto);
                if current_auto && !target.is_auto() {
                    state.retry_status = RetryStatus::NoNeedRetry;
                }
                state.request_targets.push_back(target);
            }
            TaskKind::Response => state.response_targets.push_back(target),
        }
        if state.exec_status == TaskExecStatus::Running {
            return false;
        }
        state.exec_status = TaskExecStatus::Running;
        true
    }

    /// Oldest queued pull response.
    pub(crate) fn pop_response_target(&self) -> SyncResult<SyncTarget> {
        self.state
            .lock()
            .response_targets
            .pop_front()
            .ok_or(SyncError::LengthError)
    }

    pub(crate) fn response_queue_len(&self) -> usize {
        self.state.lock().response_targets.len()
    }

    pub(crate) fn is_target_queue_empty(&self) -> bool {
        let state = self.state.lock();
        state.request_targets.is_empty() && state.response_targets.is_empty()
    }

    /// Installs the next runnable target, request queue first. Targets of
    /// killed operations are dropped. Returns false when both queues are empty.
    pub(crate) fn move_to_next_target(&self) -> bool {
        loop {
            let target = {
                let mut state = self.state.lock();
                match state.request_targets.pop_front() {
                    Some(t) => Some(t),
                    None => state.response_targets.pop_front(),
                }
            };
            let Some(target) = target else {
                return false;
            };
            if target.operation().is_some_and(|op| op.is_killed()) {
                continue;
            }
            self.copy_target_data(target);
            return true;
        }
    }

    /// Moves a popped target into the live fields.
    pub(crate) fn copy_target_data(&self, target: SyncTarget) {
        let operation = target.operation().cloned();
        {
            let mut state = self.state.lock();
            state.mode = target.mode();
            if target.kind() == TaskKind::Response {
                state.response_session_id = target.response_session_id();
                state.response_end_watermark = target.end_watermark();
                state.response_query = target.query().cloned();
            }
            state.current = Some(target);
        }
        if let Some(op) = operation {
            op.set_status(&self.device, OperationStatus::Syncing);
        }
    }

    /// Installs a pull response popped while another task is live.
    pub(crate) fn set_response_target(&self, target: &SyncTarget) {
        let mut state = self.state.lock();
        state.response_session_id = target.response_session_id();
        state.response_end_watermark = target.end_watermark();
        state.response_query = target.query().cloned();
    }

    /// Resets the transient fields of the live task. Queues are untouched.
    pub(crate) fn clear(&self) {
        let token = {
            let mut state = self.state.lock();
            state.current = None;
            state.mode = SyncMode::Push;
            state.request_session_id = 0;
            state.response_session_id = 0;
            state.response_end_watermark = 0;
            state.response_query = None;
            state.retry_time = 0;
            state.retry_status = RetryStatus::NeedRetry;
            state.task_err = None;
            state.comm_normal = true;
            state.continue_token.take()
        };
        if let Some(token) = token {
            self.storage.release_continue_token(token);
        }
    }

    /// Drains both queues and the live task. Auto targets finish quietly;
    /// manual ones report the peer as unreachable.
    pub(crate) fn clear_all_sync_task(&self) {
        let targets: Vec<SyncTarget> = {
            let mut state = self.state.lock();
            let mut drained: Vec<SyncTarget> = state.request_targets.drain(..).collect();
            drained.extend(state.response_targets.drain(..));
            drained.extend(state.current.take());
            drained
        };
        info!(device = %mask_device(&self.device), count = targets.len(),
            "[SyncTaskContext] clear all sync tasks");
        for target in targets {
            let auto = target.is_auto();
            if let Some(op) = target.into_operation() {
                let status = if auto {
                    OperationStatus::FinishedAll
                } else {
                    OperationStatus::CommAbnormal
                };
                op.set_status(&self.device, status);
                op.finished();
            }
        }
    }

    /// Sets this device's status on the live operation. SEND and RECV
    /// finished merge into FINISHED_ALL.
    pub(crate) fn set_operation_status(&self, status: OperationStatus) {
        let mut state = self.state.lock();
        let Some(op) = state.current.as_ref().and_then(|t| t.operation()).cloned() else {
            return;
        };
        let merged = match (op.status(&self.device), status) {
            (Some(OperationStatus::RecvFinished), OperationStatus::SendFinished)
            | (Some(OperationStatus::SendFinished), OperationStatus::RecvFinished) => {
                if state.task_err == Some(SyncError::KeyRevoked) {
                    OperationStatus::EkeyrevokedFailure
                } else {
                    OperationStatus::FinishedAll
                }
            }
            _ => status,
        };
        op.set_status(&self.device, merged);
        let Some(final_status) = op.status(&self.device).filter(|s| s.is_terminal()) else {
            return;
        };
        Self::save_last_push_task_exec_status(&mut state, op.query_id(), final_status);
        drop(state);
        op.finished();
    }

    /// Status of this device on the live operation.
    pub(crate) fn operation_status(&self) -> Option<OperationStatus> {
        let state = self.state.lock();
        state
            .current
            .as_ref()
            .and_then(|t| t.operation())
            .and_then(|op| op.status(&self.device))
    }

    /// Reports `status` and resets the live task.
    pub(crate) fn abort(&self, status: OperationStatus) {
        self.set_operation_status(status);
        self.clear();
    }

    pub(crate) fn current_operation(&self) -> Option<Arc<SyncOperation>> {
        self.state
            .lock()
            .current
            .as_ref()
            .and_then(|t| t.operation())
            .cloned()
    }

    pub(crate) fn has_current_target(&self) -> bool {
        self.state.lock().current.is_some()
    }

    pub(crate) fn task_kind(&self) -> Option<TaskKind> {
        self.state.lock().current.as_ref().map(SyncTarget::kind)
    }

    pub(crate) fn mode(&self) -> SyncMode {
        self.state.lock().mode
    }

    pub(crate) fn end_watermark(&self) -> u64 {
        self.state
            .lock()
            .current
            .as_ref()
            .map(SyncTarget::end_watermark)
            .unwrap_or(0)
    }

    pub(crate) fn query(&self) -> Option<QueryObject> {
        self.state
            .lock()
            .current
            .as_ref()
            .and_then(|t| t.query().cloned())
    }

    pub(crate) fn query_id(&self) -> String {
        self.state
            .lock()
            .current
            .as_ref()
            .map(|t| t.query_id().to_string())
            .unwrap_or_default()
    }

    pub(crate) fn is_query_sync(&self) -> bool {
        self.state
            .lock()
            .current
            .as_ref()
            .is_some_and(SyncTarget::is_query_sync)
    }

    pub(crate) fn is_current_sync_task_auto(&self) -> bool {
        self.state.lock().current.as_ref().is_some_and(SyncTarget::is_auto)
    }

    /// Checks the permission hook for the live task's direction.
    pub(crate) fn check_permission(&self) -> bool {
        let mode = self.mode();
        let checker = &self.config.permission_checker;
        let send_ok = !mode.sends_data() || checker.check(&self.device, PermissionFlag::Send);
        let recv_ok = !mode.receives_data() || checker.check(&self.device, PermissionFlag::Receive);
        send_ok && recv_ok
    }

    pub(crate) fn request_session_id(&self) -> u32 {
        self.state.lock().request_session_id
    }

    /// Assigns a fresh random nonzero request session id.
    pub(crate) fn generate_request_session_id(&self) -> u32 {
        let mut state = self.state.lock();
        let mut rng = rand::thread_rng();
        let id = loop {
            let candidate: u32 = rng.gen();
            if candidate != 0 && candidate != state.last_request_session_id {
                break candidate;
            }
        };
        state.last_request_session_id = id;
        state.request_session_id = id;
        id
    }

    pub(crate) fn response_session_id(&self) -> u32 {
        self.state.lock().response_session_id
    }

    pub(crate) fn set_response_session_id(&self, session_id: u32) {
        self.state.lock().response_session_id = session_id;
    }

    pub(crate) fn response_end_watermark(&self) -> u64 {
        self.state.lock().response_end_watermark
    }

    pub(crate) fn response_query(&self) -> Option<QueryObject> {
        self.state.lock().response_query.clone()
    }

    /// Returns true if a pull response for `session_id` is live or queued.
    pub(crate) fn find_response_sync_target(&self, session_id: u32) -> bool {
        let state = self.state.lock();
        state.response_session_id == session_id
            || state
                .response_targets
                .iter()
                .any(|t| t.response_session_id() == session_id)
    }

    pub(crate) fn next_sequence_id(&self) -> u32 {
        let mut state = self.state.lock();
        state.sequence_id = state.sequence_id.wrapping_add(1);
        state.sequence_id
    }

    pub(crate) fn set_continue_token(&self, token: Option<ContinueToken>) {
        let old = std::mem::replace(&mut self.state.lock().continue_token, token);
        if let Some(old) = old {
            self.storage.release_continue_token(old);
        }
    }

    pub(crate) fn take_continue_token(&self) -> Option<ContinueToken> {
        self.state.lock().continue_token.take()
    }

    pub(crate) fn has_continue_token(&self) -> bool {
        self.state.lock().continue_token.is_some()
    }

    /// Releases the held token back to storage.
    pub(crate) fn release_continue_token(&self) {
        self.set_continue_token(None);
    }

    pub(crate) fn retry_time(&self) -> u32 {
        self.state.lock().retry_time
    }

    pub(crate) fn set_retry_time(&self, retry_time: u32) {
        self.state.lock().retry_time = retry_time;
    }

    pub(crate) fn inc_retry_time(&self) -> u32 {
        let mut state = self.state.lock();
        state.retry_time = state.retry_time.saturating_add(1);
        state.retry_time
    }

    pub(crate) fn set_retry_status(&self, status: RetryStatus) {
        self.state.lock().retry_status = status;
    }

    pub(crate) fn retry_status(&self) -> RetryStatus {
        self.state.lock().retry_status
    }

    pub(crate) fn is_sync_task_need_retry(&self) -> bool {
        self.retry_status() == RetryStatus::NeedRetry
    }

    /// Retry budget of the live task.
    pub(crate) fn sync_retry_times(&self) -> u32 {
        if self.is_current_sync_task_auto() {
            self.config.auto_retry_times
        } else {
            self.config.manual_retry_times
        }
    }

    /// Watchdog timeout for retry number `retry_time`. Auto tasks back off.
    pub(crate) fn sync_retry_timeout(&self, retry_time: u32) -> Duration {
        let timeout = self.sync_timeout();
        if !self.is_current_sync_task_auto() {
            return timeout;
        }
        timeout.saturating_mul(1u32 << retry_time.min(MAX_RETRY_SHIFT))
    }

    pub(crate) fn sync_timeout(&self) -> Duration {
        self.state.lock().sync_timeout
    }

    pub(crate) fn set_sync_timeout(&self, timeout: Duration) {
        self.state.lock().sync_timeout = timeout;
    }

    pub(crate) fn set_task_err(&self, err: SyncError) {
        self.state.lock().task_err = Some(err);
    }

    pub(crate) fn task_err(&self) -> Option<SyncError> {
        self.state.lock().task_err.clone()
    }

    pub(crate) fn set_comm_normal(&self, normal: bool) {
        self.state.lock().comm_normal = normal;
    }

    pub(crate) fn is_comm_normal(&self) -> bool {
        self.state.lock().comm_normal
    }

    pub(crate) fn exec_status(&self) -> TaskExecStatus {
        self.state.lock().exec_status
    }

    pub(crate) fn set_exec_status(&self, status: TaskExecStatus) {
        self.state.lock().exec_status = status;
    }

    /// Marks the queues dry unless a target arrived meanwhile. Returns true
    /// if the loop is now finished.
    pub(crate) fn finish_if_queues_empty(&self) -> bool {
        let mut state = self.state.lock();
        if state.request_targets.is_empty() && state.response_targets.is_empty() {
            state.exec_status = TaskExecStatus::Finished;
            return true;
        }
        false
    }

    pub(crate) fn time_offset(&self) -> i64 {
        self.state.lock().time_offset
    }

    pub(crate) fn set_time_offset(&self, offset: i64) {
        self.state.lock().time_offset = offset;
    }

    pub(crate) fn kill(&self) {
        self.killed.store(true, Ordering::SeqCst);
        self.stop_timer();
    }

    pub(crate) fn is_killed(&self) -> bool {
        self.killed.load(Ordering::SeqCst)
    }

    /// Arms the task timer. `on_timeout` receives the timer generation.
    pub(crate) fn start_timer(
        &self,
        timeout: Duration,
        on_timeout: impl FnOnce(u64) + Send + 'static,
    ) -> SyncResult<()> {
        let generation = self.timer.generation.fetch_add(1, Ordering::SeqCst) + 1;
        *self.timer.timeout.lock() = timeout;
        let id = self
            .scheduler
            .at(Instant::now() + timeout, move || on_timeout(generation));
        let old = self.timer.id.swap(id, Ordering::SeqCst);
        self.scheduler.remove(old);
        if id == INVALID_TASK_ID {
            return Err(SyncError::SchedulerFull);
        }
        Ok(())
    }

    /// Moves the pending timer to now + its timeout.
    pub(crate) fn reset_timer(&self) {
        let id = self.timer.id.load(Ordering::SeqCst);
        if id != INVALID_TASK_ID {
            let timeout = *self.timer.timeout.lock();
            self.scheduler.reset(id, timeout);
        }
    }

    pub(crate) fn stop_timer(&self) {
        self.timer.generation.fetch_add(1, Ordering::SeqCst);
        let id: TaskId = self.timer.id.swap(INVALID_TASK_ID, Ordering::SeqCst);
        self.scheduler.remove(id);
    }

    /// Returns true if `generation` belongs to the armed timer.
    pub(crate) fn is_current_timer(&self, generation: u64) -> bool {
        self.timer.generation.load(Ordering::SeqCst) == generation
            && self.timer.id.load(Ordering::SeqCst) != INVALID_TASK_ID
    }
}
