//! Per-device sync state machine.
//!
//! One [`SyncStateMachine`] drives the tasks queued on one peer's context
//! through time sync, ability sync, data exchange and finalization. Every
//! entry point (task start, inbound message, watchdog timeout, abort) takes
//! the machine lock and then steps the machine until it has to wait for the
//! peer. Lock order is machine, then context.

mod message;
mod single_ver;
mod table;
mod watchdog;

pub use table::{Event, State, StateSwitchTable, Switch};
pub(crate) use table::{SINGLE_VER_SYNC_PROCTOL_V2, SINGLE_VER_SYNC_PROCTOL_V3};

use crate::communicator::MessageSender;
use crate::context::{RetryStatus, SyncTaskContext};
use crate::data_sync::{DataMessageSchedule, DataSync};
use crate::engine::EngineShared;
use crate::error::{SyncError, SyncResult};
use crate::operation::OperationStatus;
use crate::scheduler::INVALID_TASK_ID;
use crate::time_helper::mask_device;
use crate::time_sync::TimeSync;
use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::{debug, info, warn};
use watchdog::{FeedDirection, FeedDogs, SaveDataNotify};

/// Non-error outcome of a sync step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Progress {
    /// Sent what was possible; wait for the peer.
    Waiting,
    /// Window has room and data remains.
    SendData,
    /// Everything was sent.
    NoDataSend,
    /// The peer's data for our request arrived completely.
    RecvFinished,
    /// Restart sending from the saved watermark.
    ReSendData,
    /// A pull response is queued.
    NeedPullResponse,
    /// The step completed.
    Finished,
    /// Neither queue holds a task.
    NoSyncTask,
    /// The peer is still saving data.
    KeepAlive,
}

pub(crate) struct MachineCore {
    state: State,
    version: u32,
    time_sync: TimeSync,
    data_sync: DataSync,
    schedule: DataMessageSchedule,
    current_remote_version_id: u64,
}

/// Drives one peer's sync tasks.
pub(crate) struct SyncStateMachine {
    context: Arc<SyncTaskContext>,
    shared: Arc<EngineShared>,
    sender: MessageSender,
    feed_dogs: FeedDogs,
    save_data_notify: SaveDataNotify,
    core: Mutex<MachineCore>,
    self_ref: Weak<SyncStateMachine>,
}

impl SyncStateMachine {
    pub(crate) fn new(device: &str, shared: Arc<EngineShared>) -> Arc<Self> {
        let context = Arc::new(SyncTaskContext::new(
            device,
            Arc::clone(&shared.config),
            Arc::clone(&shared.storage),
            Arc::clone(&shared.metadata),
            Arc::clone(&shared.scheduler),
        ));
        let timeout = shared.communicator.timeout(device);
        Arc::new_cyclic(|weak: &Weak<SyncStateMachine>| {
            let hook_target = weak.clone();
            let scheduler = Arc::downgrade(&shared.scheduler);
            let sender = MessageSender::new(Arc::clone(&shared.communicator), device, timeout)
                .with_failure_hook(move |session_id| {
                    let Some(scheduler) = scheduler.upgrade() else {
                        return;
                    };
                    let machine = hook_target.clone();
                    scheduler.execute(move || {
                        if let Some(machine) = machine.upgrade() {
                            machine.comm_err_abort(session_id);
                        }
                    });
                });
            let core = MachineCore {
                state: State::Idle,
                version: SINGLE_VER_SYNC_PROCTOL_V3,
                time_sync: TimeSync::new(device, &shared.metadata),
                data_sync: DataSync::new(device),
                schedule: DataMessageSchedule::new(),
                current_remote_version_id: 0,
            };
            Self {
                context,
                shared,
                sender,
                feed_dogs: FeedDogs::new(),
                save_data_notify: SaveDataNotify::new(),
                core: Mutex::new(core),
                self_ref: weak.clone(),
            }
        })
    }

    pub(crate) fn context(&self) -> &Arc<SyncTaskContext> {
        &self.context
    }

    pub(crate) fn state(&self) -> State {
        self.core.lock().state
    }

    /// Starts the next queued task if the machine is idle.
    pub(crate) fn start_sync(&self) {
        let mut core = self.core.lock();
        if self.context.is_killed() {
            return;
        }
        if core.state != State::Idle {
            debug!(device = %mask_device(self.context.device()), state = ?core.state,
                "[StateMachine] already running, start ignored");
            return;
        }
        if self.exec_next_task(&mut core) {
            self.switch_state_and_step(&mut core, Event::StartSync);
        }
    }

    /// Schedules an abort of the live task with `status`.
    pub(crate) fn abort(&self, status: OperationStatus) {
        let weak = self.self_ref.clone();
        let id = self.shared.scheduler.execute(move || {
            if let Some(machine) = weak.upgrade() {
                machine.abort_immediately(status);
            }
        });
        if id == INVALID_TASK_ID {
            self.abort_immediately(status);
        }
    }

    /// Stops the live task, reports `status` for it and goes on with the
    /// next queued one.
    pub(crate) fn abort_immediately(&self, status: OperationStatus) {
        let mut core = self.core.lock();
        info!(device = %mask_device(self.context.device()), state = ?core.state, ?status,
            "[StateMachine] abort");
        if self.context.has_current_target() {
            self.context.set_operation_status(status);
        }
        self.abort_inner(&mut core);
        self.context.stop_timer();
        self.context.clear();
        core.state = State::Idle;
        if self.context.is_killed() {
            return;
        }
        if self.exec_next_task(&mut core) {
            self.switch_state_and_step(&mut core, Event::StartSync);
        }
    }

    /// Aborts the live task after a failed send on `session_id`. Sends of
    /// other sessions are ignored; 0 means the whole link failed.
    pub(crate) fn comm_err_abort(&self, session_id: u32) {
        let mut core = self.core.lock();
        let request_session = self.context.request_session_id();
        if session_id != 0 && (request_session == 0 || session_id != request_session) {
            return;
        }
        warn!(device = %mask_device(self.context.device()), session_id, state = ?core.state,
            "[StateMachine] communication error abort");
        self.context.set_comm_normal(false);
        self.context.set_task_err(SyncError::CommAbnormal);
        self.switch_state_and_step(&mut core, Event::InnerErr);
    }

    /// Aborts the live task after an internal failure on `session_id`.
    pub(crate) fn inner_error_abort(&self, session_id: u32) {
        let mut core = self.core.lock();
        let request_session = self.context.request_session_id();
        if session_id != 0 && (request_session == 0 || session_id != request_session) {
            return;
        }
        if self.context.task_err().is_none() {
            self.context.set_task_err(SyncError::internal("inner error abort"));
        }
        self.switch_state_and_step(&mut core, Event::InnerErr);
    }

    /// Kills the context and drains every task.
    pub(crate) fn kill(&self) {
        let mut core = self.core.lock();
        self.context.kill();
        self.abort_inner(&mut core);
        self.context.clear_all_sync_task();
        self.context.clear();
        core.state = State::Idle;
    }

    /// Drops the peer's negotiated state so the next task renegotiates.
    pub(crate) fn reset_peer_state(&self) {
        let mut core = self.core.lock();
        core.time_sync.reset();
        core.schedule.clear();
        self.context.set_ability_finished(false);
        self.context.set_remote_software_version(0);
    }

    fn switch_state_and_step(&self, core: &mut MachineCore, event: Event) {
        if self.switch_state(core, event).is_ok() {
            self.sync_step_inner(core);
        }
    }

    fn sync_step_inner(&self, core: &mut MachineCore) {
        loop {
            if self.context.is_killed() {
                return;
            }
            let event = self.run_handler(core);
            if event == Event::WaitAck {
                return;
            }
            if self.switch_state(core, event).is_err() || core.state == State::Idle {
                return;
            }
        }
    }

    fn switch_state(&self, core: &mut MachineCore, event: Event) -> SyncResult<()> {
        let table = StateSwitchTable::for_version(core.version);
        match table.lookup(core.state, event) {
            Switch::Next(next) => {
                debug!(device = %mask_device(self.context.device()), from = ?core.state,
                    ?event, to = ?next, "[StateMachine] switch");
                core.state = next;
                Ok(())
            }
            Switch::UnknownState => {
                warn!(device = %mask_device(self.context.device()), state = ?core.state,
                    version = table.version(), "[StateMachine] state missing from table");
                core.state = State::InnerErr;
                Ok(())
            }
            Switch::Rejected => {
                debug!(device = %mask_device(self.context.device()), state = ?core.state,
                    ?event, "[StateMachine] event ignored");
                Err(SyncError::NotFound)
            }
        }
    }

    fn timeout_callback(&self, generation: u64) {
        let mut core = self.core.lock();
        if self.context.is_killed() || !self.context.is_current_timer(generation) {
            return;
        }
        let retry = self.context.retry_time();
        if retry >= self.context.sync_retry_times() || !self.context.is_sync_task_need_retry() {
            warn!(device = %mask_device(self.context.device()), state = ?core.state, retry,
                "[StateMachine] sync timed out");
            self.context.set_task_err(SyncError::Timeout);
            self.switch_state_and_step(&mut core, Event::TimeOut);
            return;
        }
        let retry = self.context.inc_retry_time();
        self.context.set_retry_status(RetryStatus::NeedRetry);
        info!(device = %mask_device(self.context.device()), state = ?core.state, retry,
            "[StateMachine] retrying after timeout");
        if let Err(e) = self.start_watchdog_with(self.context.sync_retry_timeout(retry)) {
            warn!(error = %e, "[StateMachine] re-arming watchdog failed");
        }
        self.sync_step_inner(&mut core);
    }

    fn start_watchdog(&self) -> SyncResult<()> {
        self.start_watchdog_with(self.context.sync_timeout())
    }

    fn start_watchdog_with(&self, timeout: Duration) -> SyncResult<()> {
        let weak = self.self_ref.clone();
        self.context.start_timer(timeout, move |generation| {
            if let Some(machine) = weak.upgrade() {
                machine.timeout_callback(generation);
            }
        })
    }

    /// Pushes the watchdog out and forgets earlier retries.
    fn reset_watchdog(&self) {
        self.context.reset_timer();
        self.context.set_retry_time(0);
    }

    fn stop_watchdog(&self) {
        self.context.stop_timer();
    }

    /// Installs the next runnable task. Returns false when none is left.
    fn exec_next_task(&self, core: &mut MachineCore) -> bool {
        loop {
            if self.context.is_killed() {
                return false;
            }
            if !self.context.move_to_next_target() {
                if self.context.finish_if_queues_empty() {
                    debug!(device = %mask_device(self.context.device()),
                        "[StateMachine] no sync task left");
                    return false;
                }
                continue;
            }
            if !self.context.check_permission() {
                warn!(device = %mask_device(self.context.device()), mode = ?self.context.mode(),
                    "[StateMachine] permission check failed");
                self.context.set_task_err(SyncError::NotPermit);
                self.context.abort(OperationStatus::PermissionCheckFailed);
                continue;
            }
            match self.context.is_current_sync_task_can_be_skipped() {
                Ok(true) => {
                    info!(device = %mask_device(self.context.device()), mode = ?self.context.mode(),
                        "[StateMachine] nothing new to send, task skipped");
                    self.context.set_operation_status(OperationStatus::FinishedAll);
                    self.context.clear();
                    continue;
                }
                Ok(false) => {}
                Err(e) => warn!(error = %e, "[StateMachine] skip check failed"),
            }
            self.context.set_sync_timeout(self.sender.timeout());
            self.context.set_time_offset(core.time_sync.time_offset());
            let session_id = self.context.generate_request_session_id();
            self.context.set_retry_time(0);
            if let Err(e) = self.start_watchdog() {
                warn!(error = %e, "[StateMachine] arming watchdog failed");
                self.context.set_task_err(e);
                self.context.abort(OperationStatus::Failed);
                continue;
            }
            info!(device = %mask_device(self.context.device()), session_id,
                mode = ?self.context.mode(), "[StateMachine] task started");
            return true;
        }
    }

    /// Stops the keep-alive timers and drops the send in progress.
    fn abort_inner(&self, core: &mut MachineCore) {
        self.save_data_notify.stop();
        self.feed_dogs.stop_all();
        core.data_sync.clear_sync_status(&self.context);
    }

    fn start_feed_dog(&self, direction: FeedDirection, time: Duration) {
        self.feed_dogs.start(
            direction,
            time,
            self.shared.config.data_notify_interval,
            &self.context,
            &self.shared.scheduler,
        );
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::config::SyncConfig;
    use crate::engine::EngineShared;
    use crate::metadata::Metadata;
    use crate::operation::{SyncOperation, SyncRequest};
    use crate::scheduler::TaskScheduler;
    use crate::subscribe::SubscribeManager;
    use crate::test_support::{FakeStorage, RecordingCommunicator};
    use meshsync_protocol::{MessageId, SyncMode};

    pub(crate) fn machine_with(config: SyncConfig) -> (Arc<SyncStateMachine>, Arc<RecordingCommunicator>) {
        let storage = Arc::new(FakeStorage::default());
        let communicator = Arc::new(RecordingCommunicator::new(&config.local_device));
        let shared = Arc::new(EngineShared {
            config: Arc::new(config),
            storage: storage.clone(),
            communicator: communicator.clone(),
            scheduler: Arc::new(TaskScheduler::new(64).unwrap()),
            metadata: Arc::new(Metadata::new(storage)),
            subscribes: Arc::new(SubscribeManager::new()),
        });
        (SyncStateMachine::new("dev-b", shared), communicator)
    }

    fn push_task(machine: &SyncStateMachine) -> crate::operation::SyncHandle {
        let (op, handle) = SyncOperation::new(1, SyncRequest::new(vec!["dev-b".into()], SyncMode::Push));
        assert!(machine.context().add_sync_operation(&op, u64::MAX));
        handle
    }

    #[test]
    fn start_sync_sends_time_sync_request() {
        let (machine, comm) = machine_with(SyncConfig::new("dev-a"));
        let _handle = push_task(&machine);
        machine.start_sync();
        assert_eq!(machine.state(), State::TimeSync);
        let sent = comm.take_sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].1.id(), Some(MessageId::TimeSync));
        assert_eq!(sent[0].1.session_id, machine.context().request_session_id());
    }

    #[test]
    fn comm_error_on_other_session_is_ignored() {
        let (machine, _comm) = machine_with(SyncConfig::new("dev-a"));
        let _handle = push_task(&machine);
        machine.start_sync();
        let session = machine.context().request_session_id();
        machine.comm_err_abort(session.wrapping_add(1).max(1));
        assert_eq!(machine.state(), State::TimeSync);
    }

    #[test]
    fn comm_error_aborts_with_comm_abnormal() {
        let (machine, _comm) = machine_with(SyncConfig::new("dev-a"));
        let handle = push_task(&machine);
        machine.start_sync();
        machine.comm_err_abort(machine.context().request_session_id());
        let report = handle.wait(Duration::from_secs(1)).unwrap();
        assert_eq!(report["dev-b"], OperationStatus::CommAbnormal);
        assert_eq!(machine.state(), State::Idle);
    }

    #[test]
    fn watchdog_timeout_without_retry_budget_fails_the_task() {
        let config = SyncConfig::new("dev-a").with_retry_times(0, 0);
        let (machine, _comm) = machine_with(config);
        let handle = push_task(&machine);
        machine.start_sync();
        machine.context().stop_timer();
        machine.start_watchdog_with(Duration::from_millis(20)).unwrap();
        let report = handle.wait(Duration::from_secs(2)).unwrap();
        assert_eq!(report["dev-b"], OperationStatus::Timeout);
    }

    #[test]
    fn abort_reports_status_and_returns_to_idle() {
        let (machine, _comm) = machine_with(SyncConfig::new("dev-a"));
        let handle = push_task(&machine);
        machine.start_sync();
        machine.abort_immediately(OperationStatus::UserChanged);
        let report = handle.wait(Duration::from_secs(1)).unwrap();
        assert_eq!(report["dev-b"], OperationStatus::UserChanged);
        assert_eq!(machine.state(), State::Idle);
    }

    #[test]
    fn killed_machine_does_not_start() {
        let (machine, comm) = machine_with(SyncConfig::new("dev-a"));
        let handle = push_task(&machine);
        machine.kill();
        machine.start_sync();
        assert!(comm.take_sent().is_empty());
        let report = handle.wait(Duration::from_secs(1)).unwrap();
        assert_eq!(report["dev-b"], OperationStatus::CommAbnormal);
    }
}
