use super::watchdog::FeedDirection;
use super::{
    MachineCore, Progress, SyncStateMachine, SINGLE_VER_SYNC_PROCTOL_V2, SINGLE_VER_SYNC_PROCTOL_V3,
};
use crate::ability_sync;
use crate::data_sync::control_cmd_start;
use crate::error::{SyncError, SyncResult};
use crate::operation::OperationStatus;
use crate::state_machine::{Event, State};
use crate::target::TaskKind;
use crate::time_helper::mask_device;
use meshsync_protocol::{SyncMode, SOFTWARE_VERSION_EARLIEST};
use tracing::{info, warn};

impl SyncStateMachine {
    pub(super) fn run_handler(&self, core: &mut MachineCore) -> Event {
        match core.state {
            State::Idle => Event::WaitAck,
            State::TimeSync => self.do_time_sync(core),
            State::AbilitySync => self.do_ability_sync(core),
            State::StartInitiactiveDataSync => self.do_initiactive_data_sync_with_sliding_window(core),
            State::StartPassiveDataSync => self.do_passive_data_sync_with_sliding_window(core),
            State::WaitForReceiveDataFinish => self.do_wait_for_data_recv(),
            State::SyncControlCmd => self.do_initiactive_control_sync(),
            State::SyncTaskFinished => self.do_sync_task_finished(core),
            State::SyncTimeOut => self.do_timeout(core),
            State::InnerErr => self.do_inner_err(core),
        }
    }

    fn do_time_sync(&self, core: &mut MachineCore) -> Event {
        if !core.time_sync.is_need_sync() {
            return Event::TimeSyncFinished;
        }
        let session_id = self.context.request_session_id();
        match core.time_sync.sync_start(&self.sender, session_id) {
            Ok(()) => Event::WaitAck,
            Err(e) => self.error_event(e),
        }
    }

    fn do_ability_sync(&self, core: &mut MachineCore) -> Event {
        if self.sender.remote_version() == 0 {
            info!(device = %mask_device(self.context.device()),
                "[StateMachine] legacy communicator, ability sync skipped");
            self.context.set_remote_software_version(SOFTWARE_VERSION_EARLIEST);
            self.context.set_ability_finished(true);
            core.version = SINGLE_VER_SYNC_PROCTOL_V2;
            return self.event_after_ability(core);
        }
        if self.context.is_ability_finished() {
            return self.event_after_ability(core);
        }
        let session_id = self.context.request_session_id();
        match ability_sync::sync_start(&self.context, &self.sender, session_id) {
            Ok(()) => Event::WaitAck,
            Err(e) => self.error_event(e),
        }
    }

    /// The event that leaves ability sync for the live task.
    pub(super) fn event_after_ability(&self, core: &MachineCore) -> Event {
        if !self.context.mode().is_control() {
            return Event::AbilitySyncFinished;
        }
        if core.version < SINGLE_VER_SYNC_PROCTOL_V3 {
            warn!(device = %mask_device(self.context.device()), version = core.version,
                "[StateMachine] peer does not support control commands");
            self.context.set_task_err(SyncError::NotSupport);
            return Event::InnerErr;
        }
        Event::ControlCmd
    }

    fn do_initiactive_data_sync_with_sliding_window(&self, core: &mut MachineCore) -> Event {
        let mode = self.context.mode();
        let result = match mode.transfer() {
            SyncMode::Push => {
                self.context.set_operation_status(OperationStatus::RecvFinished);
                self.data_sync_start(core, mode)
            }
            SyncMode::Pull => {
                self.context.set_operation_status(OperationStatus::SendFinished);
                self.data_sync_start(core, mode)
            }
            SyncMode::PushAndPull => self.data_sync_start(core, mode),
            SyncMode::ResponsePull => return Event::SendFinished,
            _ => Err(SyncError::NotSupport),
        };
        match result {
            Ok(progress) => self.transform_to_event(&Ok(progress)),
            Err(SyncError::KeyRevoked) if mode.transfer() == SyncMode::PushAndPull => {
                // Nothing readable to push; still receive the peer's side.
                self.context.set_task_err(SyncError::KeyRevoked);
                self.context.set_operation_status(OperationStatus::SendFinished);
                Event::WaitAck
            }
            Err(e) => self.error_event(e),
        }
    }

    fn do_passive_data_sync_with_sliding_window(&self, core: &mut MachineCore) -> Event {
        if self.context.response_session_id() == 0 && self.context.response_queue_len() > 0 {
            match self.context.pop_response_target() {
                Ok(target) => self.context.set_response_target(&target),
                Err(e) => return self.error_event(e),
            }
        }
        if self.context.response_session_id() == 0 {
            return Event::ResponseTaskFinished;
        }
        match self.data_sync_start(core, SyncMode::ResponsePull) {
            Ok(progress) => self.transform_to_event(&Ok(progress)),
            Err(e) => {
                warn!(device = %mask_device(self.context.device()), error = %e,
                    session_id = self.context.response_session_id(),
                    "[StateMachine] pull response failed");
                if let Err(send_err) = core.data_sync.send_pull_response_error(&self.context, &self.sender, &e) {
                    warn!(error = %send_err, "[StateMachine] reporting pull response error failed");
                }
                self.context.set_response_session_id(0);
                Event::ResponseTaskFinished
            }
        }
    }

    fn do_wait_for_data_recv(&self) -> Event {
        if self.context.response_queue_len() > 0 {
            return Event::StartPullResponse;
        }
        if self.context.task_kind() == Some(TaskKind::Response) {
            return Event::RecvFinished;
        }
        match self.context.operation_status() {
            None => Event::RecvFinished,
            Some(status) if status.is_terminal() => Event::RecvFinished,
            Some(_) => Event::WaitAck,
        }
    }

    fn do_initiactive_control_sync(&self) -> Event {
        let result = control_cmd_start(&self.context, &self.sender, &self.shared.subscribes);
        match result {
            Ok(progress) => self.transform_to_event(&Ok(progress)),
            Err(e) => self.error_event(e),
        }
    }

    fn do_sync_task_finished(&self, core: &mut MachineCore) -> Event {
        self.stop_watchdog();
        self.abort_inner(core);
        if self
            .context
            .operation_status()
            .is_some_and(|status| !status.is_terminal())
        {
            let status = self
                .context
                .task_err()
                .map_or(OperationStatus::Failed, |e| operation_status_for(&e));
            self.context.set_operation_status(status);
        }
        info!(device = %mask_device(self.context.device()),
            session_id = self.context.request_session_id(), "[StateMachine] task finished");
        self.context.clear();
        if self.exec_next_task(core) {
            Event::StartSync
        } else {
            self.transform_to_event(&Ok(Progress::NoSyncTask))
        }
    }

    fn do_timeout(&self, core: &mut MachineCore) -> Event {
        self.context.set_operation_status(OperationStatus::Timeout);
        self.abort_inner(core);
        Event::Any
    }

    fn do_inner_err(&self, core: &mut MachineCore) -> Event {
        let status = if self.context.is_comm_normal() {
            self.context
                .task_err()
                .map_or(OperationStatus::Failed, |e| operation_status_for(&e))
        } else {
            OperationStatus::CommAbnormal
        };
        warn!(device = %mask_device(self.context.device()), ?status,
            error = ?self.context.task_err(), "[StateMachine] task failed");
        self.context.set_operation_status(status);
        self.abort_inner(core);
        Event::Any
    }

    /// Starts or resumes data sync and feeds the send watchdog when the
    /// packets in flight exceed the MTU.
    fn data_sync_start(&self, core: &mut MachineCore, mode: SyncMode) -> SyncResult<Progress> {
        let progress = core.data_sync.sync_start(mode, &self.context, &self.sender)?;
        let mtu = self.sender.mtu();
        let bytes = core.data_sync.largest_unacked_bytes();
        if mtu > 0 && bytes > mtu {
            let factor = u32::try_from(bytes / mtu).unwrap_or(u32::MAX);
            let time = self.context.sync_timeout().saturating_mul(factor);
            self.start_feed_dog(FeedDirection::Send, time);
        }
        Ok(progress)
    }

    /// Records `err` as the task error and maps it to an event.
    pub(super) fn error_event(&self, err: SyncError) -> Event {
        let event = self.transform_to_event(&Err(err.clone()));
        self.context.set_task_err(err);
        event
    }

    /// Maps a step outcome to the event that drives the state table.
    pub(super) fn transform_to_event(&self, result: &SyncResult<Progress>) -> Event {
        match result {
            Ok(Progress::Waiting | Progress::KeepAlive) => Event::WaitAck,
            Ok(Progress::SendData) => Event::SendData,
            Ok(Progress::NoDataSend | Progress::Finished) => Event::SendFinished,
            Ok(Progress::RecvFinished) => Event::RecvFinished,
            Ok(Progress::ReSendData) => Event::ReSendData,
            Ok(Progress::NeedPullResponse) => Event::StartPullResponse,
            Ok(Progress::NoSyncTask) => Event::AllTaskFinished,
            Err(SyncError::Timeout) => {
                if self.context.is_sync_task_need_retry()
                    && self.context.retry_time() < self.context.sync_retry_times()
                {
                    Event::WaitTimeOut
                } else {
                    Event::TimeOut
                }
            }
            Err(SyncError::VersionNotSupport) => Event::VersionNotSupported,
            Err(SyncError::NeedAbilitySync) => Event::NeedAbilitySync,
            Err(_) => Event::InnerErr,
        }
    }
}

/// Status reported to the operation caller for a task error.
pub(crate) fn operation_status_for(err: &SyncError) -> OperationStatus {
    match err {
        SyncError::SchemaMismatch => OperationStatus::SchemaIncompatible,
        SyncError::KeyRevoked => OperationStatus::EkeyrevokedFailure,
        SyncError::SecurityOptionCheck => OperationStatus::SecurityOptionCheckFailure,
        SyncError::Busy => OperationStatus::BusyFailure,
        SyncError::NotPermit => OperationStatus::PermissionCheckFailed,
        SyncError::Timeout => OperationStatus::Timeout,
        SyncError::InvalidQueryFormat => OperationStatus::QueryFormatFailure,
        SyncError::InvalidQueryField => OperationStatus::QueryFieldFailure,
        SyncError::NotSupport | SyncError::UnknownMessage => OperationStatus::NotSupport,
        SyncError::CommunicatorNotFound
        | SyncError::CommAbnormal
        | SyncError::PeripheralInterfaceFail => OperationStatus::CommAbnormal,
        SyncError::InterceptDataFail => OperationStatus::InterceptDataFail,
        SyncError::MaxLimits | SyncError::RemoteOverSize => OperationStatus::MaxLimits,
        SyncError::DeniedSql => OperationStatus::DeniedSql,
        SyncError::UserChanged => OperationStatus::UserChanged,
        SyncError::InvalidArgs { .. } => OperationStatus::InvalidArgs,
        _ => OperationStatus::Failed,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SyncConfig;
    use crate::state_machine::tests::machine_with;

    #[test]
    fn errors_map_to_operation_statuses() {
        assert_eq!(operation_status_for(&SyncError::SchemaMismatch), OperationStatus::SchemaIncompatible);
        assert_eq!(operation_status_for(&SyncError::RemoteOverSize), OperationStatus::MaxLimits);
        assert_eq!(operation_status_for(&SyncError::UnknownMessage), OperationStatus::NotSupport);
        assert_eq!(operation_status_for(&SyncError::CommunicatorNotFound), OperationStatus::CommAbnormal);
        assert_eq!(operation_status_for(&SyncError::storage("disk")), OperationStatus::Failed);
    }

    #[test]
    fn progress_maps_to_events() {
        let (machine, _comm) = machine_with(SyncConfig::new("dev-a"));
        assert_eq!(machine.transform_to_event(&Ok(Progress::Waiting)), Event::WaitAck);
        assert_eq!(machine.transform_to_event(&Ok(Progress::NoDataSend)), Event::SendFinished);
        assert_eq!(machine.transform_to_event(&Ok(Progress::NeedPullResponse)), Event::StartPullResponse);
        assert_eq!(machine.transform_to_event(&Ok(Progress::NoSyncTask)), Event::AllTaskFinished);
        assert_eq!(machine.transform_to_event(&Err(SyncError::VersionNotSupport)), Event::VersionNotSupported);
        assert_eq!(machine.transform_to_event(&Err(SyncError::SchemaMismatch)), Event::InnerErr);
    }

    #[test]
    fn timeout_maps_by_retry_budget() {
        let (machine, _comm) = machine_with(SyncConfig::new("dev-a").with_retry_times(1, 1));
        assert_eq!(machine.transform_to_event(&Err(SyncError::Timeout)), Event::WaitTimeOut);
        machine.context().set_retry_time(1);
        assert_eq!(machine.transform_to_event(&Err(SyncError::Timeout)), Event::TimeOut);
    }
}
