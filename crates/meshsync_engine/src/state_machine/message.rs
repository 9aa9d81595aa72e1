use super::watchdog::FeedDirection;
use super::{MachineCore, Progress, SyncStateMachine, SINGLE_VER_SYNC_PROCTOL_V2, SINGLE_VER_SYNC_PROCTOL_V3};
use crate::ability_sync;
use crate::data_sync::{control_cmd_ack_recv, control_cmd_request_recv, send_finished_ack, Scheduled};
use crate::error::{SyncError, SyncResult};
use crate::operation::OperationStatus;
use crate::scheduler::INVALID_TASK_ID;
use crate::state_machine::{Event, State};
use crate::target::SyncTarget;
use crate::time_helper::mask_device;
use crate::time_sync::TimeSync;
use meshsync_protocol::{AckCode, DataAckPacket, Message, MessageId, MessageType, Payload, SyncMode};
use std::time::Duration;
use tracing::{debug, info, warn};

impl SyncStateMachine {
    /// Handles one inbound message from the peer. `received_at` is the tick
    /// count taken when the message reached the engine.
    pub(crate) fn receive_message(&self, message: Message, received_at: u64) -> SyncResult<()> {
        let mut core = self.core.lock();
        if self.context.is_killed() {
            return Err(SyncError::Busy);
        }
        if !self.is_packet_valid(&message) {
            debug!(device = %mask_device(self.context.device()), session_id = message.session_id,
                id = ?message.id(), "[StateMachine] message for an inactive session dropped");
            return Err(SyncError::StaleSession {
                session_id: message.session_id,
            });
        }
        let Some(id) = message.id() else {
            return Err(SyncError::UnknownMessage);
        };
        match (id, message.message_type) {
            (MessageId::TimeSync, MessageType::Request) => {
                TimeSync::request_recv(&self.sender, &message, received_at)
            }
            (MessageId::TimeSync, MessageType::Response) => {
                self.time_ack_recv(&mut core, &message, received_at)
            }
            (MessageId::AbilitySync, MessageType::Request) => {
                ability_sync::request_recv(&self.context, &self.sender, &message)
            }
            (MessageId::AbilitySync, MessageType::Response) => self.ability_ack_recv(&mut core, &message),
            (MessageId::AbilitySync, MessageType::Notify) => self.ability_notify_recv(&mut core, &message),
            (MessageId::DataSync | MessageId::QuerySync, MessageType::Request) => {
                self.data_packet_recv(&mut core, message)
            }
            (MessageId::DataSync | MessageId::QuerySync, MessageType::Response) => {
                self.handle_data_ack_recv(&mut core, &message)
            }
            (MessageId::ControlSync, MessageType::Request) => control_cmd_request_recv(
                &self.context,
                &self.sender,
                &message,
                &self.shared.subscribes,
            ),
            (MessageId::ControlSync, MessageType::Response) => self.control_ack_recv(&mut core, &message),
            _ => Err(SyncError::NotSupport),
        }
    }

    /// Responses must belong to one of our live sessions. Pull-response data
    /// packets must answer our own request. Time sync responses are matched
    /// against the time sync session later.
    fn is_packet_valid(&self, message: &Message) -> bool {
        let request = self.context.request_session_id();
        let response = self.context.response_session_id();
        match message.message_type {
            MessageType::Response if message.id() == Some(MessageId::TimeSync) => true,
            MessageType::Response => {
                message.session_id != 0
                    && (message.session_id == request || message.session_id == response)
            }
            MessageType::Request if message.is_data_message() => match message.as_data_request() {
                Ok(packet) if packet.mode == SyncMode::ResponsePull => {
                    request != 0 && message.session_id == request
                }
                _ => true,
            },
            _ => true,
        }
    }

    fn is_need_reset_watchdog(&self, message: &Message) -> bool {
        message.session_id != 0
            && (message.session_id == self.context.request_session_id()
                || message.session_id == self.context.response_session_id())
    }

    fn time_ack_recv(&self, core: &mut MachineCore, message: &Message, received_at: u64) -> SyncResult<()> {
        if core.state != State::TimeSync {
            return Ok(());
        }
        match core.time_sync.ack_recv(message, received_at, self.context.metadata()) {
            Ok(offset) => {
                self.context.set_time_offset(offset);
                self.reset_watchdog();
                self.switch_state_and_step(core, Event::TimeSyncFinished);
                Ok(())
            }
            Err(SyncError::StaleSession { session_id }) => {
                debug!(session_id, "[StateMachine] stale time sync response ignored");
                Ok(())
            }
            Err(e) => {
                let event = self.error_event(e.clone());
                self.switch_state_and_step(core, event);
                Err(e)
            }
        }
    }

    fn ability_ack_recv(&self, core: &mut MachineCore, message: &Message) -> SyncResult<()> {
        if core.state != State::AbilitySync || message.session_id != self.context.request_session_id() {
            return Ok(());
        }
        let protocol_version = message.as_ability_ack()?.protocol_version;
        match ability_sync::ack_recv(&self.context, &self.sender, message) {
            Ok(progress) => {
                core.version = if protocol_version >= SINGLE_VER_SYNC_PROCTOL_V3 {
                    SINGLE_VER_SYNC_PROCTOL_V3
                } else {
                    SINGLE_VER_SYNC_PROCTOL_V2
                };
                self.reset_watchdog();
                if progress == Progress::Finished {
                    let event = self.event_after_ability(core);
                    self.switch_state_and_step(core, event);
                }
                Ok(())
            }
            Err(e) => {
                let event = self.error_event(e.clone());
                self.switch_state_and_step(core, event);
                Err(e)
            }
        }
    }

    fn ability_notify_recv(&self, core: &mut MachineCore, message: &Message) -> SyncResult<()> {
        let ours = core.state == State::AbilitySync
            && message.session_id != 0
            && message.session_id == self.context.request_session_id();
        match ability_sync::ack_notify_recv(&self.context, &self.sender, message) {
            Ok(Progress::Finished) if ours => {
                self.reset_watchdog();
                let event = self.event_after_ability(core);
                self.switch_state_and_step(core, event);
                Ok(())
            }
            Ok(_) => Ok(()),
            Err(e) if ours => {
                let event = self.error_event(e.clone());
                self.switch_state_and_step(core, event);
                Err(e)
            }
            Err(e) => {
                warn!(device = %mask_device(self.context.device()), error = %e,
                    "[StateMachine] peer rejected our ability response");
                Err(e)
            }
        }
    }

    fn data_packet_recv(&self, core: &mut MachineCore, message: Message) -> SyncResult<()> {
        match core.schedule.accept(message) {
            Scheduled::Ready(messages) => {
                let mut result = Ok(());
                for message in messages {
                    if let Err(e) = self.handle_data_request_recv(core, &message) {
                        result = Err(e);
                    }
                }
                result
            }
            Scheduled::Duplicate(message) => {
                debug!(device = %mask_device(self.context.device()), session_id = message.session_id,
                    sequence = message.sequence_id, "[StateMachine] duplicate data packet acked");
                send_finished_ack(&self.sender, &message)
            }
            Scheduled::Pending => Ok(()),
        }
    }

    fn handle_data_request_recv(&self, core: &mut MachineCore, message: &Message) -> SyncResult<()> {
        self.context.set_time_offset(core.time_sync.time_offset());
        self.feed_dogs.dec_ref(FeedDirection::Receive);
        if self.is_need_reset_watchdog(message) {
            self.reset_watchdog();
        }
        self.start_save_data_notify(message);
        let result = core.data_sync.data_request_recv(&self.context, &self.sender, message);
        self.save_data_notify.stop();
        match result {
            Ok(outcome) => {
                if outcome.pull_end != 0 {
                    self.add_pull_response_target(core, message, outcome.pull_end)?;
                }
                if outcome.progress == Progress::RecvFinished {
                    self.context.set_operation_status(OperationStatus::RecvFinished);
                    if core.state == State::WaitForReceiveDataFinish {
                        self.switch_state_and_step(core, Event::RecvFinished);
                    }
                }
                Ok(())
            }
            Err(e) => {
                self.data_recv_err_code_handle(core, message.session_id, &e);
                Err(e)
            }
        }
    }

    /// A failed packet of our own request session fails the task; packets of
    /// peer tasks only fail on the peer's side.
    fn data_recv_err_code_handle(&self, core: &mut MachineCore, session_id: u32, err: &SyncError) {
        warn!(device = %mask_device(self.context.device()), session_id, error = %err,
            "[StateMachine] data packet rejected");
        if session_id == 0 || session_id != self.context.request_session_id() {
            return;
        }
        self.context.set_task_err(err.clone());
        self.switch_state_and_step(core, Event::InnerErr);
    }

    fn add_pull_response_target(&self, core: &mut MachineCore, message: &Message, end: u64) -> SyncResult<()> {
        let packet = message.as_data_request()?;
        if self.context.response_session_id() == message.session_id
            || self.context.find_response_sync_target(message.session_id)
        {
            debug!(device = %mask_device(self.context.device()), session_id = message.session_id,
                "[StateMachine] pull response already queued");
            return Ok(());
        }
        info!(device = %mask_device(self.context.device()), session_id = message.session_id,
            end, "[StateMachine] pull response queued");
        let target = SyncTarget::response(message.session_id, end, packet.query.clone());
        if self.context.add_sync_target(target) {
            if self.exec_next_task(core) {
                self.switch_state_and_step(core, Event::StartSync);
            }
        } else if core.state == State::WaitForReceiveDataFinish {
            self.switch_state_and_step(core, Event::StartPullResponse);
        }
        Ok(())
    }

    /// Keeps the peer's watchdog alive while a packet is being saved.
    fn start_save_data_notify(&self, message: &Message) {
        let config = &self.shared.config;
        let interval = config.data_notify_interval;
        if interval.is_zero() || config.max_data_notify_count == 0 {
            return;
        }
        let Ok(packet) = message.as_data_request() else {
            return;
        };
        let mut ack = DataAckPacket::new(AckCode::SaveDataNotify);
        ack.packet_id = packet.packet_id;
        ack.data = u64::try_from(interval.saturating_mul(2).as_millis()).unwrap_or(u64::MAX);
        let notify = Message::response(
            message.id().unwrap_or(MessageId::DataSync),
            message.session_id,
            Payload::DataAck(ack),
        )
        .with_sequence(message.sequence_id);
        let weak = self.self_ref.clone();
        let session_id = message.session_id;
        self.save_data_notify.start(
            &self.shared.scheduler,
            interval,
            config.max_data_notify_count,
            move || {
                let Some(machine) = weak.upgrade() else {
                    return;
                };
                machine.context.reset_timer();
                if let Err(e) = machine.sender.send(notify.clone()) {
                    warn!(error = %e, session_id, "[StateMachine] save-data notify failed");
                    let target = weak.clone();
                    let id = machine.shared.scheduler.execute(move || {
                        if let Some(machine) = target.upgrade() {
                            machine.inner_error_abort(session_id);
                        }
                    });
                    if id == INVALID_TASK_ID {
                        warn!(session_id, "[StateMachine] scheduler rejected abort after notify failure");
                    }
                }
            },
        );
    }

    fn handle_data_ack_recv(&self, core: &mut MachineCore, message: &Message) -> SyncResult<()> {
        self.feed_dogs.dec_ref(FeedDirection::Send);
        let ack_data = message.as_data_ack()?.data;
        if self.is_need_reset_watchdog(message) {
            self.reset_watchdog();
        }
        let result = core.data_sync.ack_recv(&self.context, message);
        if let Ok(Progress::KeepAlive) = result {
            if ack_data != 0 {
                self.start_feed_dog(FeedDirection::Receive, Duration::from_millis(ack_data));
            }
            return Ok(());
        }
        self.feed_dogs.dec_ref(FeedDirection::Receive);
        match result {
            Ok(Progress::SendData | Progress::NoDataSend) => {
                let next = core.data_sync.try_continue_sync(&self.context, &self.sender, message);
                let event = match &next {
                    Ok(Progress::Waiting) => return Ok(()),
                    Err(e) => self.error_event(e.clone()),
                    ok => self.transform_to_event(ok),
                };
                self.switch_state_and_step(core, event);
                next.map(|_| ())
            }
            Ok(Progress::ReSendData) => {
                self.switch_state_and_step(core, Event::ReSendData);
                Ok(())
            }
            Ok(_) => Ok(()),
            Err(SyncError::NeedAbilitySync) => {
                info!(device = %mask_device(self.context.device()),
                    "[StateMachine] peer asked for a new ability sync");
                self.need_ability_sync_handle(core);
                self.context.set_task_err(SyncError::NeedAbilitySync);
                self.switch_state_and_step(core, Event::NeedAbilitySync);
                Err(SyncError::NeedAbilitySync)
            }
            Err(e) if self.is_response_session_only(message.session_id) => {
                // The puller gave up on our response; the live task goes on.
                warn!(device = %mask_device(self.context.device()), error = %e,
                    session_id = message.session_id, "[StateMachine] pull response rejected by peer");
                core.data_sync.clear_sync_status(&self.context);
                self.context.set_response_session_id(0);
                self.switch_state_and_step(core, Event::SendFinished);
                Err(e)
            }
            Err(e) => {
                let event = self.error_event(e.clone());
                self.switch_state_and_step(core, event);
                Err(e)
            }
        }
    }

    /// Marks ability sync unfinished. A second request within the same
    /// negotiated round also forgets the peer's software version.
    fn need_ability_sync_handle(&self, core: &mut MachineCore) {
        let version_id = self.context.remote_version_id();
        if core.current_remote_version_id == version_id {
            debug!(device = %mask_device(self.context.device()), version_id,
                "[StateMachine] repeated ability request, remote version reset");
            self.context.set_remote_software_version(0);
        } else {
            core.current_remote_version_id = version_id;
        }
        self.context.set_ability_finished(false);
        core.data_sync.clear_sync_status(&self.context);
    }

    fn is_response_session_only(&self, session_id: u32) -> bool {
        session_id != 0
            && session_id == self.context.response_session_id()
            && session_id != self.context.request_session_id()
    }

    fn control_ack_recv(&self, core: &mut MachineCore, message: &Message) -> SyncResult<()> {
        if core.state != State::SyncControlCmd || message.session_id != self.context.request_session_id() {
            return Ok(());
        }
        self.reset_watchdog();
        let result = control_cmd_ack_recv(&self.context, message, &self.shared.subscribes);
        let event = match &result {
            Ok(progress) => self.transform_to_event(&Ok(*progress)),
            Err(e) => self.error_event(e.clone()),
        };
        self.switch_state_and_step(core, event);
        result.map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SyncConfig;
    use crate::operation::{SyncOperation, SyncRequest};
    use crate::state_machine::tests::machine_with;
    use meshsync_protocol::{DataItem, DataRequestPacket, TimeSyncPacket, SOFTWARE_VERSION_CURRENT};

    fn push_packet(session_id: u32, sequence: u32) -> Message {
        let mut packet = DataRequestPacket::new(SyncMode::Push);
        packet.data = vec![DataItem::new(b"k1".to_vec(), b"v1".to_vec(), 10)];
        packet.local_watermark = 10;
        packet.last_sequence = 1;
        packet.packet_id = 1;
        Message::request(MessageId::DataSync, session_id, Payload::DataRequest(packet)).with_sequence(sequence)
    }

    #[test]
    fn time_sync_response_moves_on_to_ability_sync() {
        let (machine, comm) = machine_with(SyncConfig::new("dev-a"));
        let (op, _handle) = SyncOperation::new(1, SyncRequest::new(vec!["dev-b".into()], SyncMode::Push));
        machine.context().add_sync_operation(&op, u64::MAX);
        machine.start_sync();
        let sent = comm.take_sent();
        let mut packet = *sent[0].1.as_time_sync().unwrap();
        packet.target_begin = packet.source_begin + 5;
        packet.target_end = packet.source_begin + 6;
        let response = Message::response(MessageId::TimeSync, sent[0].1.session_id, Payload::TimeSync(packet));

        machine.receive_message(response, packet.source_begin + 10).unwrap();
        assert_eq!(machine.state(), State::AbilitySync);
        let sent = comm.take_sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].1.id(), Some(MessageId::AbilitySync));
    }

    #[test]
    fn duplicate_data_packet_is_acked_again() {
        let (machine, comm) = machine_with(SyncConfig::new("dev-a"));
        machine.context().set_remote_software_version(SOFTWARE_VERSION_CURRENT);

        machine.receive_message(push_packet(77, 1), 0).unwrap();
        machine.receive_message(push_packet(77, 1), 0).unwrap();
        let acks: Vec<_> = comm.take_sent().into_iter().map(|(_, m)| m).collect();
        assert_eq!(acks.len(), 2);
        for ack in acks {
            assert_eq!(ack.message_type, MessageType::Response);
            assert_eq!(ack.as_data_ack().unwrap().recv_code, AckCode::Ok);
        }
    }

    #[test]
    fn data_before_ability_sync_asks_for_it() {
        let (machine, comm) = machine_with(SyncConfig::new("dev-a"));
        let err = machine.receive_message(push_packet(5, 1), 0).unwrap_err();
        assert_eq!(err, SyncError::NeedAbilitySync);
        let sent = comm.take_sent();
        assert_eq!(sent[0].1.as_data_ack().unwrap().recv_code, AckCode::NeedAbilitySync);
    }

    #[test]
    fn repeated_ability_request_forgets_remote_version() {
        let (machine, _comm) = machine_with(SyncConfig::new("dev-a"));
        machine.context().set_remote_software_version(SOFTWARE_VERSION_CURRENT);
        machine.context().set_ability_finished(true);
        machine.context().bump_remote_version_id();
        let mut core = machine.core.lock();

        machine.need_ability_sync_handle(&mut core);
        assert!(!machine.context().is_ability_finished());
        assert_eq!(machine.context().remote_software_version(), SOFTWARE_VERSION_CURRENT);

        machine.need_ability_sync_handle(&mut core);
        assert_eq!(machine.context().remote_software_version(), 0);
    }

    #[test]
    fn response_for_unknown_session_is_rejected() {
        let (machine, _comm) = machine_with(SyncConfig::new("dev-a"));
        let ack = Message::response(MessageId::DataSync, 9, Payload::DataAck(DataAckPacket::new(AckCode::Ok)));
        assert_eq!(
            machine.receive_message(ack, 0),
            Err(SyncError::StaleSession { session_id: 9 })
        );
    }

    #[test]
    fn pull_request_queues_a_response_task() {
        let (machine, comm) = machine_with(SyncConfig::new("dev-a"));
        machine.context().set_remote_software_version(SOFTWARE_VERSION_CURRENT);
        let mut packet = DataRequestPacket::new(SyncMode::Pull);
        packet.end_watermark = u64::MAX;
        packet.last_sequence = 1;
        packet.packet_id = 1;
        let request = Message::request(MessageId::DataSync, 42, Payload::DataRequest(packet)).with_sequence(1);

        machine.receive_message(request, 0).unwrap();
        assert_eq!(machine.context().response_session_id(), 42);
        assert_eq!(machine.state(), State::TimeSync);
        let ids: Vec<_> = comm.take_sent().into_iter().map(|(_, m)| m.id()).collect();
        assert_eq!(ids, vec![Some(MessageId::DataSync), Some(MessageId::TimeSync)]);
    }

    #[test]
    fn retransmitted_pull_request_queues_one_response() {
        let (machine, comm) = machine_with(SyncConfig::new("dev-a"));
        machine.context().set_remote_software_version(SOFTWARE_VERSION_CURRENT);
        let pull = |session_id: u32| {
            let mut packet = DataRequestPacket::new(SyncMode::Pull);
            packet.end_watermark = u64::MAX;
            Message::request(MessageId::DataSync, session_id, Payload::DataRequest(packet))
        };
        let mut core = machine.core.lock();

        machine.add_pull_response_target(&mut core, &pull(42), u64::MAX).unwrap();
        assert_eq!(machine.context().response_session_id(), 42);
        assert_eq!(comm.take_sent().len(), 1);

        machine.add_pull_response_target(&mut core, &pull(42), u64::MAX).unwrap();
        assert_eq!(machine.context().response_queue_len(), 0);
        assert!(comm.take_sent().is_empty());

        machine.add_pull_response_target(&mut core, &pull(43), u64::MAX).unwrap();
        machine.add_pull_response_target(&mut core, &pull(43), u64::MAX).unwrap();
        assert_eq!(machine.context().response_queue_len(), 1);
    }

    #[test]
    fn late_time_sync_response_is_not_a_stale_session() {
        let (machine, _comm) = machine_with(SyncConfig::new("dev-a"));
        let response = Message::response(
            MessageId::TimeSync,
            31,
            Payload::TimeSync(TimeSyncPacket::default()),
        );
        assert_eq!(machine.receive_message(response, 0), Ok(()));
        assert_eq!(machine.state(), State::Idle);
    }
}
