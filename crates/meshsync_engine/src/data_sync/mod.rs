//! Sliding-window data sync with one peer.
//!
//! The sender keeps up to `window_size` unacked packets in flight. Each sent
//! packet is recorded in the resend map under its sequence id; acks mark
//! entries and the acked prefix of the map is drained in order, saving the
//! send watermark of every drained entry. A timeout resends exactly the
//! unacked entries.

mod control;
mod recv;
mod schedule;

pub(crate) use control::{control_cmd_ack_recv, control_cmd_request_recv, control_cmd_start};
pub(crate) use recv::{send_finished_ack, RecvOutcome};
pub(crate) use schedule::{DataMessageSchedule, Scheduled};

use crate::communicator::MessageSender;
use crate::context::{RetryStatus, SyncTaskContext};
use crate::error::{SyncError, SyncResult};
use crate::operation::OperationStatus;
use crate::state_machine::Progress;
use crate::storage::{DataSizeSpec, SyncDataPage};
use crate::time_helper::mask_device;
use crate::time_sync::apply_offset;
use meshsync_protocol::{
    AckCode, Capability, DataRequestPacket, Message, MessageId, Payload, QueryObject, SyncMode,
    SOFTWARE_VERSION_RELEASE_2_0,
};
use std::collections::BTreeMap;
use tracing::{debug, info, warn};

#[derive(Debug)]
struct ResendInfo {
    end: u64,
    packet_id: u64,
    message: Message,
    acked: bool,
    save_watermark: bool,
}

/// Sender and receiver state of data sync for one peer.
pub(crate) struct DataSync {
    device: String,
    session_id: u32,
    last_session_id: u32,
    mode: SyncMode,
    window_size: u32,
    max_sequence: u32,
    all_sent: bool,
    next_begin: u64,
    end_watermark: u64,
    query: Option<QueryObject>,
    query_id: String,
    resend: BTreeMap<u32, ResendInfo>,
    next_packet_id: u64,
}

impl DataSync {
    pub(crate) fn new(device: &str) -> Self {
        Self {
            device: device.to_string(),
            session_id: 0,
            last_session_id: 0,
            mode: SyncMode::Push,
            window_size: 1,
            max_sequence: 0,
            all_sent: false,
            next_begin: 0,
            end_watermark: 0,
            query: None,
            query_id: String::new(),
            resend: BTreeMap::new(),
            next_packet_id: 0,
        }
    }

    #[cfg(test)]
    fn session_id(&self) -> u32 {
        self.session_id
    }

    #[cfg(test)]
    fn window_size(&self) -> u32 {
        self.window_size
    }

    /// Entry bytes of the largest packet still waiting for its ack.
    pub(crate) fn largest_unacked_bytes(&self) -> usize {
        self.resend
            .values()
            .filter(|info| !info.acked)
            .filter_map(|info| info.message.as_data_request().ok())
            .map(|packet| {
                packet
                    .data
                    .iter()
                    .map(|e| e.key.len() + e.value.len())
                    .sum::<usize>()
            })
            .max()
            .unwrap_or(0)
    }

    /// Starts sending for `mode`, or resends the unacked packets when the
    /// session is already active.
    pub(crate) fn sync_start(
        &mut self,
        mode: SyncMode,
        ctx: &SyncTaskContext,
        sender: &MessageSender,
    ) -> SyncResult<Progress> {
        let session_id = if mode == SyncMode::ResponsePull {
            ctx.response_session_id()
        } else {
            ctx.request_session_id()
        };
        if session_id == 0 {
            return Err(SyncError::internal("data sync started without a session"));
        }
        if self.session_id == session_id && self.mode == mode && !self.resend.is_empty() {
            self.resend_unacked(sender)?;
            return Ok(Progress::Waiting);
        }
        self.reset(session_id, mode, ctx);
        match mode.transfer() {
            SyncMode::Push | SyncMode::PushAndPull => self.request_start(ctx)?,
            SyncMode::Pull => return self.pull_request_start(ctx, sender),
            SyncMode::ResponsePull => self.pull_response_start(ctx)?,
            _ => return Err(SyncError::NotSupport),
        }
        self.inner_sync_start(ctx, sender)
    }

    /// Sends pages while the window has room.
    pub(crate) fn inner_sync_start(
        &mut self,
        ctx: &SyncTaskContext,
        sender: &MessageSender,
    ) -> SyncResult<Progress> {
        while !self.all_sent && self.in_flight() < self.window_size {
            self.send_next_packet(ctx, sender)?;
        }
        Ok(Progress::Waiting)
    }

    /// Handles an ack for one of our packets.
    pub(crate) fn ack_recv(&mut self, ctx: &SyncTaskContext, message: &Message) -> SyncResult<Progress> {
        let ack = message.as_data_ack()?;
        if self.session_id == 0 || message.session_id != self.session_id {
            debug!(device = %mask_device(&self.device), session_id = message.session_id,
                "[DataSync] ack for an inactive session ignored");
            return Ok(Progress::Waiting);
        }
        match ack.recv_code {
            AckCode::VersionNotSupport => return Err(SyncError::VersionNotSupport),
            AckCode::NeedAbilitySync | AckCode::NotPermit => {
                ctx.release_continue_token();
                return Err(SyncError::from_ack(ack.recv_code).unwrap_or(SyncError::RemoteFailed));
            }
            AckCode::SaveDataNotify => return Ok(Progress::KeepAlive),
            AckCode::LocalWaterMarkNotInit => {
                self.clear_sync_status(ctx);
                return Ok(Progress::ReSendData);
            }
            code if !code.is_ok_like() => {
                return Err(SyncError::from_ack(code).unwrap_or(SyncError::RemoteFailed));
            }
            _ => {}
        }
        let Some(info) = self.resend.get_mut(&message.sequence_id) else {
            return Ok(Progress::Waiting);
        };
        if info.packet_id != ack.packet_id {
            debug!(device = %mask_device(&self.device), sequence = message.sequence_id,
                "[DataSync] ack for an older packet ignored");
            return Ok(Progress::Waiting);
        }
        info.acked = true;
        self.drain_acked(ctx)?;
        if ctx.has_continue_token() || !self.all_sent {
            Ok(Progress::SendData)
        } else {
            Ok(Progress::NoDataSend)
        }
    }

    /// Refills the window after an ack, or finishes once everything is acked.
    pub(crate) fn try_continue_sync(
        &mut self,
        ctx: &SyncTaskContext,
        sender: &MessageSender,
        message: &Message,
    ) -> SyncResult<Progress> {
        if self.session_id == 0 || message.session_id != self.session_id {
            return Ok(Progress::Waiting);
        }
        if self.all_sent && self.resend.is_empty() {
            info!(device = %mask_device(&self.device), session_id = self.session_id,
                mode = ?self.mode, "[DataSync] all packets acked");
            if self.mode == SyncMode::ResponsePull {
                ctx.set_response_session_id(0);
            } else {
                ctx.set_operation_status(OperationStatus::SendFinished);
            }
            self.clear_sync_status(ctx);
            return Ok(Progress::Finished);
        }
        self.inner_sync_start(ctx, sender)
    }

    /// Drops the send in progress. The sequence counter survives so a
    /// restarted send on the same session is not mistaken for duplicates.
    pub(crate) fn clear_sync_status(&mut self, ctx: &SyncTaskContext) {
        self.session_id = 0;
        self.resend.clear();
        self.all_sent = false;
        ctx.release_continue_token();
    }

    /// Tells the puller its response failed.
    pub(crate) fn send_pull_response_error(
        &mut self,
        ctx: &SyncTaskContext,
        sender: &MessageSender,
        err: &SyncError,
    ) -> SyncResult<()> {
        let session_id = ctx.response_session_id();
        if session_id == 0 {
            return Ok(());
        }
        let sequence = if self.last_session_id == session_id {
            self.max_sequence + 1
        } else {
            1
        };
        let mut packet = DataRequestPacket::new(SyncMode::ResponsePull);
        packet.send_code = err.ack_code();
        packet.last_sequence = sequence;
        packet.session_id = session_id;
        self.next_packet_id += 1;
        packet.packet_id = self.next_packet_id;
        let id = message_id_for(ctx.response_query().as_ref());
        warn!(device = %mask_device(&self.device), session_id, error = %err,
            "[DataSync] pull response failed");
        sender.send(Message::request(id, session_id, Payload::DataRequest(packet)).with_sequence(sequence))
    }

    fn reset(&mut self, session_id: u32, mode: SyncMode, ctx: &SyncTaskContext) {
        if session_id != self.last_session_id {
            self.max_sequence = 0;
        }
        self.session_id = session_id;
        self.last_session_id = session_id;
        self.mode = mode;
        self.resend.clear();
        self.all_sent = false;
        self.window_size = window_size_for(ctx);
        ctx.release_continue_token();
    }

    fn request_start(&mut self, ctx: &SyncTaskContext) -> SyncResult<()> {
        self.next_begin = ctx.get_corrected_send_watermark_for_current_task()?;
        self.end_watermark = ctx.end_watermark();
        self.query = ctx.query();
        self.query_id = ctx.query_id();
        Ok(())
    }

    fn pull_response_start(&mut self, ctx: &SyncTaskContext) -> SyncResult<()> {
        self.query = ctx.response_query();
        self.query_id = self.query.as_ref().map(QueryObject::identify).unwrap_or_default();
        self.next_begin = if self.query_id.is_empty() {
            ctx.metadata().local_watermark(&self.device)?
        } else {
            ctx.metadata().send_query_watermark(&self.query_id, &self.device)?
        };
        self.end_watermark = ctx.response_end_watermark();
        Ok(())
    }

    fn pull_request_start(&mut self, ctx: &SyncTaskContext, sender: &MessageSender) -> SyncResult<Progress> {
        self.query = ctx.query();
        self.query_id = ctx.query_id();
        let sequence = self.max_sequence + 1;
        let mut packet = DataRequestPacket::new(self.mode);
        packet.end_watermark = pull_end_watermark(ctx).max(1);
        packet.peer_watermark = self.peer_watermark(ctx)?;
        packet.session_id = self.session_id;
        packet.query = self.query.clone();
        packet.query_id = self.query_id.clone();
        packet.last_sequence = sequence;
        self.next_packet_id += 1;
        packet.packet_id = self.next_packet_id;
        let message = Message::request(
            message_id_for(self.query.as_ref()),
            self.session_id,
            Payload::DataRequest(packet),
        )
        .with_sequence(sequence);
        self.resend.insert(
            sequence,
            ResendInfo {
                end: 0,
                packet_id: self.next_packet_id,
                message: message.clone(),
                acked: false,
                save_watermark: false,
            },
        );
        self.max_sequence = sequence;
        self.all_sent = true;
        ctx.set_retry_status(RetryStatus::NoNeedRetry);
        sender.send(message)?;
        Ok(Progress::Waiting)
    }

    fn send_next_packet(&mut self, ctx: &SyncTaskContext, sender: &MessageSender) -> SyncResult<()> {
        let page = self.read_page(ctx)?;
        let last = page.token.is_none();
        let begin = self.next_begin;
        let page_max = page.entries.iter().map(|e| e.timestamp).max();
        let end = if last {
            page_max.map_or(self.end_watermark, |max| max.max(self.end_watermark))
        } else {
            page_max.unwrap_or(begin)
        };
        let sequence = self.max_sequence + 1;

        let mut packet = DataRequestPacket::new(self.mode);
        packet.data = page.entries;
        packet.local_watermark = end;
        packet.peer_watermark = self.peer_watermark(ctx)?;
        packet.session_id = self.session_id;
        packet.query = self.query.clone();
        packet.query_id = self.query_id.clone();
        self.next_packet_id += 1;
        packet.packet_id = self.next_packet_id;
        if last {
            packet.last_sequence = sequence;
            packet.send_code = AckCode::SendFinished;
            if self.mode.transfer() == SyncMode::PushAndPull {
                packet.end_watermark = pull_end_watermark(ctx).max(1);
            }
        }
        debug!(device = %mask_device(&self.device), session_id = self.session_id, sequence,
            entries = packet.data.len(), last, "[DataSync] sending data packet");

        let message = Message::request(
            message_id_for(self.query.as_ref()),
            self.session_id,
            Payload::DataRequest(packet),
        )
        .with_sequence(sequence);
        self.resend.insert(
            sequence,
            ResendInfo {
                end,
                packet_id: self.next_packet_id,
                message: message.clone(),
                acked: false,
                save_watermark: true,
            },
        );
        self.max_sequence = sequence;
        self.next_begin = end.saturating_add(1);
        self.all_sent = last;
        ctx.set_continue_token(page.token);
        sender.send(message)
    }

    fn read_page(&self, ctx: &SyncTaskContext) -> SyncResult<SyncDataPage> {
        let spec = DataSizeSpec {
            block_size: ctx.config().data_block_size,
            packet_size: ctx.config().page_size,
        };
        let storage = ctx.storage();
        if let Some(token) = ctx.take_continue_token() {
            return storage.get_sync_data_next(token, &spec);
        }
        match &self.query {
            Some(query) => storage.get_sync_data_by_query(query, self.next_begin, self.end_watermark, &spec),
            None => storage.get_sync_data(self.next_begin, self.end_watermark, &spec),
        }
    }

    fn resend_unacked(&self, sender: &MessageSender) -> SyncResult<()> {
        for (sequence, info) in self.resend.iter().filter(|(_, info)| !info.acked) {
            debug!(device = %mask_device(&self.device), session_id = self.session_id,
                sequence = *sequence, "[DataSync] resending packet");
            sender.send(info.message.clone())?;
        }
        Ok(())
    }

    fn drain_acked(&mut self, ctx: &SyncTaskContext) -> SyncResult<()> {
        while let Some(entry) = self.resend.first_entry() {
            if !entry.get().acked {
                break;
            }
            let info = entry.remove();
            if info.save_watermark {
                self.save_watermark(ctx, info.end.saturating_add(1))?;
            }
        }
        Ok(())
    }

    fn save_watermark(&self, ctx: &SyncTaskContext, value: u64) -> SyncResult<()> {
        if self.query_id.is_empty() {
            ctx.metadata().set_local_watermark(&self.device, value)
        } else {
            ctx.metadata()
                .set_send_query_watermark(&self.query_id, &self.device, value)
        }
    }

    fn peer_watermark(&self, ctx: &SyncTaskContext) -> SyncResult<u64> {
        if self.query_id.is_empty() {
            ctx.metadata().peer_watermark(&self.device)
        } else {
            ctx.metadata().recv_query_watermark(&self.query_id, &self.device)
        }
    }

    fn in_flight(&self) -> u32 {
        self.resend.values().filter(|info| !info.acked).count() as u32
    }
}

fn window_size_for(ctx: &SyncTaskContext) -> u32 {
    let sliding = ctx.remote_capabilities().contains(Capability::SlidingWindow)
        && ctx.remote_software_version() > SOFTWARE_VERSION_RELEASE_2_0;
    if sliding {
        ctx.config().high_window_size
    } else {
        ctx.config().low_window_size
    }
}

/// End of a pull in the peer's clock.
fn pull_end_watermark(ctx: &SyncTaskContext) -> u64 {
    apply_offset(ctx.end_watermark(), ctx.time_offset())
}

fn message_id_for(query: Option<&QueryObject>) -> MessageId {
    if query.is_some() {
        MessageId::QuerySync
    } else {
        MessageId::DataSync
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SyncConfig;
    use crate::context::tests::context_with;
    use crate::operation::{SyncOperation, SyncRequest};
    use crate::test_support::{FakeStorage, RecordingCommunicator};
    use meshsync_protocol::{CapabilitySet, DataAckPacket, DataItem, SOFTWARE_VERSION_CURRENT};
    use std::sync::Arc;
    use std::time::Duration;

    struct Fixture {
        ctx: SyncTaskContext,
        comm: Arc<RecordingCommunicator>,
        sender: MessageSender,
        storage: Arc<FakeStorage>,
    }

    fn fixture(entries: Vec<DataItem>, mode: SyncMode) -> Fixture {
        let storage = Arc::new(FakeStorage::with_entries(entries));
        let ctx = context_with(storage.clone(), SyncConfig::new("dev-a"));
        ctx.set_remote_capabilities(CapabilitySet::all());
        ctx.set_remote_software_version(SOFTWARE_VERSION_CURRENT);
        let (op, _handle) = SyncOperation::new(1, SyncRequest::new(vec!["dev-b".into()], mode));
        ctx.add_sync_operation(&op, 1_000);
        assert!(ctx.move_to_next_target());
        ctx.generate_request_session_id();
        let comm = Arc::new(RecordingCommunicator::new("dev-a"));
        let sender = MessageSender::new(comm.clone(), "dev-b", Duration::from_secs(1));
        Fixture { ctx, comm, sender, storage }
    }

    fn ack_for(message: &Message, code: AckCode) -> Message {
        let mut ack = DataAckPacket::new(code);
        ack.packet_id = message.as_data_request().unwrap().packet_id;
        Message::response(MessageId::DataSync, message.session_id, Payload::DataAck(ack))
            .with_sequence(message.sequence_id)
    }

    #[test]
    fn push_sends_one_packet_and_finishes_on_ack() {
        let f = fixture(
            vec![DataItem::new(b"k1".to_vec(), b"v".to_vec(), 10), DataItem::new(b"k2".to_vec(), b"v".to_vec(), 20)],
            SyncMode::Push,
        );
        let mut sync = DataSync::new("dev-b");
        assert_eq!(sync.window_size(), 1);
        assert_eq!(sync.sync_start(SyncMode::Push, &f.ctx, &f.sender).unwrap(), Progress::Waiting);
        assert_eq!(sync.window_size(), 3);

        let sent = f.comm.take_sent();
        assert_eq!(sent.len(), 1);
        let packet = sent[0].1.as_data_request().unwrap();
        assert_eq!(packet.data.len(), 2);
        assert_eq!(packet.last_sequence, 1);
        assert_eq!(sent[0].1.session_id, f.ctx.request_session_id());

        let ack = ack_for(&sent[0].1, AckCode::Ok);
        assert_eq!(sync.ack_recv(&f.ctx, &ack).unwrap(), Progress::NoDataSend);
        assert_eq!(f.ctx.metadata().local_watermark("dev-b").unwrap(), 1_001);
        assert_eq!(sync.try_continue_sync(&f.ctx, &f.sender, &ack).unwrap(), Progress::Finished);
        assert_eq!(sync.session_id(), 0);
        assert!(f.storage.received.lock().is_empty());
    }

    #[test]
    fn timeout_resends_only_unacked() {
        let f = fixture(vec![DataItem::new(b"k".to_vec(), b"v".to_vec(), 10)], SyncMode::Push);
        let mut sync = DataSync::new("dev-b");
        sync.sync_start(SyncMode::Push, &f.ctx, &f.sender).unwrap();
        let first = f.comm.take_sent();
        sync.sync_start(SyncMode::Push, &f.ctx, &f.sender).unwrap();
        let resent = f.comm.take_sent();
        assert_eq!(resent.len(), 1);
        assert_eq!(resent[0].1, first[0].1);
    }

    #[test]
    fn stale_and_unknown_acks_are_ignored() {
        let f = fixture(vec![], SyncMode::Push);
        let mut sync = DataSync::new("dev-b");
        sync.sync_start(SyncMode::Push, &f.ctx, &f.sender).unwrap();
        let sent = f.comm.take_sent();

        let mut foreign = ack_for(&sent[0].1, AckCode::Ok);
        foreign.session_id ^= 1;
        assert_eq!(sync.ack_recv(&f.ctx, &foreign).unwrap(), Progress::Waiting);

        let unknown = ack_for(&sent[0].1, AckCode::Ok).with_sequence(9);
        assert_eq!(sync.ack_recv(&f.ctx, &unknown).unwrap(), Progress::Waiting);
        assert_eq!(f.ctx.metadata().local_watermark("dev-b").unwrap(), 0);
    }

    #[test]
    fn error_codes_surface_as_errors() {
        let f = fixture(vec![], SyncMode::Push);
        let mut sync = DataSync::new("dev-b");
        sync.sync_start(SyncMode::Push, &f.ctx, &f.sender).unwrap();
        let sent = f.comm.take_sent();
        assert_eq!(
            sync.ack_recv(&f.ctx, &ack_for(&sent[0].1, AckCode::SaveDataNotify)).unwrap(),
            Progress::KeepAlive
        );
        assert_eq!(
            sync.ack_recv(&f.ctx, &ack_for(&sent[0].1, AckCode::SchemaMismatch)),
            Err(SyncError::SchemaMismatch)
        );
    }

    #[test]
    fn pull_request_carries_end_watermark_and_disables_retry() {
        let f = fixture(vec![], SyncMode::Pull);
        f.ctx.set_time_offset(-100);
        let mut sync = DataSync::new("dev-b");
        sync.sync_start(SyncMode::Pull, &f.ctx, &f.sender).unwrap();
        let sent = f.comm.take_sent();
        let packet = sent[0].1.as_data_request().unwrap();
        assert_eq!(packet.end_watermark, 900);
        assert!(packet.is_pull_request());
        assert!(packet.data.is_empty());
        assert!(!f.ctx.is_sync_task_need_retry());
    }

    #[test]
    fn missing_session_is_an_error() {
        let f = fixture(vec![], SyncMode::Push);
        let mut sync = DataSync::new("dev-b");
        assert!(matches!(
            sync.sync_start(SyncMode::ResponsePull, &f.ctx, &f.sender),
            Err(SyncError::Internal { .. })
        ));
    }
}
