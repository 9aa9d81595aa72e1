use super::DataSync;
use crate::communicator::MessageSender;
use crate::config::PermissionFlag;
use crate::context::SyncTaskContext;
use crate::error::{SyncError, SyncResult};
use crate::state_machine::Progress;
use crate::time_helper::mask_device;
use meshsync_protocol::{
    AckCode, DataAckPacket, DataRequestPacket, Message, MessageId, Payload, SyncMode,
    DATA_PACKET_VERSION,
};
use tracing::{debug, warn};

/// Result of handling one inbound data packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct RecvOutcome {
    pub(crate) progress: Progress,
    /// Nonzero when the peer asked us to answer a pull up to this watermark.
    pub(crate) pull_end: u64,
}

impl DataSync {
    /// Saves one data packet from the peer and acks it.
    pub(crate) fn data_request_recv(
        &mut self,
        ctx: &SyncTaskContext,
        sender: &MessageSender,
        message: &Message,
    ) -> SyncResult<RecvOutcome> {
        let packet = message.as_data_request()?;
        let device = ctx.device();

        if ctx.is_need_reset_ability_sync()
            || (ctx.remote_software_version() == 0 && sender.remote_version() != 0)
        {
            send_ack(sender, message, packet, AckCode::NeedAbilitySync)?;
            return Err(SyncError::NeedAbilitySync);
        }
        if packet.version > DATA_PACKET_VERSION {
            send_ack(sender, message, packet, AckCode::VersionNotSupport)?;
            return Err(SyncError::VersionNotSupport);
        }
        if !packet.send_code.is_ok_like() {
            send_ack(sender, message, packet, AckCode::Ok)?;
            return Err(SyncError::from_ack(packet.send_code).unwrap_or(SyncError::RemoteFailed));
        }

        let is_pull = packet.is_pull_request();
        let checker = &ctx.config().permission_checker;
        let receives = packet.mode.transfer() != SyncMode::Pull;
        if (receives && !checker.check(device, PermissionFlag::Receive))
            || (is_pull && !checker.check(device, PermissionFlag::Send))
        {
            warn!(device = %mask_device(device), mode = ?packet.mode,
                "[DataSync] permission check failed for inbound data");
            send_ack(sender, message, packet, AckCode::NotPermit)?;
            return Err(SyncError::NotPermit);
        }
        if let Some(query) = &packet.query {
            if let Err(e) = ctx.storage().check_query(query) {
                send_ack(sender, message, packet, e.ack_code())?;
                return Err(e);
            }
        }
        if is_pull && !ctx.storage().is_readable() {
            send_ack(sender, message, packet, AckCode::KeyRevoked)?;
            return Err(SyncError::KeyRevoked);
        }

        if let Some(max) = packet.data.iter().map(|e| e.timestamp).max() {
            if let Err(e) = ctx.storage().put_sync_data(&packet.data, device) {
                warn!(device = %mask_device(device), error = %e, "[DataSync] saving sync data failed");
                send_ack(sender, message, packet, e.ack_code())?;
                return Err(e);
            }
            let watermark = max.saturating_add(1);
            if packet.query_id.is_empty() {
                ctx.metadata().set_peer_watermark(device, watermark)?;
            } else {
                ctx.metadata()
                    .set_recv_query_watermark(&packet.query_id, device, watermark)?;
            }
        }

        let code = if packet.data.is_empty() && !is_pull {
            AckCode::WaterMarkInvalid
        } else {
            AckCode::Ok
        };
        send_ack(sender, message, packet, code)?;
        debug!(device = %mask_device(device), session_id = message.session_id,
            sequence = message.sequence_id, entries = packet.data.len(),
            "[DataSync] data packet saved");

        let last = packet.last_sequence != 0 && message.sequence_id >= packet.last_sequence;
        let ours = message.session_id != 0 && message.session_id == ctx.request_session_id();
        let progress = if packet.mode == SyncMode::ResponsePull && last && ours {
            Progress::RecvFinished
        } else {
            Progress::Waiting
        };
        Ok(RecvOutcome {
            progress,
            pull_end: if is_pull { packet.end_watermark } else { 0 },
        })
    }
}

/// Acks a packet that was already handled.
pub(crate) fn send_finished_ack(sender: &MessageSender, message: &Message) -> SyncResult<()> {
    let packet = message.as_data_request()?;
    send_ack(sender, message, packet, AckCode::Ok)
}

fn send_ack(
    sender: &MessageSender,
    message: &Message,
    packet: &DataRequestPacket,
    code: AckCode,
) -> SyncResult<()> {
    let mut ack = DataAckPacket::new(code);
    ack.packet_id = packet.packet_id;
    let id = message.id().unwrap_or(MessageId::DataSync);
    sender.send(
        Message::response(id, message.session_id, Payload::DataAck(ack))
            .with_sequence(message.sequence_id),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{PermissionChecker, SyncConfig};
    use crate::context::tests::context_with;
    use crate::test_support::{FakeStorage, RecordingCommunicator};
    use meshsync_protocol::{DataItem, SOFTWARE_VERSION_CURRENT};
    use std::sync::Arc;
    use std::time::Duration;

    fn receiver(config: SyncConfig) -> (SyncTaskContext, Arc<FakeStorage>, Arc<RecordingCommunicator>, MessageSender) {
        let storage = Arc::new(FakeStorage::default());
        let ctx = context_with(storage.clone(), config);
        ctx.set_remote_software_version(SOFTWARE_VERSION_CURRENT);
        let comm = Arc::new(RecordingCommunicator::new("dev-a"));
        let sender = MessageSender::new(comm.clone(), "dev-b", Duration::from_secs(1));
        (ctx, storage, comm, sender)
    }

    fn data_packet(mode: SyncMode, items: Vec<DataItem>, sequence: u32, last: u32) -> Message {
        let mut packet = DataRequestPacket::new(mode);
        packet.data = items;
        packet.last_sequence = last;
        packet.packet_id = 40 + sequence as u64;
        Message::request(MessageId::DataSync, 77, Payload::DataRequest(packet)).with_sequence(sequence)
    }

    fn ack_code(comm: &RecordingCommunicator) -> (AckCode, u64) {
        let (_, message) = comm.take_sent().pop().unwrap();
        let ack = message.as_data_ack().unwrap();
        (ack.recv_code, ack.packet_id)
    }

    #[test]
    fn push_data_is_saved_and_acked() {
        let (ctx, storage, comm, sender) = receiver(SyncConfig::new("dev-a"));
        let mut sync = DataSync::new("dev-b");
        let message = data_packet(SyncMode::Push, vec![DataItem::new(b"k".to_vec(), b"v".to_vec(), 30)], 1, 1);
        let outcome = sync.data_request_recv(&ctx, &sender, &message).unwrap();
        assert_eq!(outcome, RecvOutcome { progress: Progress::Waiting, pull_end: 0 });
        assert_eq!(storage.received.lock().len(), 1);
        assert_eq!(ctx.metadata().peer_watermark("dev-b").unwrap(), 31);
        assert_eq!(ack_code(&comm), (AckCode::Ok, 41));
    }

    #[test]
    fn empty_page_acks_watermark_invalid() {
        let (ctx, _storage, comm, sender) = receiver(SyncConfig::new("dev-a"));
        let mut sync = DataSync::new("dev-b");
        sync.data_request_recv(&ctx, &sender, &data_packet(SyncMode::Push, vec![], 1, 1)).unwrap();
        assert_eq!(ack_code(&comm).0, AckCode::WaterMarkInvalid);
    }

    #[test]
    fn unknown_peer_must_redo_ability_sync() {
        let (ctx, storage, comm, sender) = receiver(SyncConfig::new("dev-a"));
        ctx.set_remote_software_version(0);
        let mut sync = DataSync::new("dev-b");
        let message = data_packet(SyncMode::Push, vec![DataItem::new(b"k".to_vec(), b"v".to_vec(), 1)], 1, 1);
        assert_eq!(sync.data_request_recv(&ctx, &sender, &message), Err(SyncError::NeedAbilitySync));
        assert_eq!(ack_code(&comm).0, AckCode::NeedAbilitySync);
        assert!(storage.received.lock().is_empty());
    }

    #[test]
    fn denied_receive_is_not_saved() {
        let config = SyncConfig::new("dev-a")
            .with_permission_checker(PermissionChecker::new(|_, flag| flag != PermissionFlag::Receive));
        let (ctx, storage, comm, sender) = receiver(config);
        let mut sync = DataSync::new("dev-b");
        let message = data_packet(SyncMode::Push, vec![DataItem::new(b"k".to_vec(), b"v".to_vec(), 1)], 1, 1);
        assert_eq!(sync.data_request_recv(&ctx, &sender, &message), Err(SyncError::NotPermit));
        assert_eq!(ack_code(&comm).0, AckCode::NotPermit);
        assert!(storage.received.lock().is_empty());
    }

    #[test]
    fn pull_request_reports_end_watermark() {
        let (ctx, _storage, comm, sender) = receiver(SyncConfig::new("dev-a"));
        let mut sync = DataSync::new("dev-b");
        let mut message = data_packet(SyncMode::Pull, vec![], 1, 1);
        if let Payload::DataRequest(packet) = &mut message.payload {
            packet.end_watermark = 500;
        }
        let outcome = sync.data_request_recv(&ctx, &sender, &message).unwrap();
        assert_eq!(outcome.pull_end, 500);
        assert_eq!(ack_code(&comm).0, AckCode::Ok);
    }

    #[test]
    fn last_pull_response_packet_finishes_receive() {
        let (ctx, _storage, _comm, sender) = receiver(SyncConfig::new("dev-a"));
        let session = ctx.generate_request_session_id();
        let mut sync = DataSync::new("dev-b");
        let mut message = data_packet(SyncMode::ResponsePull, vec![], 2, 2);
        message.session_id = session;
        let outcome = sync.data_request_recv(&ctx, &sender, &message).unwrap();
        assert_eq!(outcome.progress, Progress::RecvFinished);

        message.session_id = session.wrapping_add(1);
        let outcome = sync.data_request_recv(&ctx, &sender, &message).unwrap();
        assert_eq!(outcome.progress, Progress::Waiting);
    }

    #[test]
    fn remote_failure_code_is_returned() {
        let (ctx, _storage, comm, sender) = receiver(SyncConfig::new("dev-a"));
        let mut sync = DataSync::new("dev-b");
        let mut message = data_packet(SyncMode::ResponsePull, vec![], 1, 1);
        if let Payload::DataRequest(packet) = &mut message.payload {
            packet.send_code = AckCode::SchemaMismatch;
        }
        assert_eq!(sync.data_request_recv(&ctx, &sender, &message), Err(SyncError::SchemaMismatch));
        assert_eq!(ack_code(&comm).0, AckCode::Ok);
    }
}
