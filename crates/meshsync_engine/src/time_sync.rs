//! Clock offset exchange with one peer.

use crate::communicator::MessageSender;
use crate::error::{SyncError, SyncResult};
use crate::metadata::Metadata;
use crate::time_helper::{mask_device, now_ticks, MAX_TIME_OFFSET_NOISE};
use meshsync_protocol::{Message, MessageId, Payload, TimeSyncPacket};
use tracing::{debug, info};

/// Time sync state for one peer. The offset is the peer's clock minus ours.
pub(crate) struct TimeSync {
    device: String,
    session_id: u32,
    synced: bool,
    offset: i64,
}

impl TimeSync {
    /// Starts from the offset persisted for `device`.
    pub(crate) fn new(device: &str, metadata: &Metadata) -> Self {
        let offset = metadata.time_offset(device).unwrap_or(0);
        Self {
            device: device.to_string(),
            session_id: 0,
            synced: false,
            offset,
        }
    }

    pub(crate) fn is_need_sync(&self) -> bool {
        !self.synced
    }

    /// Sends a request stamped with the local send time.
    pub(crate) fn sync_start(&mut self, sender: &MessageSender, session_id: u32) -> SyncResult<()> {
        self.session_id = session_id;
        let packet = TimeSyncPacket::request(now_ticks());
        sender.send(Message::request(
            MessageId::TimeSync,
            session_id,
            Payload::TimeSync(packet),
        ))
    }

    /// Answers a peer's request. `received_at` is taken before any locking.
    pub(crate) fn request_recv(
        sender: &MessageSender,
        message: &Message,
        received_at: u64,
    ) -> SyncResult<()> {
        let mut packet = *message.as_time_sync()?;
        packet.target_begin = received_at;
        packet.target_end = now_ticks();
        sender.send(
            Message::response(
                MessageId::TimeSync,
                message.session_id,
                Payload::TimeSync(packet),
            )
            .with_sequence(message.sequence_id),
        )
    }

    /// Computes the offset from a response to our request.
    pub(crate) fn ack_recv(
        &mut self,
        message: &Message,
        received_at: u64,
        metadata: &Metadata,
    ) -> SyncResult<i64> {
        if self.session_id == 0 || message.session_id != self.session_id {
            return Err(SyncError::StaleSession {
                session_id: message.session_id,
            });
        }
        let mut packet = *message.as_time_sync()?;
        packet.source_end = received_at;
        let offset = packet.offset();
        if (offset - self.offset).abs() > MAX_TIME_OFFSET_NOISE {
            info!(device = %mask_device(&self.device), offset,
                "[TimeSync] saving new time offset");
            metadata.set_time_offset(&self.device, offset)?;
            self.offset = offset;
        } else {
            debug!(device = %mask_device(&self.device), offset,
                "[TimeSync] offset within noise, keeping cached value");
        }
        self.synced = true;
        self.session_id = 0;
        Ok(self.offset)
    }

    /// Cached offset, in ticks.
    pub(crate) fn time_offset(&self) -> i64 {
        self.offset
    }

    /// Forces a fresh exchange before the next task.
    pub(crate) fn reset(&mut self) {
        self.synced = false;
        self.session_id = 0;
    }
}

/// Shifts a local timestamp by the peer's clock offset.
pub(crate) fn apply_offset(timestamp: u64, offset: i64) -> u64 {
    timestamp.saturating_add_signed(offset)
}
