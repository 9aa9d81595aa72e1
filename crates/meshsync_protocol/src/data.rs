//! Data sync packets.

use crate::ack::AckCode;
use crate::capability::CompressAlgorithm;
use crate::mode::SyncMode;
use crate::query::QueryObject;
use serde::{Deserialize, Serialize};

/// Data packet version of this build.
pub const DATA_PACKET_VERSION: u32 = 3;

/// One replicated entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataItem {
    /// Entry key.
    pub key: Vec<u8>,
    /// Entry value; empty for deletions.
    pub value: Vec<u8>,
    /// Logical timestamp, used as the watermark.
    pub timestamp: u64,
    /// Tombstone marker.
    pub deleted: bool,
    /// Device the entry was first written on.
    pub origin_device: String,
}

impl DataItem {
    /// Creates a live entry.
    pub fn new(key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>, timestamp: u64) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
            timestamp,
            deleted: false,
            origin_device: String::new(),
        }
    }
}

/// A page of entries, or a pull request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataRequestPacket {
    /// Packet version.
    pub version: u32,
    /// Sender status: `Ok`, `SendFinished` on the last page, or an error.
    pub send_code: AckCode,
    /// Mode as seen by the receiver.
    pub mode: SyncMode,
    /// Entries.
    pub data: Vec<DataItem>,
    /// Sender's local watermark after this page.
    pub local_watermark: u64,
    /// Watermark the sender holds for the receiver.
    pub peer_watermark: u64,
    /// Deletion watermark.
    pub delete_watermark: u64,
    /// Pull end watermark; nonzero asks the receiver to answer a pull.
    pub end_watermark: u64,
    /// Requester session for pull requests.
    pub session_id: u32,
    /// Query for query sync.
    pub query: Option<QueryObject>,
    /// Identity of the query.
    pub query_id: String,
    /// Sequence id of the last packet in the session, or 0 if not known yet.
    pub last_sequence: u32,
    /// Identifies this page; acks echo it.
    pub packet_id: u64,
    /// Compression used for the entries.
    pub compress: CompressAlgorithm,
    /// Whether the receiver may advance its watermark.
    pub update_watermark: bool,
}

impl DataRequestPacket {
    /// Creates an empty packet for `mode`.
    pub fn new(mode: SyncMode) -> Self {
        Self {
            version: DATA_PACKET_VERSION,
            send_code: AckCode::Ok,
            mode,
            data: Vec::new(),
            local_watermark: 0,
            peer_watermark: 0,
            delete_watermark: 0,
            end_watermark: 0,
            session_id: 0,
            query: None,
            query_id: String::new(),
            last_sequence: 0,
            packet_id: 0,
            compress: CompressAlgorithm::None,
            update_watermark: true,
        }
    }

    /// Returns true if this packet asks the receiver to answer a pull.
    pub fn is_pull_request(&self) -> bool {
        self.end_watermark > 0
    }
}

/// Acknowledgement of a [`DataRequestPacket`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataAckPacket {
    /// Packet version.
    pub version: u32,
    /// Receiver status.
    pub recv_code: AckCode,
    /// Receiver's watermark after saving; nonzero with `SaveDataNotify` arms the
    /// receive feed-dog.
    pub data: u64,
    /// Echo of the request's packet id.
    pub packet_id: u64,
    /// Reserved words.
    pub reserved: Vec<u64>,
}

impl DataAckPacket {
    /// Creates an ack with `recv_code`.
    pub fn new(recv_code: AckCode) -> Self {
        Self {
            version: DATA_PACKET_VERSION,
            recv_code,
            data: 0,
            packet_id: 0,
            reserved: Vec::new(),
        }
    }
}
