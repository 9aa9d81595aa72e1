//! Time sync packet.

use serde::{Deserialize, Serialize};

/// Current time sync packet version.
pub const TIME_SYNC_VERSION: u32 = 1;

/// Four timestamps of one round trip, in 100 ns ticks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TimeSyncPacket {
    /// Requester send time.
    pub source_begin: u64,
    /// Requester receive time of the response.
    pub source_end: u64,
    /// Responder receive time.
    pub target_begin: u64,
    /// Responder send time.
    pub target_end: u64,
    /// Packet version.
    pub version: u32,
}

impl TimeSyncPacket {
    /// Builds a request stamped with the send time.
    pub fn request(source_begin: u64) -> Self {
        Self {
            source_begin,
            version: TIME_SYNC_VERSION,
            ..Self::default()
        }
    }

    /// Offset of the responder's clock relative to the requester's.
    pub fn offset(&self) -> i64 {
        let forward = self.target_begin as i64 - self.source_begin as i64;
        let backward = self.target_end as i64 - self.source_end as i64;
        (forward + backward) / 2
    }
}
