//! Acknowledgement codes carried in ack packets.

use serde::{Deserialize, Serialize};

/// Result code of an ack packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum AckCode {
    /// Accepted.
    #[default]
    Ok,
    /// The sender has nothing more to send.
    SendFinished,
    /// The packet carried no entries.
    WaterMarkInvalid,
    /// The receiver has no local watermark yet.
    LocalWaterMarkNotInit,
    /// The receiver is still saving; keep the session alive.
    SaveDataNotify,
    /// Ability sync must run again.
    NeedAbilitySync,
    /// The peer does not speak this protocol version.
    VersionNotSupport,
    /// Permission denied.
    NotPermit,
    /// Schemas are incompatible.
    SchemaMismatch,
    /// Security labels are incompatible.
    SecurityOptionCheckError,
    /// The peer is busy.
    Busy,
    /// A resource limit was hit.
    MaxLimits,
    /// The request is not supported.
    NotSupport,
    /// The query could not be parsed.
    InvalidQueryFormat,
    /// The query names an unknown field.
    InvalidQueryField,
    /// The key backing the data was revoked.
    KeyRevoked,
    /// The statement is not allowed.
    DeniedSql,
    /// The response would exceed the size limit.
    RemoteOverSize,
    /// A data interceptor rejected the packet.
    InterceptDataFail,
    /// Unspecified failure.
    Failed,
}

impl AckCode {
    /// Returns true for codes that report success or flow control.
    pub fn is_ok_like(self) -> bool {
        matches!(
            self,
            AckCode::Ok | AckCode::WaterMarkInvalid | AckCode::SendFinished
        )
    }
}
