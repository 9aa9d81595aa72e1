//! Error types for the sync engine.

use meshsync_codec::CodecError;
use meshsync_protocol::{AckCode, ProtocolError};
use thiserror::Error;

/// Result type for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Coarse classification of a [`SyncError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Rejected synchronously, nothing changed.
    InvalidArgument,
    /// A queue or capacity limit was hit; try later.
    ResourceExhaustion,
    /// Peers cannot agree on version or schema.
    ProtocolMismatch,
    /// May succeed on retry.
    Transient,
    /// Aborts the current task for one device only.
    FatalToTask,
    /// The transport lost the peer.
    CommAbnormal,
    /// Bug or broken collaborator.
    Internal,
}

/// Errors that can occur during sync operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SyncError {
    /// A required parameter is missing or out of range.
    #[error("invalid argument: {message}")]
    InvalidArgs {
        /// What was wrong.
        message: String,
    },

    /// The task scheduler queue is full.
    #[error("task scheduler is at capacity")]
    SchedulerFull,

    /// A per-device or global task limit was hit.
    #[error("task limit exceeded")]
    MaxLimits,

    /// A queue was empty.
    #[error("queue is empty")]
    LengthError,

    /// A lookup found nothing.
    #[error("not found")]
    NotFound,

    /// The peer speaks an unsupported protocol version.
    #[error("protocol version not supported")]
    VersionNotSupport,

    /// Ability sync has to run again before data sync.
    #[error("ability sync required")]
    NeedAbilitySync,

    /// The peers' schemas are incompatible.
    #[error("schema mismatch")]
    SchemaMismatch,

    /// The peers' security labels are incompatible.
    #[error("security option check failed")]
    SecurityOptionCheck,

    /// The permission checker rejected the sync.
    #[error("permission denied")]
    NotPermit,

    /// The peer or executor is busy or shutting down.
    #[error("busy")]
    Busy,

    /// The operation timed out.
    #[error("operation timed out")]
    Timeout,

    /// The key protecting the data was revoked.
    #[error("key revoked")]
    KeyRevoked,

    /// The query could not be parsed.
    #[error("invalid query format")]
    InvalidQueryFormat,

    /// The query names an unknown field.
    #[error("invalid query field")]
    InvalidQueryField,

    /// The request is not supported.
    #[error("not supported")]
    NotSupport,

    /// The peer does not know the message id.
    #[error("unknown message")]
    UnknownMessage,

    /// The peer has no communicator for this store.
    #[error("communicator not found")]
    CommunicatorNotFound,

    /// A data interceptor rejected the packet.
    #[error("data interceptor failed")]
    InterceptDataFail,

    /// The peer's response would exceed its size limit.
    #[error("remote response over size")]
    RemoteOverSize,

    /// The statement is not allowed.
    #[error("sql denied")]
    DeniedSql,

    /// The active user changed mid-operation.
    #[error("user changed")]
    UserChanged,

    /// The peripheral transport failed or the device went offline.
    #[error("peripheral interface failed")]
    PeripheralInterfaceFail,

    /// The transport reported the peer unreachable.
    #[error("communication abnormal")]
    CommAbnormal,

    /// The receiver has no watermark for us yet.
    #[error("local watermark not initialized")]
    LocalWaterMarkNotInit,

    /// A message belongs to a session that is no longer active.
    #[error("stale session {session_id}")]
    StaleSession {
        /// Session id carried by the message.
        session_id: u32,
    },

    /// The peer answered with a generic failure.
    #[error("remote peer failed")]
    RemoteFailed,

    /// Storage collaborator error.
    #[error("storage error: {message}")]
    Storage {
        /// Error message.
        message: String,
    },

    /// Internal invariant broken.
    #[error("internal error: {message}")]
    Internal {
        /// Error message.
        message: String,
    },

    /// Codec error.
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    /// Protocol error.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),
}

impl SyncError {
    /// Creates an invalid argument error.
    pub fn invalid_args(message: impl Into<String>) -> Self {
        Self::InvalidArgs {
            message: message.into(),
        }
    }

    /// Creates a storage error.
    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage {
            message: message.into(),
        }
    }

    /// Creates an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Classifies the error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            SyncError::InvalidArgs { .. } => ErrorKind::InvalidArgument,
            SyncError::SchedulerFull | SyncError::MaxLimits | SyncError::LengthError => {
                ErrorKind::ResourceExhaustion
            }
            SyncError::VersionNotSupport
            | SyncError::NeedAbilitySync
            | SyncError::UnknownMessage
            | SyncError::LocalWaterMarkNotInit => ErrorKind::ProtocolMismatch,
            SyncError::Timeout | SyncError::Busy | SyncError::StaleSession { .. } => {
                ErrorKind::Transient
            }
            SyncError::SchemaMismatch
            | SyncError::SecurityOptionCheck
            | SyncError::NotPermit
            | SyncError::KeyRevoked
            | SyncError::InvalidQueryFormat
            | SyncError::InvalidQueryField
            | SyncError::NotSupport
            | SyncError::InterceptDataFail
            | SyncError::RemoteOverSize
            | SyncError::DeniedSql
            | SyncError::UserChanged
            | SyncError::RemoteFailed => ErrorKind::FatalToTask,
            SyncError::CommAbnormal
            | SyncError::CommunicatorNotFound
            | SyncError::PeripheralInterfaceFail => ErrorKind::CommAbnormal,
            SyncError::NotFound
            | SyncError::Storage { .. }
            | SyncError::Internal { .. }
            | SyncError::Codec(_)
            | SyncError::Protocol(_) => ErrorKind::Internal,
        }
    }

    /// Returns true if this error can be retried.
    pub fn is_retryable(&self) -> bool {
        self.kind() == ErrorKind::Transient
    }

    /// Wire code reported to a peer for this error.
    pub fn ack_code(&self) -> AckCode {
        match self {
            SyncError::VersionNotSupport => AckCode::VersionNotSupport,
            SyncError::NeedAbilitySync => AckCode::NeedAbilitySync,
            SyncError::SchemaMismatch => AckCode::SchemaMismatch,
            SyncError::SecurityOptionCheck => AckCode::SecurityOptionCheckError,
            SyncError::NotPermit => AckCode::NotPermit,
            SyncError::Busy => AckCode::Busy,
            SyncError::MaxLimits => AckCode::MaxLimits,
            SyncError::NotSupport | SyncError::UnknownMessage => AckCode::NotSupport,
            SyncError::InvalidQueryFormat => AckCode::InvalidQueryFormat,
            SyncError::InvalidQueryField => AckCode::InvalidQueryField,
            SyncError::KeyRevoked => AckCode::KeyRevoked,
            SyncError::DeniedSql => AckCode::DeniedSql,
            SyncError::RemoteOverSize => AckCode::RemoteOverSize,
            SyncError::InterceptDataFail => AckCode::InterceptDataFail,
            SyncError::LocalWaterMarkNotInit => AckCode::LocalWaterMarkNotInit,
            _ => AckCode::Failed,
        }
    }

    /// Error carried by a peer's ack, or `None` for success and flow codes.
    pub fn from_ack(code: AckCode) -> Option<SyncError> {
        let err = match code {
            AckCode::Ok
            | AckCode::SendFinished
            | AckCode::WaterMarkInvalid
            | AckCode::SaveDataNotify => return None,
            AckCode::LocalWaterMarkNotInit => SyncError::LocalWaterMarkNotInit,
            AckCode::NeedAbilitySync => SyncError::NeedAbilitySync,
            AckCode::VersionNotSupport => SyncError::VersionNotSupport,
            AckCode::NotPermit => SyncError::NotPermit,
            AckCode::SchemaMismatch => SyncError::SchemaMismatch,
            AckCode::SecurityOptionCheckError => SyncError::SecurityOptionCheck,
            AckCode::Busy => SyncError::Busy,
            AckCode::MaxLimits => SyncError::MaxLimits,
            AckCode::NotSupport => SyncError::NotSupport,
            AckCode::InvalidQueryFormat => SyncError::InvalidQueryFormat,
            AckCode::InvalidQueryField => SyncError::InvalidQueryField,
            AckCode::KeyRevoked => SyncError::KeyRevoked,
            AckCode::DeniedSql => SyncError::DeniedSql,
            AckCode::RemoteOverSize => SyncError::RemoteOverSize,
            AckCode::InterceptDataFail => SyncError::InterceptDataFail,
            AckCode::Failed => SyncError::RemoteFailed,
        };
        Some(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_errors() {
        assert!(SyncError::Timeout.is_retryable());
        assert!(SyncError::Busy.is_retryable());
        assert!(!SyncError::SchemaMismatch.is_retryable());
        assert!(!SyncError::invalid_args("empty device").is_retryable());
    }

    #[test]
    fn kinds() {
        assert_eq!(SyncError::MaxLimits.kind(), ErrorKind::ResourceExhaustion);
        assert_eq!(SyncError::VersionNotSupport.kind(), ErrorKind::ProtocolMismatch);
        assert_eq!(SyncError::KeyRevoked.kind(), ErrorKind::FatalToTask);
        assert_eq!(SyncError::PeripheralInterfaceFail.kind(), ErrorKind::CommAbnormal);
    }

    #[test]
    fn ack_codes_map_back_to_errors() {
        for err in [
            SyncError::SchemaMismatch,
            SyncError::NotPermit,
            SyncError::NeedAbilitySync,
            SyncError::KeyRevoked,
            SyncError::MaxLimits,
        ] {
            assert_eq!(SyncError::from_ack(err.ack_code()), Some(err));
        }
        assert_eq!(SyncError::from_ack(AckCode::Ok), None);
        assert_eq!(SyncError::from_ack(AckCode::WaterMarkInvalid), None);
    }

    #[test]
    fn error_display() {
        let err = SyncError::StaleSession { session_id: 9 };
        assert!(err.to_string().contains('9'));
        assert_eq!(SyncError::Timeout.to_string(), "operation timed out");
    }
}
