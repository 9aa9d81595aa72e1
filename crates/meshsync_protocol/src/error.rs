//! Error types for the protocol crate.

use meshsync_codec::CodecError;
use thiserror::Error;

/// Result type for protocol operations.
pub type ProtocolResult<T> = Result<T, ProtocolError>;

/// Errors raised while building or parsing protocol messages.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// Underlying codec failure.
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    /// Prepared statement opcode outside the accepted range.
    #[error("invalid prepared statement opcode {0}")]
    InvalidOpcode(i32),

    /// Prepared statement carries more bind arguments than allowed.
    #[error("too many bind arguments: {count} (max {max})")]
    TooManyBindArgs {
        /// Count found on the wire.
        count: i64,
        /// Maximum accepted count.
        max: usize,
    },

    /// Message body does not match what the receiver expected.
    #[error("unexpected payload: expected {expected}")]
    UnexpectedPayload {
        /// Name of the expected payload.
        expected: &'static str,
    },
}
