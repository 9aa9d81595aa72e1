//! # MeshSync Protocol
//!
//! Wire model for device-to-device sync.
//!
//! This crate provides:
//! - The [`Message`] frame with its id, type, session id and sequence id
//! - Packet bodies for time sync, ability sync, data sync, control commands
//!   and remote query
//! - [`SyncMode`], [`QueryObject`], capability sets and security options
//! - [`PreparedStmt`] with its aligned parcel layout
//!
//! This is a pure protocol crate with no I/O operations.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod ability;
mod ack;
mod capability;
mod control;
mod data;
mod error;
mod message;
mod mode;
mod prepared_stmt;
mod query;
mod remote;
mod security;
mod time_sync;

pub use ability::{
    AbilityAckCode, AbilitySyncAck, AbilitySyncRequest, SOFTWARE_VERSION_CURRENT,
    SOFTWARE_VERSION_EARLIEST, SOFTWARE_VERSION_RELEASE_2_0,
};
pub use ack::AckCode;
pub use capability::{Capability, CapabilitySet, CompressAlgorithm};
pub use control::{ControlAckPacket, ControlCmd, ControlRequestPacket};
pub use data::{DataAckPacket, DataItem, DataRequestPacket, DATA_PACKET_VERSION};
pub use error::{ProtocolError, ProtocolResult};
pub use message::{Feedback, Message, MessageId, MessageType, Payload, UNKNOWN_MESSAGE_CODE};
pub use mode::SyncMode;
pub use prepared_stmt::{
    ExecutorOperation, PreparedStmt, PREPARED_STMT_MAX_ARGS, PREPARED_STMT_VERSION,
};
pub use query::QueryObject;
pub use remote::{
    FieldValue, RelationalRowDataSet, RemoteExecutorAckPacket, RemoteExecutorRequestPacket,
    REMOTE_EXECUTOR_PACKET_VERSION,
};
pub use security::{SecurityFlag, SecurityLabel, SecurityOption};
pub use time_sync::{TimeSyncPacket, TIME_SYNC_VERSION};
