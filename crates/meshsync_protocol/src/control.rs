//! Control command packets.

use crate::ack::AckCode;
use crate::query::QueryObject;
use serde::{Deserialize, Serialize};

/// Control command kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ControlCmd {
    /// Register a query subscription.
    SubscribeQuery,
    /// Remove a query subscription.
    UnsubscribeQuery,
    /// Unknown command from a newer peer.
    Invalid(u32),
}

/// Control command request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlRequestPacket {
    /// Packet version.
    pub version: u32,
    /// Command.
    pub cmd: ControlCmd,
    /// Subscribed query.
    pub query: QueryObject,
}

/// Control command ack.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlAckPacket {
    /// Packet version.
    pub version: u32,
    /// Echo of the command.
    pub cmd: ControlCmd,
    /// Result.
    pub recv_code: AckCode,
}
