//! The message frame shared by every sub-protocol.

use crate::ability::{AbilitySyncAck, AbilitySyncRequest};
use crate::control::{ControlAckPacket, ControlRequestPacket};
use crate::data::{DataAckPacket, DataRequestPacket};
use crate::error::{ProtocolError, ProtocolResult};
use crate::remote::{RemoteExecutorAckPacket, RemoteExecutorRequestPacket};
use crate::time_sync::TimeSyncPacket;
use meshsync_codec::{from_cbor, to_cbor};
use serde::{Deserialize, Serialize};

/// Message ids of the sub-protocols.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageId {
    /// Clock offset exchange.
    TimeSync,
    /// Full data sync.
    DataSync,
    /// Version and capability negotiation.
    AbilitySync,
    /// Query-filtered data sync.
    QuerySync,
    /// Subscribe and unsubscribe commands.
    ControlSync,
    /// Remote query execution.
    RemoteExecute,
}

/// First code past the known message ids.
pub const UNKNOWN_MESSAGE_CODE: u32 = 11;

impl MessageId {
    /// Wire code.
    pub fn code(self) -> u32 {
        match self {
            MessageId::TimeSync => 1,
            MessageId::DataSync => 2,
            MessageId::AbilitySync => 7,
            MessageId::QuerySync => 8,
            MessageId::ControlSync => 9,
            MessageId::RemoteExecute => 10,
        }
    }

    /// Parses a wire code.
    pub fn from_code(code: u32) -> Option<Self> {
        match code {
            1 => Some(MessageId::TimeSync),
            2 => Some(MessageId::DataSync),
            7 => Some(MessageId::AbilitySync),
            8 => Some(MessageId::QuerySync),
            9 => Some(MessageId::ControlSync),
            10 => Some(MessageId::RemoteExecute),
            _ => None,
        }
    }
}

/// Direction of a message within an exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageType {
    /// Opens an exchange or carries data.
    Request,
    /// Answers a request.
    Response,
    /// One-way notification.
    Notify,
}

/// Transport-level failure attached to a returned message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Feedback {
    /// The peer does not know the message id.
    UnknownMessage,
    /// The peer has no communicator for this store.
    CommunicatorNotFound,
}

/// Typed packet body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Payload {
    /// No body.
    Empty,
    /// Time sync request or response.
    TimeSync(TimeSyncPacket),
    /// Ability sync request.
    AbilityRequest(AbilitySyncRequest),
    /// Ability sync response or notify.
    AbilityAck(AbilitySyncAck),
    /// Data page or pull request.
    DataRequest(DataRequestPacket),
    /// Data ack.
    DataAck(DataAckPacket),
    /// Control command.
    ControlRequest(ControlRequestPacket),
    /// Control command ack.
    ControlAck(ControlAckPacket),
    /// Remote query request.
    RemoteRequest(RemoteExecutorRequestPacket),
    /// Remote query answer page.
    RemoteAck(RemoteExecutorAckPacket),
}

/// A framed message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Raw message id; see [`MessageId`].
    pub message_id: u32,
    /// Direction.
    pub message_type: MessageType,
    /// Exchange this message belongs to.
    pub session_id: u32,
    /// Order within the exchange.
    pub sequence_id: u32,
    /// Transport feedback, if the message bounced.
    pub feedback: Option<Feedback>,
    /// Body.
    pub payload: Payload,
}

impl Message {
    /// Creates a message.
    pub fn new(id: MessageId, message_type: MessageType, session_id: u32, payload: Payload) -> Self {
        Self {
            message_id: id.code(),
            message_type,
            session_id,
            sequence_id: 0,
            feedback: None,
            payload,
        }
    }

    /// Creates a request.
    pub fn request(id: MessageId, session_id: u32, payload: Payload) -> Self {
        Self::new(id, MessageType::Request, session_id, payload)
    }

    /// Creates a response.
    pub fn response(id: MessageId, session_id: u32, payload: Payload) -> Self {
        Self::new(id, MessageType::Response, session_id, payload)
    }

    /// Creates a notify.
    pub fn notify(id: MessageId, session_id: u32, payload: Payload) -> Self {
        Self::new(id, MessageType::Notify, session_id, payload)
    }

    /// Sets the sequence id.
    pub fn with_sequence(mut self, sequence_id: u32) -> Self {
        self.sequence_id = sequence_id;
        self
    }

    /// Typed message id, if known.
    pub fn id(&self) -> Option<MessageId> {
        MessageId::from_code(self.message_id)
    }

    /// Returns true if the id is inside the known range.
    pub fn is_known_id(&self) -> bool {
        self.id().is_some() && self.message_id < UNKNOWN_MESSAGE_CODE
    }

    /// Returns true for data and query sync messages.
    pub fn is_data_message(&self) -> bool {
        matches!(self.id(), Some(MessageId::DataSync | MessageId::QuerySync))
    }

    /// Encodes the frame.
    pub fn to_bytes(&self) -> ProtocolResult<Vec<u8>> {
        Ok(to_cbor(self)?)
    }

    /// Decodes a frame.
    pub fn from_bytes(bytes: &[u8]) -> ProtocolResult<Self> {
        Ok(from_cbor(bytes)?)
    }

    /// Time sync body.
    pub fn as_time_sync(&self) -> ProtocolResult<&TimeSyncPacket> {
        match &self.payload {
            Payload::TimeSync(p) => Ok(p),
            _ => Err(ProtocolError::UnexpectedPayload { expected: "time sync" }),
        }
    }

    /// Ability request body.
    pub fn as_ability_request(&self) -> ProtocolResult<&AbilitySyncRequest> {
        match &self.payload {
            Payload::AbilityRequest(p) => Ok(p),
            _ => Err(ProtocolError::UnexpectedPayload {
                expected: "ability request",
            }),
        }
    }

    /// Ability ack body.
    pub fn as_ability_ack(&self) -> ProtocolResult<&AbilitySyncAck> {
        match &self.payload {
            Payload::AbilityAck(p) => Ok(p),
            _ => Err(ProtocolError::UnexpectedPayload {
                expected: "ability ack",
            }),
        }
    }

    /// Data request body.
    pub fn as_data_request(&self) -> ProtocolResult<&DataRequestPacket> {
        match &self.payload {
            Payload::DataRequest(p) => Ok(p),
            _ => Err(ProtocolError::UnexpectedPayload {
                expected: "data request",
            }),
        }
    }

    /// Data ack body.
    pub fn as_data_ack(&self) -> ProtocolResult<&DataAckPacket> {
        match &self.payload {
            Payload::DataAck(p) => Ok(p),
            _ => Err(ProtocolError::UnexpectedPayload { expected: "data ack" }),
        }
    }

    /// Control request body.
    pub fn as_control_request(&self) -> ProtocolResult<&ControlRequestPacket> {
        match &self.payload {
            Payload::ControlRequest(p) => Ok(p),
            _ => Err(ProtocolError::UnexpectedPayload {
                expected: "control request",
            }),
        }
    }

    /// Control ack body.
    pub fn as_control_ack(&self) -> ProtocolResult<&ControlAckPacket> {
        match &self.payload {
            Payload::ControlAck(p) => Ok(p),
            _ => Err(ProtocolError::UnexpectedPayload {
                expected: "control ack",
            }),
        }
    }

    /// Remote query request body.
    pub fn as_remote_request(&self) -> ProtocolResult<&RemoteExecutorRequestPacket> {
        match &self.payload {
            Payload::RemoteRequest(p) => Ok(p),
            _ => Err(ProtocolError::UnexpectedPayload {
                expected: "remote request",
            }),
        }
    }

    /// Remote query ack body.
    pub fn as_remote_ack(&self) -> ProtocolResult<&RemoteExecutorAckPacket> {
        match &self.payload {
            Payload::RemoteAck(p) => Ok(p),
            _ => Err(ProtocolError::UnexpectedPayload {
                expected: "remote ack",
            }),
        }
    }
}
