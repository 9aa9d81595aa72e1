//! Ability sync packets.

use crate::ack::AckCode;
use crate::capability::{CapabilitySet, CompressAlgorithm};
use crate::security::SecurityOption;
use serde::{Deserialize, Serialize};

/// Software version of peers that predate ability sync.
pub const SOFTWARE_VERSION_EARLIEST: u32 = 101;
/// Last version without sliding-window data sync.
pub const SOFTWARE_VERSION_RELEASE_2_0: u32 = 102;
/// Version of this build.
pub const SOFTWARE_VERSION_CURRENT: u32 = 106;

/// Opening packet of the handshake.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct AbilitySyncRequest {
    /// Wire protocol version.
    pub protocol_version: u32,
    /// Software version of the sender.
    pub software_version: u32,
    /// Declared capabilities.
    pub capabilities: CapabilitySet,
    /// Security option of the sender's store.
    pub security: SecurityOption,
    /// Supported compression algorithms.
    pub compress_algorithms: Vec<CompressAlgorithm>,
    /// Fingerprint of the sender's schema.
    pub schema_fingerprint: String,
}

/// Progress marker of an ability ack.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AbilityAckCode {
    /// Response to a request.
    Accepted,
    /// First notify: the requester accepted the response.
    CheckSuccess,
    /// Second notify: the responder acknowledged.
    LastNotify,
    /// The handshake failed.
    Rejected(AckCode),
}

/// Response and notify packets of the handshake.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AbilitySyncAck {
    /// Progress marker.
    pub ack_code: AbilityAckCode,
    /// Wire protocol version.
    pub protocol_version: u32,
    /// Software version of the sender.
    pub software_version: u32,
    /// Declared capabilities.
    pub capabilities: CapabilitySet,
    /// Security option of the sender's store.
    pub security: SecurityOption,
    /// Chosen compression algorithm.
    pub compress_algorithm: CompressAlgorithm,
    /// Fingerprint of the sender's schema.
    pub schema_fingerprint: String,
}

impl AbilitySyncAck {
    /// Builds an ack with empty negotiation fields.
    pub fn simple(ack_code: AbilityAckCode, software_version: u32) -> Self {
        Self {
            ack_code,
            protocol_version: 0,
            software_version,
            capabilities: CapabilitySet::new(),
            security: SecurityOption::default(),
            compress_algorithm: CompressAlgorithm::None,
            schema_fingerprint: String::new(),
        }
    }
}
