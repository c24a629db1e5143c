//! Packet envelope and reserved control identifiers.
//!
//! A [`Packet`] is the unit of exchange between the two ends of a channel:
//! a 32-bit type identifier plus an opaque byte payload. The binary form is
//! a tag-numbered message (protobuf wire format via prost), so fields with
//! tags beyond the two defined here are skipped on decode rather than
//! rejected — both ends can evolve independently.

use prost::Message;

use crate::error::Result;

/// Reserved control `type_id` values.
///
/// These are wire-visible constants and must match on both ends. User
/// packets must use identifiers below [`control::RESERVED_BASE`].
pub mod control {
    /// Lowest reserved identifier; everything at or above is control traffic.
    pub const RESERVED_BASE: u32 = 0xFFFF_FF00;

    /// Peer asks for a session-key renegotiation.
    pub const HANDSHAKE_REQUEST: u32 = 0xFFFF_FF01;
    /// Peer is about to drive a full handshake.
    pub const INIT_HANDSHAKE: u32 = 0xFFFF_FF02;
    /// Peer initiates (or echoes) a partial handshake.
    pub const INIT_PARTIAL_HANDSHAKE: u32 = 0xFFFF_FF03;
    /// Confirms installation of the partial-handshake key.
    pub const END_PARTIAL_HANDSHAKE: u32 = 0xFFFF_FF04;
    /// Received for compatibility; logged and dropped.
    pub const CANCEL_HANDSHAKE: u32 = 0xFFFF_FF05;
    /// Peer is closing the connection gracefully.
    pub const DISCONNECT_NOTIFICATION: u32 = 0xFFFF_FF06;
    /// Carries the peer's 16-byte connection id.
    pub const CONNECTION_ID_EXCHANGE: u32 = 0xFFFF_FF07;

    /// Whether a `type_id` belongs to the reserved control range.
    pub fn is_reserved(type_id: u32) -> bool {
        type_id >= RESERVED_BASE
    }
}

/// The plaintext envelope carried inside every frame.
#[derive(Clone, PartialEq, Message)]
pub struct Packet {
    /// Discriminator for dispatch; reserved values are listed in [`control`].
    #[prost(uint32, tag = "1")]
    pub type_id: u32,

    /// Opaque payload bytes.
    #[prost(bytes = "vec", tag = "2")]
    pub data: Vec<u8>,
}

impl Packet {
    /// Create a packet with a payload.
    pub fn new(type_id: u32, data: Vec<u8>) -> Self {
        Self { type_id, data }
    }

    /// Create a control packet with an empty payload.
    pub fn control(type_id: u32) -> Self {
        Self {
            type_id,
            data: Vec::new(),
        }
    }

    /// Serialize to the canonical binary form.
    pub fn to_bytes(&self) -> Vec<u8> {
        self.encode_to_vec()
    }

    /// Deserialize from the canonical binary form.
    ///
    /// # Errors
    /// Returns `ChannelError::PacketDecode` when the bytes are not a valid
    /// message. Unknown fields after `type_id` and `data` are ignored.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Ok(Self::decode(bytes)?)
    }

    /// Whether this packet is channel control traffic.
    pub fn is_control(&self) -> bool {
        control::is_reserved(self.type_id)
    }
}
