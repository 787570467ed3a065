//! Discord gateway opcodes.

use serde_repr::Serialize_repr;

/// Gateway operation codes.
///
/// Inbound frames carry their opcode as a raw integer so unknown codes can be
/// logged and ignored; use [`OpCode::from_u8`] to classify them.
///
/// See: <https://discord.com/developers/docs/topics/opcodes-and-status-codes#gateway-gateway-opcodes>
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize_repr)]
#[repr(u8)]
pub enum OpCode {
    /// An event was dispatched. Receive.
    Dispatch = 0,

    /// Keep the connection alive. Send/Receive.
    Heartbeat = 1,

    /// Start a new session. Send.
    Identify = 2,

    /// Update the client's presence. Send.
    PresenceUpdate = 3,

    /// Join, leave, or move between voice channels. Send.
    VoiceStateUpdate = 4,

    /// Resume a previous session. Send.
    Resume = 6,

    /// Server requested a reconnect. Receive.
    Reconnect = 7,

    /// Request guild member chunks. Send.
    RequestGuildMembers = 8,

    /// Session has been invalidated. Receive.
    InvalidSession = 9,

    /// Sent after connecting, contains the heartbeat interval. Receive.
    Hello = 10,

    /// Acknowledgment of a heartbeat. Receive.
    HeartbeatAck = 11,
}

impl OpCode {
    /// Classify a raw opcode.
    pub const fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(OpCode::Dispatch),
            1 => Some(OpCode::Heartbeat),
            2 => Some(OpCode::Identify),
            3 => Some(OpCode::PresenceUpdate),
            4 => Some(OpCode::VoiceStateUpdate),
            6 => Some(OpCode::Resume),
            7 => Some(OpCode::Reconnect),
            8 => Some(OpCode::RequestGuildMembers),
            9 => Some(OpCode::InvalidSession),
            10 => Some(OpCode::Hello),
            11 => Some(OpCode::HeartbeatAck),
            _ => None,
        }
    }
}
