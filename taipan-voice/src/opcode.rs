//! Voice gateway opcodes.

use serde_repr::Serialize_repr;

/// Voice gateway operation codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize_repr)]
#[repr(u8)]
pub enum VoiceOpCode {
    /// Begin a voice session. Send.
    Identify = 0,
    /// Select the voice protocol. Send.
    SelectProtocol = 1,
    /// Response to Identify: SSRC, address, and offered modes. Receive.
    Ready = 2,
    /// Keep the connection alive. Send.
    Heartbeat = 3,
    /// Response to SelectProtocol: the session key. Receive.
    SessionDescription = 4,
    /// Indicate speaking state. Send/Receive.
    Speaking = 5,
    /// Acknowledgment of a heartbeat. Receive.
    HeartbeatAck = 6,
    /// Resume a voice session. Send.
    Resume = 7,
    /// Initial connection info. Receive.
    Hello = 8,
    /// Resume acknowledged. Receive.
    Resumed = 9,
    /// A client disconnected from the channel. Receive.
    ClientDisconnect = 13,
}

impl VoiceOpCode {
    /// Classify a raw opcode.
    pub const fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(VoiceOpCode::Identify),
            1 => Some(VoiceOpCode::SelectProtocol),
            2 => Some(VoiceOpCode::Ready),
            3 => Some(VoiceOpCode::Heartbeat),
            4 => Some(VoiceOpCode::SessionDescription),
            5 => Some(VoiceOpCode::Speaking),
            6 => Some(VoiceOpCode::HeartbeatAck),
            7 => Some(VoiceOpCode::Resume),
            8 => Some(VoiceOpCode::Hello),
            9 => Some(VoiceOpCode::Resumed),
            13 => Some(VoiceOpCode::ClientDisconnect),
            _ => None,
        }
    }
}
