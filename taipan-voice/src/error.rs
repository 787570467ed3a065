//! Voice error types.

use taipan_gateway::GatewayError;
use thiserror::Error;

/// Errors from the voice session, its transport, and its codecs.
#[derive(Debug, Error)]
pub enum VoiceError {
    /// A failure in the shared session core.
    #[error(transparent)]
    Gateway(#[from] GatewayError),

    /// The native opus library reported an error.
    #[error("opus codec error: {0}")]
    Codec(#[from] audiopus::error::Error),

    /// A PCM buffer did not match the encoder's frame size.
    #[error("pcm frame of {got} bytes does not match the encoder frame size of {expected}")]
    BadPcmFrame { expected: usize, got: usize },

    /// An encryption mode we do not implement was requested.
    #[error("unsupported encryption mode requested: {0}")]
    UnsupportedMode(String),

    /// Sealing a payload failed.
    #[error("voice payload encryption failed: {0}")]
    Encryption(String),

    /// The IP discovery exchange failed.
    #[error("ip discovery failed: {0}")]
    IpDiscovery(String),

    /// Media was sent before the transport and session key exist.
    #[error("the voice transport is not established")]
    NotConnected,

    /// I/O error on the UDP socket.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<VoiceError> for GatewayError {
    fn from(err: VoiceError) -> Self {
        match err {
            VoiceError::Gateway(inner) => inner,
            other => GatewayError::Voice(other.to_string()),
        }
    }
}

/// Discord voice close codes.
///
/// See: <https://discord.com/developers/docs/topics/opcodes-and-status-codes#voice-voice-close-event-codes>
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum VoiceCloseCode {
    UnknownOpcode = 4001,
    FailedToDecodePayload = 4002,
    NotAuthenticated = 4003,
    AuthenticationFailed = 4004,
    AlreadyAuthenticated = 4005,
    SessionNoLongerValid = 4006,
    SessionTimeout = 4009,
    ServerNotFound = 4011,
    UnknownProtocol = 4012,
    Disconnected = 4014,
    VoiceServerCrashed = 4015,
    UnknownEncryptionMode = 4016,
}

impl VoiceCloseCode {
    /// Try to parse a raw close code.
    pub fn from_code(code: u16) -> Option<Self> {
        match code {
            4001 => Some(VoiceCloseCode::UnknownOpcode),
            4002 => Some(VoiceCloseCode::FailedToDecodePayload),
            4003 => Some(VoiceCloseCode::NotAuthenticated),
            4004 => Some(VoiceCloseCode::AuthenticationFailed),
            4005 => Some(VoiceCloseCode::AlreadyAuthenticated),
            4006 => Some(VoiceCloseCode::SessionNoLongerValid),
            4009 => Some(VoiceCloseCode::SessionTimeout),
            4011 => Some(VoiceCloseCode::ServerNotFound),
            4012 => Some(VoiceCloseCode::UnknownProtocol),
            4014 => Some(VoiceCloseCode::Disconnected),
            4015 => Some(VoiceCloseCode::VoiceServerCrashed),
            4016 => Some(VoiceCloseCode::UnknownEncryptionMode),
            _ => None,
        }
    }

    pub const fn description(self) -> &'static str {
        match self {
            VoiceCloseCode::UnknownOpcode => "Unknown OpCode",
            VoiceCloseCode::FailedToDecodePayload => "Decode Error",
            VoiceCloseCode::NotAuthenticated => "Not Authenticated",
            VoiceCloseCode::AuthenticationFailed => "Authentication Failed",
            VoiceCloseCode::AlreadyAuthenticated => "Already Authenticated",
            VoiceCloseCode::SessionNoLongerValid => "Session No Longer Valid",
            VoiceCloseCode::SessionTimeout => "Session Timed Out",
            VoiceCloseCode::ServerNotFound => "Server Not Found",
            VoiceCloseCode::UnknownProtocol => "Unknown Protocol",
            VoiceCloseCode::Disconnected => "Disconnected",
            VoiceCloseCode::VoiceServerCrashed => "Voice Server Crashed",
            VoiceCloseCode::UnknownEncryptionMode => "Unknown Encryption Mode",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn voice_close_codes_round_trip() {
        for code in [4006, 4014, 4015, 4016] {
            let parsed = VoiceCloseCode::from_code(code).expect("known voice close code");
            assert_eq!(parsed as u16, code);
        }
        assert!(VoiceCloseCode::from_code(4013).is_none());
    }

    #[test]
    fn voice_errors_bridge_into_gateway_errors() {
        let err: GatewayError = VoiceError::NotConnected.into();
        assert!(matches!(err, GatewayError::Voice(_)));

        let err: GatewayError = VoiceError::Gateway(GatewayError::GatewayNotFound).into();
        assert!(matches!(err, GatewayError::GatewayNotFound));
    }
}
