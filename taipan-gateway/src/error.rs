//! Gateway error types using thiserror.
//!
//! Everything a session or supervisor can fail with is represented by
//! [`GatewayError`]; the supervisor is the only place that decides which of
//! these are fatal and which are retried.

use thiserror::Error;

/// Errors that can occur while driving a gateway connection.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// WebSocket connection or protocol error.
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// Failed to serialize an outbound payload.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O error from the transport.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// URL parsing error.
    #[error("URL parse error: {0}")]
    UrlParse(#[from] url::ParseError),

    /// The main gateway WebSocket was closed by the peer.
    #[error("the websocket closed with code {code}")]
    SocketClosed {
        /// WebSocket close code.
        code: u16,
    },

    /// The voice gateway WebSocket was closed by the peer.
    #[error("the voice websocket closed with code {code}")]
    VoiceSocketClosed {
        /// WebSocket close code.
        code: u16,
    },

    /// The session asked its supervisor for a restart.
    #[error("websocket restart requested, resume: {resume}")]
    Restart {
        /// Whether the next session should attempt to resume.
        resume: bool,
    },

    /// No gateway endpoint could be obtained.
    #[error("the gateway could not be found")]
    GatewayNotFound,

    /// The bot has too many guilds for a single shard.
    #[error("your bot is too large, you must use shards")]
    ShardingRequired,

    /// Discord rejected the intents bitmask.
    #[error("invalid intents have been passed")]
    InvalidIntents,

    /// Privileged intents were requested without approval.
    #[error("you have requested privileged intents that have not been enabled or approved")]
    DisallowedIntents,

    /// An operation was attempted in a state that cannot support it, such as
    /// sending before a connection exists or reusing a spent session.
    #[error("invalid state: {0}")]
    InvalidState(&'static str),

    /// A bounded wait elapsed.
    #[error("timed out waiting for {0}")]
    Timeout(&'static str),

    /// A failure inside the voice session layer.
    #[error("voice session error: {0}")]
    Voice(String),
}

/// Discord gateway close codes.
///
/// See: <https://discord.com/developers/docs/topics/opcodes-and-status-codes#gateway-gateway-close-event-codes>
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum CloseCode {
    /// Clean shutdown.
    NormalClosure = 1000,
    /// Unknown error occurred.
    UnknownError = 4000,
    /// Invalid opcode sent.
    UnknownOpcode = 4001,
    /// Invalid payload (decode error).
    DecodeError = 4002,
    /// Payload sent before identifying.
    NotAuthenticated = 4003,
    /// Invalid token.
    AuthenticationFailed = 4004,
    /// Already authenticated.
    AlreadyAuthenticated = 4005,
    /// Invalid sequence number for resume.
    InvalidSeq = 4007,
    /// Payloads were sent too quickly.
    RateLimited = 4008,
    /// Session timed out.
    SessionTimedOut = 4009,
    /// Invalid shard configuration.
    InvalidShard = 4010,
    /// Too many guilds; sharding is required.
    ShardingRequired = 4011,
    /// Invalid API version.
    InvalidApiVersion = 4012,
    /// Invalid intents.
    InvalidIntents = 4013,
    /// Privileged intent not enabled for this bot.
    DisallowedIntents = 4014,
}

impl CloseCode {
    /// Try to convert a raw close code to this enum.
    pub fn from_code(code: u16) -> Option<Self> {
        match code {
            1000 => Some(CloseCode::NormalClosure),
            4000 => Some(CloseCode::UnknownError),
            4001 => Some(CloseCode::UnknownOpcode),
            4002 => Some(CloseCode::DecodeError),
            4003 => Some(CloseCode::NotAuthenticated),
            4004 => Some(CloseCode::AuthenticationFailed),
            4005 => Some(CloseCode::AlreadyAuthenticated),
            4007 => Some(CloseCode::InvalidSeq),
            4008 => Some(CloseCode::RateLimited),
            4009 => Some(CloseCode::SessionTimedOut),
            4010 => Some(CloseCode::InvalidShard),
            4011 => Some(CloseCode::ShardingRequired),
            4012 => Some(CloseCode::InvalidApiVersion),
            4013 => Some(CloseCode::InvalidIntents),
            4014 => Some(CloseCode::DisallowedIntents),
            _ => None,
        }
    }

    /// Human-readable name, matching the documented taxonomy.
    pub const fn description(self) -> &'static str {
        match self {
            CloseCode::NormalClosure => "Normal Closure",
            CloseCode::UnknownError => "Unknown Error",
            CloseCode::UnknownOpcode => "Unknown OpCode",
            CloseCode::DecodeError => "Decode Error",
            CloseCode::NotAuthenticated => "Not Authenticated",
            CloseCode::AuthenticationFailed => "Authentication Failed",
            CloseCode::AlreadyAuthenticated => "Already Authenticated",
            CloseCode::InvalidSeq => "Invalid seq",
            CloseCode::RateLimited => "Rate limited",
            CloseCode::SessionTimedOut => "Session Timed Out",
            CloseCode::InvalidShard => "Invalid Shard",
            CloseCode::ShardingRequired => "Sharding Required",
            CloseCode::InvalidApiVersion => "Invalid API Version",
            CloseCode::InvalidIntents => "Invalid Intents",
            CloseCode::DisallowedIntents => "Disallowed Intents",
        }
    }

    /// Returns whether a new connection may be attempted after this code.
    pub const fn can_reconnect(self) -> bool {
        !matches!(
            self,
            CloseCode::AuthenticationFailed
                | CloseCode::InvalidShard
                | CloseCode::ShardingRequired
                | CloseCode::InvalidApiVersion
                | CloseCode::InvalidIntents
                | CloseCode::DisallowedIntents
        )
    }
}
