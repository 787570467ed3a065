//! Taipan Voice - Discord voice gateway client
#![deny(unsafe_code)]
//!
//! Everything between a `VOICE_SERVER_UPDATE` and audible audio: the voice
//! gateway handshake, UDP IP discovery, RTP packet framing, XSalsa20-
//! Poly1305 payload encryption, and the opus encoder binding.
//!
//! # Architecture
//!
//! - [`VoiceSession`] - the voice gateway state machine, built on the
//!   session core from `taipan-gateway`.
//! - [`VoiceTransport`] - the UDP socket, RTP counters, and IP discovery.
//! - [`Encryptor`] - payload encryption in the negotiated mode.
//! - [`Encoder`] - PCM to opus via the native libopus.
//!
//! # Example
//!
//! ```ignore
//! use taipan_voice::{Encoder, VoiceSession};
//!
//! // session_id from VOICE_STATE_UPDATE; endpoint/token from
//! // VOICE_SERVER_UPDATE.
//! let session = VoiceSession::new(connector, user_id, session_id, &endpoint, token, guild_id);
//! tokio::spawn({
//!     let session = session.clone();
//!     async move { session.start().await }
//! });
//!
//! session.wait_until_ready().await;
//! session.speaking(true).await?;
//!
//! let mut encoder = Encoder::new()?;
//! session.send_packet(&pcm_frame, &mut encoder, true).await?;
//! ```

pub mod crypto;
pub mod error;
pub mod gateway;
pub mod opcode;
pub mod opus;
pub mod payload;
pub mod udp;

// Re-exports
pub use crypto::{
    negotiate_modes, Encryptor, KEY_SIZE, NONCE_SIZE, RTP_HEADER_SIZE, SUPPORTED_MODES,
};
pub use error::{VoiceCloseCode, VoiceError};
pub use gateway::{VoiceSession, VOICE_GATEWAY_VERSION};
pub use opcode::VoiceOpCode;
pub use opus::Encoder;
pub use payload::{SelectProtocol, SessionDescription, Speaking, VoiceFrame, VoiceReady};
pub use udp::{rtp_header, VoiceTransport};
