//! Taipan Gateway - Discord Gateway WebSocket connection core
#![deny(unsafe_code)]
//!
//! This crate implements the long-lived duplex state machine behind a
//! Discord bot: sharded gateway sessions with identify/resume, heartbeat
//! scheduling with zombie detection, zlib-stream frame reassembly, outbound
//! rate limiting, and a supervisor that maps close codes to fatal or
//! retryable outcomes.
//!
//! # Architecture
//!
//! - [`SessionCore`] - the reusable connect/receive/reconnect/heartbeat
//!   machinery shared with the voice gateway.
//! - [`GatewaySession`] - one shard's session: IDENTIFY/RESUME payloads and
//!   opcode/dispatch routing.
//! - [`ShardSupervisor`] - the outer loop that rebuilds sessions and decides
//!   between clean, fatal, and retried exits.
//!
//! The object model, REST client, and caches live with the embedder and are
//! injected through [`GatewayHost`].
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use taipan_gateway::ShardSupervisor;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let host = Arc::new(MyHost::new(token));
//!     ShardSupervisor::new(host, (0, 1)).run().await?;
//!     Ok(())
//! }
//! ```

pub mod compression;
pub mod error;
pub mod host;
pub mod intents;
pub mod limiter;
pub mod opcode;
pub mod payload;
pub mod session;
pub mod shard;
pub mod signal;
pub mod socket;
pub mod supervisor;
#[cfg(any(test, feature = "testing"))]
pub mod testing;

// Public re-exports
pub use compression::StreamInflater;
pub use error::{CloseCode, GatewayError};
pub use host::{EventProcessor, GatewayHost, MemberChunkSink, ProcessorRegistry};
pub use intents::Intents;
pub use limiter::SendLimiter;
pub use opcode::OpCode;
pub use payload::{Activity, InboundFrame, OnlineStatus, OutboundFrame, PresenceUpdate};
pub use session::{CloseAction, SessionCore, SessionDriver, SessionPhase, RECONNECT_CLOSE_CODE};
pub use shard::{GatewaySession, ResumeInfo};
pub use signal::Signal;
pub use socket::{
    SocketConnector, SocketMessage, SocketSink, SocketStream, TungsteniteConnector,
};
pub use supervisor::ShardSupervisor;

/// Gateway API version spoken by this crate.
pub const GATEWAY_VERSION: u8 = 10;

/// Default gateway URL, normally replaced by the `/gateway/bot` response.
pub const DEFAULT_GATEWAY_URL: &str = "wss://gateway.discord.gg";
