//! The main gateway session: shard identity, IDENTIFY/RESUME, and
//! opcode/dispatch routing.
//!
//! One [`GatewaySession`] is one WebSocket connection to the gateway; large
//! bots run several in parallel, each owning `guild_id % shard_count` of the
//! traffic.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::Value;
use tracing::{debug, info, warn};
use url::Url;

use crate::error::GatewayError;
use crate::host::GatewayHost;
use crate::opcode::OpCode;
use crate::payload::{
    heartbeat_frame, Activity, ConnectionProperties, Identify, InboundFrame, OnlineStatus,
    OutboundFrame, PresenceUpdate, RequestGuildMembers, Resume, VoiceStateUpdate,
};
use crate::session::{SessionCore, SessionDriver, RECONNECT_CLOSE_CODE};
use crate::socket::SocketSink;
use crate::GATEWAY_VERSION;

/// Guild size above which members are withheld from GUILD_CREATE.
const LARGE_THRESHOLD: u8 = 250;

/// Resume parameters carried across session objects by the supervisor.
#[derive(Debug, Clone)]
pub struct ResumeInfo {
    pub session_id: String,
    pub sequence: Option<u64>,
}

/// A single shard's gateway session.
///
/// Create one per connection attempt; session objects are single-use and the
/// supervisor rebuilds them with [`ResumeInfo`] when continuity is wanted.
pub struct GatewaySession {
    core: SessionCore,
    host: Arc<dyn GatewayHost>,
    shard: (u16, u16),
    resume_on_open: bool,
    session_id: RwLock<Option<String>>,
    trace: RwLock<Vec<String>>,
}

impl GatewaySession {
    /// Build a session for `shard`, optionally primed to resume.
    pub fn new(
        host: Arc<dyn GatewayHost>,
        shard: (u16, u16),
        resume_from: Option<ResumeInfo>,
    ) -> Result<Arc<Self>, GatewayError> {
        let url = gateway_url(&host.gateway_url())?;
        let core = SessionCore::new(host.connector(), url);

        let resume_on_open = resume_from.is_some();
        let session_id = resume_from.map(|info| {
            if let Some(seq) = info.sequence {
                core.set_sequence(seq);
            }
            info.session_id
        });

        Ok(Arc::new(Self {
            core,
            host,
            shard,
            resume_on_open,
            session_id: RwLock::new(session_id),
            trace: RwLock::new(Vec::new()),
        }))
    }

    /// Open the session and run it to completion, tearing down on any exit
    /// path.
    pub async fn start(self: &Arc<Self>) -> Result<(), GatewayError> {
        let result = async {
            let resume = self.resume_on_open && self.session_id.read().is_some();
            self.core.open(self, resume).await?;
            self.core.run(self).await
        }
        .await;

        self.core.teardown().await;
        result
    }

    /// Idempotently signal the run loop to stop.
    pub fn close(&self) {
        self.core.close();
    }

    pub fn shard(&self) -> (u16, u16) {
        self.shard
    }

    pub fn session_id(&self) -> Option<String> {
        self.session_id.read().clone()
    }

    pub fn sequence(&self) -> Option<u64> {
        self.core.sequence()
    }

    /// Diagnostic trace from READY.
    pub fn trace(&self) -> Vec<String> {
        self.trace.read().clone()
    }

    pub fn latency(&self) -> Option<std::time::Duration> {
        self.core.latency()
    }

    pub fn average_latency(&self) -> Option<std::time::Duration> {
        self.core.average_latency()
    }

    /// State the supervisor needs to rebuild this session with resume.
    pub fn resume_info(&self) -> Option<ResumeInfo> {
        self.session_id.read().clone().map(|session_id| ResumeInfo {
            session_id,
            sequence: self.core.sequence(),
        })
    }

    /// Ask for member chunks of a guild (op 8).
    pub async fn request_member_chunks(
        &self,
        guild_id: u64,
        query: &str,
        limit: u32,
        user_ids: Option<Vec<u64>>,
        presences: bool,
        nonce: Option<&str>,
    ) -> Result<(), GatewayError> {
        let request = RequestGuildMembers {
            guild_id,
            query,
            limit,
            presences,
            user_ids,
            nonce,
        };
        self.core
            .send_json(&OutboundFrame::new(OpCode::RequestGuildMembers, request), false)
            .await
    }

    /// Update the bot's presence (op 3).
    pub async fn change_presence(
        &self,
        activity: Option<Activity>,
        status: OnlineStatus,
        since: Option<u64>,
    ) -> Result<(), GatewayError> {
        let presence = PresenceUpdate {
            since: Some(since.unwrap_or_else(unix_millis)),
            activities: activity.into_iter().collect(),
            status,
            afk: false,
        };
        self.core
            .send_json(&OutboundFrame::new(OpCode::PresenceUpdate, presence), false)
            .await
    }

    /// Join, move, or leave a voice channel (op 4).
    pub async fn update_voice_state(
        &self,
        guild_id: u64,
        channel_id: Option<u64>,
        self_mute: bool,
        self_deaf: bool,
    ) -> Result<(), GatewayError> {
        let update = VoiceStateUpdate {
            guild_id,
            channel_id,
            self_mute,
            self_deaf,
        };
        self.core
            .send_json(&OutboundFrame::new(OpCode::VoiceStateUpdate, update), false)
            .await
    }

    /// Route one dispatch by event name. Runs on its own task.
    async fn dispatch_event(&self, data: Value, seq: Option<u64>, event: &str) {
        match event {
            "READY" => {
                let trace = data
                    .get("_trace")
                    .and_then(Value::as_array)
                    .map(|values| {
                        values
                            .iter()
                            .filter_map(Value::as_str)
                            .map(str::to_owned)
                            .collect()
                    })
                    .unwrap_or_default();
                *self.trace.write() = trace;

                if let Some(seq) = seq {
                    self.core.set_sequence(seq);
                }
                *self.session_id.write() = data
                    .get("session_id")
                    .and_then(Value::as_str)
                    .map(str::to_owned);

                info!(shard_id = self.shard.0, "connected to the gateway");
                self.host.dispatch("websocket_ready", data);
            }

            "RESUMED" => {
                info!(shard_id = self.shard.0, "successfully resumed the connection");
                self.host.dispatch("resume", Value::Null);
            }

            "GUILD_MEMBERS_CHUNK" => {
                let guild_id = data.get("guild_id").and_then(snowflake);
                match guild_id.and_then(|id| self.host.guild_chunk_sink(id)) {
                    Some(sink) => {
                        tokio::spawn(async move {
                            sink.process_member_chunk(data).await;
                        });
                    }
                    None => warn!(shard_id = self.shard.0, "member chunk for an unknown guild"),
                }
            }

            _ => {
                let raw_name = format!("raw_{}", event.to_lowercase());
                match self.host.processor(&raw_name) {
                    Some(processor) => {
                        tokio::spawn(processor(data.clone(), raw_name.clone()));
                    }
                    None => debug!(event = %raw_name, "no processor registered"),
                }

                self.host.dispatch("raw_socket_receive", data.clone());
                self.host.dispatch(&raw_name, data);
            }
        }
    }
}

#[async_trait]
impl SessionDriver for GatewaySession {
    fn core(&self) -> &SessionCore {
        &self.core
    }

    async fn identify(&self, sink: &mut Box<dyn SocketSink>) -> Result<(), GatewayError> {
        let token = self.host.token();
        let identify = Identify {
            token: &token,
            intents: self.host.intents(),
            shard: [self.shard.0, self.shard.1],
            large_threshold: LARGE_THRESHOLD,
            properties: ConnectionProperties::default(),
            presence: self.host.presence(),
            compress: true,
        };
        let frame = OutboundFrame::new(OpCode::Identify, identify);
        sink.send_text(&serde_json::to_string(&frame)?).await?;

        debug!(
            shard_id = self.shard.0,
            intents = self.host.intents().bits(),
            "identified to the gateway"
        );
        Ok(())
    }

    async fn resume(&self, sink: &mut Box<dyn SocketSink>) -> Result<(), GatewayError> {
        let token = self.host.token();
        let session_id = self
            .session_id
            .read()
            .clone()
            .ok_or(GatewayError::InvalidState("resume without a session id"))?;
        let resume = Resume {
            token: &token,
            session_id: &session_id,
            seq: self.core.sequence(),
        };
        let frame = OutboundFrame::new(OpCode::Resume, resume);
        sink.send_text(&serde_json::to_string(&frame)?).await?;

        debug!(shard_id = self.shard.0, session_id = %session_id, "attempting to resume");
        Ok(())
    }

    async fn send_heartbeat(&self) -> Result<(), GatewayError> {
        self.core
            .send_text(&heartbeat_frame(self.core.sequence()), true)
            .await?;
        debug!(shard_id = self.shard.0, seq = self.core.sequence(), "heartbeat sent");
        Ok(())
    }

    async fn handle_frame(self: Arc<Self>, frame: InboundFrame) -> Result<(), GatewayError> {
        match OpCode::from_u8(frame.op) {
            Some(OpCode::Dispatch) => {
                if let Some(event) = frame.t {
                    let session = Arc::clone(&self);
                    let data = frame.d;
                    let seq = frame.s;
                    tokio::spawn(async move {
                        session.dispatch_event(data, seq, &event).await;
                    });
                }
            }

            Some(OpCode::Heartbeat) => {
                debug!(shard_id = self.shard.0, "gateway requested an immediate heartbeat");
                self.send_heartbeat().await?;
            }

            Some(OpCode::Reconnect) => {
                info!(shard_id = self.shard.0, "gateway requested a reconnect");
                self.core
                    .reconnect(self.as_ref(), true, RECONNECT_CLOSE_CODE)
                    .await?;
            }

            Some(OpCode::InvalidSession) => {
                let resumable = frame.d.as_bool().unwrap_or(false);
                warn!(shard_id = self.shard.0, resumable, "gateway invalidated the session");
                if !resumable {
                    *self.session_id.write() = None;
                    self.core.clear_sequence();
                }
                self.core
                    .reconnect(self.as_ref(), resumable, RECONNECT_CLOSE_CODE)
                    .await?;
            }

            Some(OpCode::HeartbeatAck) => self.core.note_heartbeat_ack(),

            _ => debug!(shard_id = self.shard.0, op = frame.op, "unhandled gateway opcode"),
        }

        Ok(())
    }
}

/// Read a snowflake that may arrive as a string or a bare integer.
fn snowflake(value: &Value) -> Option<u64> {
    value
        .as_u64()
        .or_else(|| value.as_str().and_then(|s| s.parse().ok()))
}

fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as u64)
        .unwrap_or(0)
}

/// Append the protocol query parameters to the embedder-supplied URL.
fn gateway_url(base: &str) -> Result<String, GatewayError> {
    let mut url = Url::parse(base)?;
    url.query_pairs_mut()
        .append_pair("v", &GATEWAY_VERSION.to_string())
        .append_pair("encoding", "json")
        .append_pair("compress", "zlib-stream");
    Ok(url.to_string())
}
