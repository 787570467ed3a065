//! The voice gateway session.
//!
//! Drives the voice handshake over the shared session core: IDENTIFY, voice
//! READY, UDP IP discovery, SELECT_PROTOCOL, and finally the session key
//! from SESSION_DESCRIPTION. Once ready, media goes out through
//! [`VoiceSession::send_packet`].

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use rand::Rng;
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, error, info};

use taipan_gateway::error::GatewayError;
use taipan_gateway::payload::InboundFrame;
use taipan_gateway::session::{CloseAction, SessionCore, SessionDriver};
use taipan_gateway::signal::Signal;
use taipan_gateway::socket::{SocketConnector, SocketSink};

use crate::crypto::{negotiate_modes, Encryptor};
use crate::error::{VoiceCloseCode, VoiceError};
use crate::opcode::VoiceOpCode;
use crate::opus::Encoder;
use crate::payload::{
    SelectProtocol, SelectProtocolData, SessionDescription, Speaking, VoiceFrame, VoiceIdentify,
    VoiceReady, VoiceResume,
};
use crate::udp::VoiceTransport;

/// Voice gateway protocol version.
pub const VOICE_GATEWAY_VERSION: u8 = 4;

/// How long a non-resuming reconnect waits for new server information
/// before the voice session is terminated.
const SERVER_UPDATE_TIMEOUT: Duration = Duration::from_secs(5);

/// One voice connection's gateway session.
///
/// Constructed from the `VOICE_STATE_UPDATE` session id and the
/// `VOICE_SERVER_UPDATE` endpoint/token for a guild.
pub struct VoiceSession {
    core: SessionCore,
    user_id: u64,
    session_id: String,
    guild_id: RwLock<String>,
    token: RwLock<String>,

    ssrc: RwLock<Option<u32>>,
    /// Voice server media address from READY.
    server_addr: RwLock<Option<(String, u16)>>,
    /// Externally visible address from IP discovery.
    external_addr: RwLock<Option<(String, u16)>>,
    /// Offered modes we also support, in server order.
    modes: RwLock<Vec<String>>,
    encryptor: RwLock<Option<Encryptor>>,
    transport: Mutex<Option<VoiceTransport>>,

    /// Set once SESSION_DESCRIPTION delivers the session key.
    ready: Signal,
    /// Set by [`VoiceSession::set_new_voice_server`] during a migration.
    server_update: Signal,
}

impl VoiceSession {
    pub fn new(
        connector: Arc<dyn SocketConnector>,
        user_id: u64,
        session_id: impl Into<String>,
        endpoint: &str,
        token: impl Into<String>,
        guild_id: impl Into<String>,
    ) -> Arc<Self> {
        let core = SessionCore::new(connector, voice_ws_url(endpoint));

        Arc::new(Self {
            core,
            user_id,
            session_id: session_id.into(),
            guild_id: RwLock::new(guild_id.into()),
            token: RwLock::new(token.into()),
            ssrc: RwLock::new(None),
            server_addr: RwLock::new(None),
            external_addr: RwLock::new(None),
            modes: RwLock::new(Vec::new()),
            encryptor: RwLock::new(None),
            transport: Mutex::new(None),
            ready: Signal::new(false),
            server_update: Signal::new(false),
        })
    }

    /// Open the session and run it to completion, tearing down on any exit
    /// path.
    pub async fn start(self: &Arc<Self>) -> Result<(), GatewayError> {
        let result = async {
            self.core.open(self, false).await?;
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

    /// Wait until media can be sent: the session key has arrived.
    pub async fn wait_until_ready(&self) {
        self.ready.wait().await;
    }

    pub fn is_ready(&self) -> bool {
        self.ready.is_set()
    }

    pub fn ssrc(&self) -> Option<u32> {
        *self.ssrc.read()
    }

    /// Voice server media address from READY.
    pub fn server_addr(&self) -> Option<(String, u16)> {
        self.server_addr.read().clone()
    }

    /// Externally visible address from IP discovery.
    pub fn external_addr(&self) -> Option<(String, u16)> {
        self.external_addr.read().clone()
    }

    pub fn latency(&self) -> Option<Duration> {
        self.core.latency()
    }

    /// Handle a `VOICE_SERVER_UPDATE`: adopt the new endpoint and wake any
    /// reconnect waiting on it.
    pub fn set_new_voice_server(
        &self,
        endpoint: &str,
        token: impl Into<String>,
        guild_id: impl Into<String>,
    ) {
        self.core.set_ws_url(voice_ws_url(endpoint));
        *self.token.write() = token.into();
        *self.guild_id.write() = guild_id.into();
        self.server_update.set();
    }

    /// Advertise speaking state. Goes through the regular rate-limited send
    /// path like any other frame.
    pub async fn speaking(&self, is_speaking: bool) -> Result<(), GatewayError> {
        let ssrc = self
            .ssrc()
            .ok_or(GatewayError::InvalidState("speaking before voice READY"))?;
        let payload = Speaking {
            speaking: u8::from(is_speaking),
            delay: 0,
            ssrc,
        };
        self.core
            .send_json(&VoiceFrame::new(VoiceOpCode::Speaking, payload), false)
            .await
    }

    /// Encode (unless pre-encoded), encrypt, and transmit one media frame,
    /// advancing the RTP counters.
    pub async fn send_packet(
        &self,
        data: &[u8],
        encoder: &mut Encoder,
        needs_encode: bool,
    ) -> Result<(), VoiceError> {
        let payload = if needs_encode {
            encoder.encode(data)?
        } else {
            data.to_vec()
        };

        let mode = self
            .modes
            .read()
            .first()
            .cloned()
            .ok_or_else(|| VoiceError::UnsupportedMode("no mode negotiated".to_string()))?;
        let encryptor = self
            .encryptor
            .read()
            .clone()
            .ok_or(VoiceError::NotConnected)?;

        let mut transport = self.transport.lock().await;
        let transport = transport.as_mut().ok_or(VoiceError::NotConnected)?;
        transport
            .send_frame(&encryptor, &mode, &payload, encoder.samples_per_frame() as u32)
            .await
    }

    async fn handle_ready(&self, data: Value) -> Result<(), GatewayError> {
        let ready: VoiceReady = serde_json::from_value(data)?;
        debug!(
            ssrc = ready.ssrc,
            ip = %ready.ip,
            port = ready.port,
            "voice READY; establishing the media socket"
        );

        *self.ssrc.write() = Some(ready.ssrc);
        *self.server_addr.write() = Some((ready.ip.clone(), ready.port));

        let negotiated = negotiate_modes(&ready.modes);
        if negotiated.is_empty() {
            error!("no voice encryption modes shared with the server");
            return Err(VoiceError::UnsupportedMode("no mode shared with the server".to_string()).into());
        }
        *self.modes.write() = negotiated;

        self.establish_media_transport(&ready.ip, ready.port, ready.ssrc)
            .await
    }

    /// IP discovery followed by SELECT_PROTOCOL.
    async fn establish_media_transport(
        &self,
        ip: &str,
        port: u16,
        ssrc: u32,
    ) -> Result<(), GatewayError> {
        let transport = VoiceTransport::connect(ip, port, ssrc)
            .await
            .map_err(GatewayError::from)?;
        let (address, external_port) = transport
            .discover_external_addr()
            .await
            .map_err(GatewayError::from)?;

        *self.external_addr.write() = Some((address.clone(), external_port));
        *self.transport.lock().await = Some(transport);

        let mode = self
            .modes
            .read()
            .first()
            .cloned()
            .ok_or(GatewayError::InvalidState("protocol selection without a mode"))?;
        let payload = SelectProtocol {
            protocol: "udp",
            data: SelectProtocolData {
                address: &address,
                port: external_port,
                mode: &mode,
            },
        };
        self.core
            .send_json(&VoiceFrame::new(VoiceOpCode::SelectProtocol, payload), false)
            .await
    }
}

#[async_trait]
impl SessionDriver for VoiceSession {
    fn core(&self) -> &SessionCore {
        &self.core
    }

    async fn identify(&self, sink: &mut Box<dyn SocketSink>) -> Result<(), GatewayError> {
        let guild_id = self.guild_id.read().clone();
        let token = self.token.read().clone();
        let identify = VoiceIdentify {
            server_id: &guild_id,
            user_id: self.user_id.to_string(),
            session_id: &self.session_id,
            token: &token,
        };
        let frame = VoiceFrame::new(VoiceOpCode::Identify, identify);
        sink.send_text(&serde_json::to_string(&frame)?).await?;

        debug!(guild_id = %guild_id, "identified to the voice gateway");
        Ok(())
    }

    async fn resume(&self, sink: &mut Box<dyn SocketSink>) -> Result<(), GatewayError> {
        let guild_id = self.guild_id.read().clone();
        let token = self.token.read().clone();
        let resume = VoiceResume {
            server_id: &guild_id,
            session_id: &self.session_id,
            token: &token,
        };
        let frame = VoiceFrame::new(VoiceOpCode::Resume, resume);
        sink.send_text(&serde_json::to_string(&frame)?).await?;

        debug!(guild_id = %guild_id, "resuming the voice session");
        Ok(())
    }

    async fn send_heartbeat(&self) -> Result<(), GatewayError> {
        let nonce: f64 = rand::rng().random();
        self.core
            .send_json(&VoiceFrame::new(VoiceOpCode::Heartbeat, nonce), true)
            .await?;
        debug!("voice heartbeat sent");
        Ok(())
    }

    async fn handle_frame(self: Arc<Self>, frame: InboundFrame) -> Result<(), GatewayError> {
        match VoiceOpCode::from_u8(frame.op) {
            Some(VoiceOpCode::HeartbeatAck) => self.core.note_heartbeat_ack(),

            Some(VoiceOpCode::Ready) => self.handle_ready(frame.d).await?,

            Some(VoiceOpCode::SessionDescription) => {
                let description: SessionDescription = serde_json::from_value(frame.d)?;
                info!(mode = %description.mode, "voice connection established");
                let encryptor =
                    Encryptor::new(&description.secret_key).map_err(GatewayError::from)?;
                *self.encryptor.write() = Some(encryptor);
                self.ready.set();
            }

            Some(VoiceOpCode::Resumed) => info!("voice session resumed"),

            _ => debug!(op = frame.op, "unhandled voice opcode"),
        }

        Ok(())
    }

    fn close_action(&self, code: u16) -> CloseAction {
        if code == VoiceCloseCode::Disconnected as u16 {
            // Moved or kicked: the server wants a fresh identify against
            // whatever endpoint the next VOICE_SERVER_UPDATE names.
            self.ready.clear();
            CloseAction::Reconnect { resume: false }
        } else if code >= 4000 {
            CloseAction::Fatal
        } else {
            CloseAction::Reconnect { resume: code != 1000 }
        }
    }

    fn closed_error(&self, code: u16) -> GatewayError {
        GatewayError::VoiceSocketClosed { code }
    }

    async fn prepare_reconnect(&self, resume: bool) -> Result<bool, GatewayError> {
        if !resume {
            debug!("waiting for updated voice server information");
            if !self.server_update.wait_timeout(SERVER_UPDATE_TIMEOUT).await {
                debug!("no voice server update arrived; terminating the voice session");
                self.core.stop_heartbeater();
                self.core.close();
                return Ok(false);
            }
            self.server_update.clear();
        }
        Ok(true)
    }
}

fn voice_ws_url(endpoint: &str) -> String {
    let endpoint = endpoint.trim_start_matches("wss://");
    format!("wss://{endpoint}?v={VOICE_GATEWAY_VERSION}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use byteorder::{BigEndian, ByteOrder};
    use taipan_gateway::testing::ScriptedConnector;
    use tokio::net::UdpSocket;

    const VOICE_HELLO: &str = r#"{"op":8,"d":{"heartbeat_interval":13750.0}}"#;

    /// A scripted voice media server that answers one discovery request
    /// with a fixed external address.
    async fn spawn_discovery_server(external_ip: &str, external_port: u16) -> (u16, tokio::task::JoinHandle<()>) {
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let port = server.local_addr().unwrap().port();
        let ip = external_ip.to_string();

        let handle = tokio::spawn(async move {
            let mut request = [0u8; 70];
            let (len, peer) = server.recv_from(&mut request).await.unwrap();
            assert_eq!(len, 70);
            assert_eq!(BigEndian::read_u16(&request[0..2]), 1);
            assert_eq!(BigEndian::read_u16(&request[2..4]), 70);

            let mut reply = [0u8; 70];
            reply[..4].copy_from_slice(&request[..4]);
            reply[4..4 + ip.len()].copy_from_slice(ip.as_bytes());
            BigEndian::write_u16(&mut reply[68..], external_port);
            server.send_to(&reply, peer).await.unwrap();
        });

        (port, handle)
    }

    #[tokio::test]
    async fn voice_handshake_selects_the_first_negotiated_mode() {
        let (udp_port, discovery) = spawn_discovery_server("9.9.9.9", 60000).await;
        let (connector, peers) = ScriptedConnector::with_connections(1);
        let session = VoiceSession::new(connector, 7, "sess-1", "voice.test", "tok", "1234");

        peers[0].feed_text(VOICE_HELLO);
        let runner = {
            let session = Arc::clone(&session);
            tokio::spawn(async move { session.start().await })
        };

        let identify = peers[0].next_json().await;
        assert_eq!(identify["op"], 0);
        assert_eq!(identify["d"]["server_id"], "1234");
        assert_eq!(identify["d"]["user_id"], "7");
        assert_eq!(identify["d"]["session_id"], "sess-1");
        assert_eq!(identify["d"]["token"], "tok");

        peers[0].feed_text(&format!(
            r#"{{"op":2,"d":{{"ssrc":42,"ip":"127.0.0.1","port":{udp_port},"modes":["xsalsa20_poly1305_suffix","unknown"]}}}}"#
        ));

        // Discovery runs against the scripted UDP server, then the session
        // advertises the discovered address and the negotiated mode.
        let select = loop {
            let frame = peers[0].next_json().await;
            if frame["op"] == 1 {
                break frame;
            }
        };
        assert_eq!(select["d"]["protocol"], "udp");
        assert_eq!(select["d"]["data"]["address"], "9.9.9.9");
        assert_eq!(select["d"]["data"]["port"], 60000);
        assert_eq!(select["d"]["data"]["mode"], "xsalsa20_poly1305_suffix");

        assert_eq!(session.ssrc(), Some(42));
        assert_eq!(session.external_addr(), Some(("9.9.9.9".to_string(), 60000)));
        discovery.await.unwrap();

        session.close();
        runner.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn session_description_arms_the_encryptor() {
        let (udp_port, _discovery) = spawn_discovery_server("5.5.5.5", 50000).await;
        let (connector, peers) = ScriptedConnector::with_connections(1);
        let session = VoiceSession::new(connector, 7, "sess-2", "voice.test", "tok", "1234");

        peers[0].feed_text(VOICE_HELLO);
        let runner = {
            let session = Arc::clone(&session);
            tokio::spawn(async move { session.start().await })
        };
        assert_eq!(peers[0].next_json().await["op"], 0);

        peers[0].feed_text(&format!(
            r#"{{"op":2,"d":{{"ssrc":9,"ip":"127.0.0.1","port":{udp_port},"modes":["xsalsa20_poly1305"]}}}}"#
        ));
        loop {
            if peers[0].next_json().await["op"] == 1 {
                break;
            }
        }
        assert!(!session.is_ready());

        let key: Vec<u8> = (0u8..32).collect();
        peers[0].feed_text(&format!(
            r#"{{"op":4,"d":{{"mode":"xsalsa20_poly1305","secret_key":{}}}}}"#,
            serde_json::to_string(&key).unwrap()
        ));

        session.wait_until_ready().await;
        assert!(session.is_ready());

        session.close();
        runner.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn missed_server_update_terminates_the_session() {
        let (connector, peers) = ScriptedConnector::with_connections(1);
        let session = VoiceSession::new(connector, 7, "sess-3", "voice.test", "tok", "1234");

        peers[0].feed_text(VOICE_HELLO);
        let runner = {
            let session = Arc::clone(&session);
            tokio::spawn(async move { session.start().await })
        };
        assert_eq!(peers[0].next_json().await["op"], 0);

        // 4014 forces a fresh identify, which first waits five seconds for a
        // VOICE_SERVER_UPDATE that never comes.
        peers[0].feed_close(4014);

        // The session ends cleanly instead of reconnecting.
        runner.await.unwrap().unwrap();
        assert!(!session.is_ready());
    }

    #[tokio::test]
    async fn migration_updates_the_endpoint_and_wakes_the_waiter() {
        let (connector, _peers) = ScriptedConnector::with_connections(0);
        let session = VoiceSession::new(connector, 7, "sess-4", "old.endpoint", "tok", "1234");

        assert_eq!(session.core().ws_url(), "wss://old.endpoint?v=4");

        session.set_new_voice_server("new.endpoint:443", "tok2", "1234");
        assert_eq!(session.core().ws_url(), "wss://new.endpoint:443?v=4");
        assert!(session.server_update.is_set());
    }

    #[tokio::test]
    async fn send_packet_before_ready_is_not_connected() {
        let (connector, _peers) = ScriptedConnector::with_connections(0);
        let session = VoiceSession::new(connector, 7, "sess-5", "voice.test", "tok", "1234");
        let mut encoder = Encoder::new().unwrap();

        let frame = vec![0u8; 4];
        let err = session.send_packet(&frame, &mut encoder, false).await.unwrap_err();
        assert!(matches!(err, VoiceError::UnsupportedMode(_)));
    }

    #[test]
    fn voice_urls_pin_the_protocol_version() {
        assert_eq!(voice_ws_url("eu-west1.discord.media"), "wss://eu-west1.discord.media?v=4");
        assert_eq!(voice_ws_url("wss://already.prefixed"), "wss://already.prefixed?v=4");
    }
}
