//! UDP transport for voice media.
//!
//! One socket per voice session, used for the IP discovery exchange and for
//! outbound RTP frames. No inbound media is decoded.

use std::net::SocketAddr;
use std::time::Duration;

use byteorder::{BigEndian, ByteOrder};
use tokio::net::UdpSocket;
use tokio::time::timeout;
use tracing::{debug, info};

use crate::crypto::{Encryptor, RTP_HEADER_SIZE};
use crate::error::VoiceError;

/// Size of the IP discovery datagram, both directions.
const DISCOVERY_LEN: usize = 70;

/// Offset of the NUL-terminated external address in a discovery reply.
const DISCOVERY_IP_OFFSET: usize = 4;

const DISCOVERY_TIMEOUT: Duration = Duration::from_secs(5);

/// The voice session's media socket and RTP counters.
pub struct VoiceTransport {
    socket: UdpSocket,
    ssrc: u32,
    sequence: u16,
    timestamp: u32,
}

impl VoiceTransport {
    /// Bind an ephemeral local port and aim the socket at the voice server.
    pub async fn connect(server_ip: &str, server_port: u16, ssrc: u32) -> Result<Self, VoiceError> {
        let socket = UdpSocket::bind("0.0.0.0:0").await?;
        socket.connect((server_ip, server_port)).await?;
        debug!(server_ip, server_port, ssrc, "voice media socket bound");

        Ok(Self {
            socket,
            ssrc,
            sequence: 0,
            timestamp: 0,
        })
    }

    /// Discover this host's address as the voice server sees it.
    ///
    /// The request is exactly 70 bytes: type `1` and length `70` as
    /// big-endian u16s, then the SSRC. The reply mirrors the layout, with
    /// the external address as NUL-terminated ASCII starting at byte 4 and
    /// the port in the trailing two bytes.
    pub async fn discover_external_addr(&self) -> Result<(String, u16), VoiceError> {
        let mut request = [0u8; DISCOVERY_LEN];
        BigEndian::write_u16(&mut request[0..2], 1);
        BigEndian::write_u16(&mut request[2..4], DISCOVERY_LEN as u16);
        BigEndian::write_u32(&mut request[4..8], self.ssrc);
        self.socket.send(&request).await?;

        let mut reply = [0u8; DISCOVERY_LEN];
        let len = timeout(DISCOVERY_TIMEOUT, self.socket.recv(&mut reply))
            .await
            .map_err(|_| VoiceError::IpDiscovery("no reply from the voice server".to_string()))??;
        if len < DISCOVERY_IP_OFFSET + 3 {
            return Err(VoiceError::IpDiscovery(format!("reply too short: {len} bytes")));
        }

        let address_field = &reply[DISCOVERY_IP_OFFSET..len - 2];
        let address_end = address_field
            .iter()
            .position(|&byte| byte == 0)
            .unwrap_or(address_field.len());
        let address = std::str::from_utf8(&address_field[..address_end])
            .map_err(|_| VoiceError::IpDiscovery("external address is not ascii".to_string()))?
            .to_owned();
        let port = BigEndian::read_u16(&reply[len - 2..len]);

        info!(address = %address, port, "external address discovered");
        Ok((address, port))
    }

    /// Frame, encrypt, and transmit one payload, advancing the RTP counters.
    ///
    /// The sequence wraps at the 16-bit boundary; the timestamp resets to
    /// zero rather than carrying a partial frame across the 32-bit boundary.
    pub async fn send_frame(
        &mut self,
        encryptor: &Encryptor,
        mode: &str,
        payload: &[u8],
        samples_per_frame: u32,
    ) -> Result<(), VoiceError> {
        self.sequence = self.sequence.wrapping_add(1);

        let header = rtp_header(self.sequence, self.timestamp, self.ssrc);
        let packet = encryptor.encrypt(mode, &header, payload)?;
        self.socket.send(&packet).await?;

        self.timestamp = self.timestamp.checked_add(samples_per_frame).unwrap_or(0);
        Ok(())
    }

    pub fn ssrc(&self) -> u32 {
        self.ssrc
    }

    pub fn sequence(&self) -> u16 {
        self.sequence
    }

    pub fn timestamp(&self) -> u32 {
        self.timestamp
    }

    pub fn local_addr(&self) -> Result<SocketAddr, VoiceError> {
        self.socket.local_addr().map_err(VoiceError::from)
    }

    #[cfg(test)]
    pub(crate) fn set_counters(&mut self, sequence: u16, timestamp: u32) {
        self.sequence = sequence;
        self.timestamp = timestamp;
    }
}

/// Build the fixed 12-byte RTP header: version and payload type, then the
/// sequence, timestamp, and SSRC, all big-endian.
pub fn rtp_header(sequence: u16, timestamp: u32, ssrc: u32) -> [u8; RTP_HEADER_SIZE] {
    let mut header = [0u8; RTP_HEADER_SIZE];
    header[0] = 0x80;
    header[1] = 0x78;
    BigEndian::write_u16(&mut header[2..4], sequence);
    BigEndian::write_u32(&mut header[4..8], timestamp);
    BigEndian::write_u32(&mut header[8..12], ssrc);
    header
}
