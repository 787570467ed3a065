//! Voice gateway payloads.

use serde::{Deserialize, Serialize};

use crate::opcode::VoiceOpCode;

/// An outbound voice `{op, d}` envelope.
#[derive(Debug, Clone, Serialize)]
pub struct VoiceFrame<D> {
    pub op: VoiceOpCode,
    pub d: D,
}

impl<D: Serialize> VoiceFrame<D> {
    pub fn new(op: VoiceOpCode, d: D) -> Self {
        Self { op, d }
    }
}

/// Payload of voice IDENTIFY (op 0).
#[derive(Debug, Clone, Serialize)]
pub struct VoiceIdentify<'a> {
    pub server_id: &'a str,
    pub user_id: String,
    pub session_id: &'a str,
    pub token: &'a str,
}

/// Payload of voice READY (op 2).
#[derive(Debug, Clone, Deserialize)]
pub struct VoiceReady {
    pub ssrc: u32,
    /// Voice server media address.
    pub ip: String,
    pub port: u16,
    /// Encryption modes the server offers, in its preference order.
    pub modes: Vec<String>,
}

/// Payload of SELECT_PROTOCOL (op 1).
#[derive(Debug, Clone, Serialize)]
pub struct SelectProtocol<'a> {
    /// Always `"udp"`.
    pub protocol: &'a str,
    pub data: SelectProtocolData<'a>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SelectProtocolData<'a> {
    /// Our externally visible address from IP discovery.
    pub address: &'a str,
    pub port: u16,
    pub mode: &'a str,
}

/// Payload of SESSION_DESCRIPTION (op 4).
#[derive(Debug, Clone, Deserialize)]
pub struct SessionDescription {
    pub mode: String,
    /// 32-byte symmetric session key.
    pub secret_key: Vec<u8>,
}

/// Payload of SPEAKING (op 5).
#[derive(Debug, Clone, Serialize)]
pub struct Speaking {
    pub speaking: u8,
    pub delay: u32,
    pub ssrc: u32,
}

/// Payload of voice RESUME (op 7).
#[derive(Debug, Clone, Serialize)]
pub struct VoiceResume<'a> {
    pub server_id: &'a str,
    pub session_id: &'a str,
    pub token: &'a str,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn select_protocol_shape() {
        let payload = SelectProtocol {
            protocol: "udp",
            data: SelectProtocolData {
                address: "9.9.9.9",
                port: 60000,
                mode: "xsalsa20_poly1305_suffix",
            },
        };
        let json = serde_json::to_value(VoiceFrame::new(VoiceOpCode::SelectProtocol, payload)).unwrap();

        assert_eq!(json["op"], 1);
        assert_eq!(json["d"]["protocol"], "udp");
        assert_eq!(json["d"]["data"]["address"], "9.9.9.9");
        assert_eq!(json["d"]["data"]["port"], 60000);
        assert_eq!(json["d"]["data"]["mode"], "xsalsa20_poly1305_suffix");
    }

    #[test]
    fn ready_parses_server_modes_in_order() {
        let ready: VoiceReady = serde_json::from_str(
            r#"{"ssrc":42,"ip":"1.2.3.4","port":5000,"modes":["aead_aes256_gcm","xsalsa20_poly1305"]}"#,
        )
        .unwrap();
        assert_eq!(ready.ssrc, 42);
        assert_eq!(ready.modes, vec!["aead_aes256_gcm", "xsalsa20_poly1305"]);
    }
}
