//! Gateway payload structures.
//!
//! Inbound traffic uses the loose `{op, d, s, t}` envelope; outbound frames
//! are typed and serialized through [`OutboundFrame`].

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::intents::Intents;
use crate::opcode::OpCode;

/// The `{op, d, s, t}` envelope of an inbound frame.
///
/// The opcode stays a raw integer so unknown codes fall through to logging
/// instead of failing deserialization.
#[derive(Debug, Clone, Deserialize)]
pub struct InboundFrame {
    pub op: u8,

    /// Event data.
    #[serde(default)]
    pub d: Value,

    /// Sequence number, present on dispatches only.
    #[serde(default)]
    pub s: Option<u64>,

    /// Event name, present on dispatches only.
    #[serde(default)]
    pub t: Option<String>,
}

/// An outbound `{op, d}` envelope.
#[derive(Debug, Clone, Serialize)]
pub struct OutboundFrame<D> {
    pub op: OpCode,
    pub d: D,
}

impl<D: Serialize> OutboundFrame<D> {
    pub fn new(op: OpCode, d: D) -> Self {
        Self { op, d }
    }
}

/// Payload of HELLO (op 10).
#[derive(Debug, Clone, Deserialize)]
pub struct Hello {
    /// Interval between heartbeats, in milliseconds. The voice gateway sends
    /// this as a float.
    pub heartbeat_interval: f64,
}

/// Payload of IDENTIFY (op 2).
#[derive(Debug, Clone, Serialize)]
pub struct Identify<'a> {
    pub token: &'a str,
    pub intents: Intents,
    /// `[shard_index, shard_count]`.
    pub shard: [u16; 2],
    pub large_threshold: u8,
    pub properties: ConnectionProperties<'a>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub presence: Option<PresenceUpdate>,
    pub compress: bool,
}

/// Connection properties sent with IDENTIFY.
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionProperties<'a> {
    pub os: &'a str,
    pub browser: &'a str,
    pub device: &'a str,
}

impl Default for ConnectionProperties<'static> {
    fn default() -> Self {
        Self {
            os: std::env::consts::OS,
            browser: "taipan",
            device: "taipan",
        }
    }
}

/// Payload of RESUME (op 6).
#[derive(Debug, Clone, Serialize)]
pub struct Resume<'a> {
    pub token: &'a str,
    pub session_id: &'a str,
    pub seq: Option<u64>,
}

/// Presence block carried in IDENTIFY and presence updates (op 3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PresenceUpdate {
    /// Unix timestamp in milliseconds of when the client went idle.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub since: Option<u64>,
    pub activities: Vec<Activity>,
    pub status: OnlineStatus,
    pub afk: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Activity {
    pub name: String,
    /// Activity type: 0 playing, 1 streaming, 2 listening, 3 watching,
    /// 4 custom, 5 competing.
    #[serde(rename = "type")]
    pub kind: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OnlineStatus {
    #[default]
    Online,
    Dnd,
    Idle,
    Invisible,
    Offline,
}

/// Payload of REQUEST_GUILD_MEMBERS (op 8).
#[derive(Debug, Clone, Serialize)]
pub struct RequestGuildMembers<'a> {
    pub guild_id: u64,
    pub query: &'a str,
    pub limit: u32,
    pub presences: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_ids: Option<Vec<u64>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nonce: Option<&'a str>,
}

/// Payload of VOICE_STATE_UPDATE (op 4).
#[derive(Debug, Clone, Serialize)]
pub struct VoiceStateUpdate {
    pub guild_id: u64,
    /// `None` disconnects from voice.
    pub channel_id: Option<u64>,
    pub self_mute: bool,
    pub self_deaf: bool,
}

/// Build a heartbeat frame carrying the last seen sequence, or null before
/// any dispatch arrived.
pub fn heartbeat_frame(sequence: Option<u64>) -> String {
    match sequence {
        Some(seq) => format!(r#"{{"op":1,"d":{seq}}}"#),
        None => r#"{"op":1,"d":null}"#.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inbound_envelope_tolerates_missing_fields() {
        let frame: InboundFrame = serde_json::from_str(r#"{"op":11}"#).unwrap();
        assert_eq!(frame.op, 11);
        assert!(frame.d.is_null());
        assert_eq!(frame.s, None);
        assert_eq!(frame.t, None);
    }

    #[test]
    fn identify_carries_the_shard_pair_and_compression() {
        let identify = Identify {
            token: "token",
            intents: Intents::GUILDS,
            shard: [2, 4],
            large_threshold: 250,
            properties: ConnectionProperties::default(),
            presence: None,
            compress: true,
        };
        let json = serde_json::to_value(OutboundFrame::new(OpCode::Identify, identify)).unwrap();

        assert_eq!(json["op"], 2);
        assert_eq!(json["d"]["shard"][0], 2);
        assert_eq!(json["d"]["shard"][1], 4);
        assert_eq!(json["d"]["large_threshold"], 250);
        assert_eq!(json["d"]["compress"], true);
        assert_eq!(json["d"]["properties"]["browser"], "taipan");
        assert!(json["d"].get("presence").is_none());
    }

    #[test]
    fn heartbeat_frame_serializes_the_sequence() {
        assert_eq!(heartbeat_frame(Some(42)), r#"{"op":1,"d":42}"#);
        assert_eq!(heartbeat_frame(None), r#"{"op":1,"d":null}"#);
    }

    #[test]
    fn request_members_omits_absent_filters() {
        let request = RequestGuildMembers {
            guild_id: 81384788765712384,
            query: "",
            limit: 0,
            presences: false,
            user_ids: None,
            nonce: None,
        };
        let json = serde_json::to_value(&request).unwrap();
        assert!(json.get("user_ids").is_none());
        assert!(json.get("nonce").is_none());
        assert_eq!(json["query"], "");
    }

    #[test]
    fn online_status_serializes_lowercase() {
        assert_eq!(serde_json::to_string(&OnlineStatus::Dnd).unwrap(), r#""dnd""#);
        assert_eq!(serde_json::to_string(&OnlineStatus::Online).unwrap(), r#""online""#);
    }
}
