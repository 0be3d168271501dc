
//! Wire format for the relay bridge.
//!
//! One JSON object per newline-terminated line, in both directions.  The
//! envelope is deliberately tiny: a channel, a speaker, and the text.  The
//! relay process on the far end turns these into whatever its chat network
//! wants (and back again); we never see any of that.

use serde::{Deserialize, Serialize};

/// Reserved channel: the relay's first message presents its credentials here.
pub const AUTH_CHANNEL: &str = "auth";
/// Reserved channel: periodic keep-alive pings from the relay.
pub const HEARTBEAT_CHANNEL: &str = "heartbeat";

/// The relay envelope.  `emoted` is only ever present on traffic we send out,
/// and only when the text already embeds the speaker ("Robin waves"), so the
/// relay knows not to prefix the name again.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelayMessage {
    pub channel: String,
    pub name: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub emoted: Option<u8>,
}

impl RelayMessage {
    pub fn chat(channel: &str, name: &str, message: &str) -> RelayMessage {
        RelayMessage {
            channel: channel.to_string(),
            name: name.to_string(),
            message: message.to_string(),
            emoted: None,
        }
    }

    pub fn emote(channel: &str, name: &str, message: &str) -> RelayMessage {
        RelayMessage {
            emoted: Some(1),
            ..RelayMessage::chat(channel, name, message)
        }
    }
}

/// Serialize a message as one wire line, newline included.
pub fn encode_line(msg: &RelayMessage) -> Result<Vec<u8>, serde_json::Error> {
    let mut bytes = serde_json::to_vec(msg)?;
    bytes.push(b'\n');
    Ok(bytes)
}

/// Parse one wire line (without its newline).
pub fn decode_line(line: &str) -> Result<RelayMessage, serde_json::Error> {
    serde_json::from_str(line)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_relay_chat_exactly_as_sent() {
        // Byte-for-byte what a relay process writes at us.
        let line = r#"{"name":"somebird","channel":"gossip","message":"hello in there"}"#;
        let msg = decode_line(line).unwrap();
        assert_eq!(msg.channel, "gossip");
        assert_eq!(msg.name, "somebird");
        assert_eq!(msg.message, "hello in there");
        assert_eq!(msg.emoted, None);
    }

    #[test]
    fn decodes_auth_and_heartbeat_lines() {
        let auth = decode_line(r#"{"channel":"auth","name":"bot","message":"sekrit"}"#).unwrap();
        assert_eq!(auth.channel, AUTH_CHANNEL);
        assert_eq!(auth.message, "sekrit");

        let beat = decode_line(r#"{"channel":"heartbeat","name":"bot","message":"ping"}"#).unwrap();
        assert_eq!(beat.channel, HEARTBEAT_CHANNEL);
    }

    #[test]
    fn rejects_lines_missing_fields() {
        assert!(decode_line(r#"{"channel":"gossip"}"#).is_err());
        assert!(decode_line("not json at all").is_err());
    }

    #[test]
    fn encode_omits_emoted_unless_set() {
        let plain = encode_line(&RelayMessage::chat("gossip", "Robin", "hi")).unwrap();
        let plain = String::from_utf8(plain).unwrap();
        assert!(plain.ends_with('\n'));
        assert!(!plain.contains("emoted"));

        let emoted = encode_line(&RelayMessage::emote("gossip", "Robin", "Robin waves")).unwrap();
        let emoted = String::from_utf8(emoted).unwrap();
        assert!(emoted.contains(r#""emoted":1"#));
    }

    #[test]
    fn roundtrips() {
        let msg = RelayMessage::emote("trade", "Robin", "Robin haggles");
        let bytes = encode_line(&msg).unwrap();
        let back = decode_line(String::from_utf8_lossy(&bytes).trim()).unwrap();
        assert_eq!(back, msg);
    }
}
