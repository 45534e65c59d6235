//! Signaling Protocol
//!
//! JSON messages exchanged over a rendezvous connection: SDP offer/answer,
//! network-path candidates, and the application messages that share the
//! same channel (audio frames and display-name announcements).

use super::NegotiationError;
use serde::{Deserialize, Serialize};

/// A network-path candidate in browser `RTCIceCandidateInit` shape
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(rename = "sdpMid", default)]
    pub sdp_mid: Option<String>,
    #[serde(rename = "sdpMLineIndex", default)]
    pub sdp_mline_index: Option<u16>,
}

/// Message types carried over the signaling connection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum SignalingMessage {
    /// SDP offer, once per negotiation start
    Offer { sdp: String },

    /// SDP answer, exactly once per offer
    Answer { sdp: String },

    /// Network-path candidate
    Candidate { candidate: IceCandidate },

    /// Audio frame riding the signaling connection
    Audio {
        data: Vec<i16>,
        username: String,
        timestamp: u64,
    },

    /// Display name announcement
    UserInfo { username: String, timestamp: u64 },
}

impl SignalingMessage {
    /// Parse a signaling message from JSON bytes
    pub fn from_json(json: &[u8]) -> Result<Self, NegotiationError> {
        serde_json::from_slice(json)
            .map_err(|e| NegotiationError::Malformed(format!("invalid signaling message: {}", e)))
    }

    /// Serialize to JSON
    pub fn to_json(&self) -> Result<Vec<u8>, NegotiationError> {
        serde_json::to_vec(self)
            .map_err(|e| NegotiationError::Malformed(format!("failed to serialize message: {}", e)))
    }

    pub fn offer(sdp: String) -> Self {
        SignalingMessage::Offer { sdp }
    }

    pub fn answer(sdp: String) -> Self {
        SignalingMessage::Answer { sdp }
    }

    pub fn candidate(candidate: IceCandidate) -> Self {
        SignalingMessage::Candidate { candidate }
    }

    pub fn audio(data: Vec<i16>, username: &str, timestamp: u64) -> Self {
        SignalingMessage::Audio { data, username: username.to_string(), timestamp }
    }

    pub fn user_info(username: &str, timestamp: u64) -> Self {
        SignalingMessage::UserInfo { username: username.to_string(), timestamp }
    }

    /// Short name of the message kind, as used on the wire
    pub fn kind(&self) -> &'static str {
        match self {
            SignalingMessage::Offer { .. } => "offer",
            SignalingMessage::Answer { .. } => "answer",
            SignalingMessage::Candidate { .. } => "candidate",
            SignalingMessage::Audio { .. } => "audio",
            SignalingMessage::UserInfo { .. } => "user-info",
        }
    }

    /// Whether the message belongs to offer/answer negotiation
    pub fn is_negotiation(&self) -> bool {
        matches!(
            self,
            SignalingMessage::Offer { .. } | SignalingMessage::Answer { .. } | SignalingMessage::Candidate { .. }
        )
    }
}

/// Milliseconds since the Unix epoch
pub fn epoch_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_offer() {
        let msg = SignalingMessage::from_json(br#"{"type": "offer", "sdp": "v=0\r\n..."}"#).unwrap();
        match msg {
            SignalingMessage::Offer { sdp } => assert!(sdp.starts_with("v=0")),
            _ => panic!("Expected Offer"),
        }
    }

    #[test]
    fn test_parse_browser_candidate() {
        let json = br#"{"type":"candidate","candidate":{"candidate":"candidate:1 1 udp 2122260223 192.168.1.2 54321 typ host","sdpMid":"0","sdpMLineIndex":0}}"#;
        let msg = SignalingMessage::from_json(json).unwrap();
        match msg {
            SignalingMessage::Candidate { candidate } => {
                assert_eq!(candidate.sdp_mid.as_deref(), Some("0"));
                assert_eq!(candidate.sdp_mline_index, Some(0));
            }
            _ => panic!("Expected Candidate"),
        }
    }

    #[test]
    fn test_candidate_nullable_fields() {
        let json = br#"{"type":"candidate","candidate":{"candidate":"c","sdpMid":null,"sdpMLineIndex":null}}"#;
        assert!(SignalingMessage::from_json(json).is_ok());
        let json = br#"{"type":"candidate","candidate":{"candidate":"c"}}"#;
        assert!(SignalingMessage::from_json(json).is_ok());
    }

    #[test]
    fn test_user_info_tag() {
        let json = SignalingMessage::user_info("radio", 42).to_json().unwrap();
        let text = String::from_utf8(json).unwrap();
        assert!(text.contains(r#""type":"user-info""#));
        assert!(text.contains(r#""username":"radio""#));
    }

    #[test]
    fn test_audio_message() {
        let json = br#"{"type":"audio","data":[0,-1,32767],"username":"a","timestamp":1700000000000}"#;
        match SignalingMessage::from_json(json).unwrap() {
            SignalingMessage::Audio { data, username, timestamp } => {
                assert_eq!(data, vec![0, -1, 32767]);
                assert_eq!(username, "a");
                assert_eq!(timestamp, 1_700_000_000_000);
            }
            _ => panic!("Expected Audio"),
        }
    }

    #[test]
    fn test_rejects_unknown_and_malformed() {
        assert!(matches!(
            SignalingMessage::from_json(br#"{"type":"bye"}"#),
            Err(NegotiationError::Malformed(_))
        ));
        assert!(SignalingMessage::from_json(br#"{"type":"offer"}"#).is_err());
        assert!(SignalingMessage::from_json(b"not json").is_err());
    }

    #[test]
    fn test_negotiation_classification() {
        assert!(SignalingMessage::offer("x".into()).is_negotiation());
        assert!(!SignalingMessage::user_info("x", 0).is_negotiation());
        assert_eq!(SignalingMessage::audio(vec![], "x", 0).kind(), "audio");
    }
}
