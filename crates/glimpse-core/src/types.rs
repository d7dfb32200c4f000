//! Core data types shared by the registry, relay, and negotiation layers

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ErrorCode;

// ============================================================================
// Sessions
// ============================================================================

/// Lifecycle status of a session
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Active,
    Inactive,
    Expired,
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionStatus::Active => write!(f, "active"),
            SessionStatus::Inactive => write!(f, "inactive"),
            SessionStatus::Expired => write!(f, "expired"),
        }
    }
}

/// Optional descriptive data attached to a session at creation
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_viewers: Option<u32>,
}

/// One broadcast, identified by its 8-character code
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub id: String,
    pub status: SessionStatus,
    pub host_id: String,
    /// Viewer IDs in join order, without duplicates
    #[serde(default)]
    pub viewers: Vec<String>,
    /// Creation time in milliseconds since the Unix epoch
    pub created_at: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<SessionMetadata>,
}

impl Session {
    /// Age of the session at `now_ms`
    pub fn age_ms(&self, now_ms: i64) -> i64 {
        now_ms - self.created_at
    }

    /// Whether the session has outlived `expiry_ms`
    pub fn is_expired(&self, now_ms: i64, expiry_ms: i64) -> bool {
        self.age_ms(now_ms) > expiry_ms
    }

    /// Whether the session can be joined: active and not expired
    pub fn is_live(&self, now_ms: i64, expiry_ms: i64) -> bool {
        self.status == SessionStatus::Active && !self.is_expired(now_ms, expiry_ms)
    }

    pub fn viewer_count(&self) -> usize {
        self.viewers.len()
    }

    pub fn max_viewers(&self) -> Option<u32> {
        self.metadata.as_ref().and_then(|m| m.max_viewers)
    }

    /// Whether the viewer limit (if any) has been reached
    pub fn is_full(&self) -> bool {
        self.max_viewers()
            .map_or(false, |max| self.viewers.len() >= max as usize)
    }

    pub fn has_viewer(&self, viewer_id: &str) -> bool {
        self.viewers.iter().any(|v| v == viewer_id)
    }

    /// Add a viewer unless already present; returns whether the list changed
    pub fn insert_viewer(&mut self, viewer_id: &str) -> bool {
        if self.has_viewer(viewer_id) {
            return false;
        }
        self.viewers.push(viewer_id.to_string());
        true
    }

    /// Remove a viewer if present; returns whether the list changed
    pub fn remove_viewer(&mut self, viewer_id: &str) -> bool {
        let before = self.viewers.len();
        self.viewers.retain(|v| v != viewer_id);
        self.viewers.len() != before
    }

    /// Case-insensitive match against id, title, and description
    pub fn matches_query(&self, query: &str) -> bool {
        let query = query.trim().to_lowercase();
        if query.is_empty() {
            return true;
        }

        let contains = |s: &str| s.to_lowercase().contains(&query);
        contains(self.id.as_str())
            || self.metadata.as_ref().map_or(false, |m| {
                m.title.as_deref().map_or(false, contains)
                    || m.description.as_deref().map_or(false, contains)
            })
    }
}

/// Aggregate numbers over the live sessions
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryStats {
    pub active_sessions: usize,
    pub total_viewers: usize,
    /// Creation time of the longest-running active session, epoch milliseconds
    pub oldest_created_at: Option<i64>,
}

impl RegistryStats {
    /// Whole minutes the longest-running active session has been up
    pub fn longest_uptime_minutes(&self, now: i64) -> Option<i64> {
        self.oldest_created_at
            .map(|created| (now - created).max(0) / 60_000)
    }
}

// ============================================================================
// Signaling
// ============================================================================

/// Kind of a signaling message
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MessageType {
    Join,
    Leave,
    Offer,
    Answer,
    IceCandidate,
    Error,
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            MessageType::Join => "join",
            MessageType::Leave => "leave",
            MessageType::Offer => "offer",
            MessageType::Answer => "answer",
            MessageType::IceCandidate => "ice-candidate",
            MessageType::Error => "error",
        };
        f.write_str(s)
    }
}

/// One negotiation datagram carried by the relay
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignalingMessage {
    #[serde(rename = "type")]
    pub kind: MessageType,
    pub session_id: String,
    pub sender_id: String,
    /// Type-specific payload, opaque to the relay
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    /// Creation time in milliseconds since the Unix epoch
    pub timestamp: i64,
}

impl SignalingMessage {
    /// Age of the message at `now_ms`
    pub fn age_ms(&self, now_ms: i64) -> i64 {
        now_ms - self.timestamp
    }

    /// Decode the payload into a typed structure
    pub fn payload<T: serde::de::DeserializeOwned>(&self) -> Option<T> {
        self.data
            .as_ref()
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }
}

/// Whether a description is an offer or an answer
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Answer,
}

/// A session description produced by a media transport
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpType,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpType::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpType::Answer,
            sdp: sdp.into(),
        }
    }
}

/// A network path candidate discovered by a media transport
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_m_line_index: Option<u16>,
}

impl IceCandidate {
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: None,
            sdp_m_line_index: None,
        }
    }
}

/// Payload of `offer` and `answer` messages
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SdpPayload {
    pub sdp: SessionDescription,
}

/// Payload of `ice-candidate` messages
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CandidatePayload {
    pub candidate: IceCandidate,
}

/// Payload of `error` messages
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<ErrorCode>,
    pub message: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::SESSION_EXPIRY_MS;

    fn session(created_at: i64) -> Session {
        Session {
            id: "BA7ZUM4E".into(),
            status: SessionStatus::Active,
            host_id: "host_1".into(),
            viewers: vec![],
            created_at,
            metadata: Some(SessionMetadata {
                title: Some("Design Review".into()),
                description: Some("Walking through the new dashboard".into()),
                max_viewers: Some(2),
            }),
        }
    }

    #[test]
    fn test_session_json_layout() {
        let json = serde_json::to_value(session(42)).unwrap();
        assert_eq!(json["hostId"], "host_1");
        assert_eq!(json["createdAt"], 42);
        assert_eq!(json["status"], "active");
        assert_eq!(json["metadata"]["maxViewers"], 2);
    }

    #[test]
    fn test_session_expiry_boundary() {
        let s = session(0);
        assert!(!s.is_expired(SESSION_EXPIRY_MS, SESSION_EXPIRY_MS));
        assert!(s.is_expired(SESSION_EXPIRY_MS + 1, SESSION_EXPIRY_MS));
        assert!(s.is_live(SESSION_EXPIRY_MS, SESSION_EXPIRY_MS));

        let mut inactive = s.clone();
        inactive.status = SessionStatus::Inactive;
        assert!(!inactive.is_live(0, SESSION_EXPIRY_MS));
    }

    #[test]
    fn test_viewer_set_semantics() {
        let mut s = session(0);
        assert!(s.insert_viewer("v1"));
        assert!(!s.insert_viewer("v1"));
        assert!(s.insert_viewer("v2"));
        assert_eq!(s.viewers, vec!["v1", "v2"]);
        assert!(s.is_full());

        assert!(s.remove_viewer("v1"));
        assert!(!s.remove_viewer("v1"));
        assert!(!s.is_full());
    }

    #[test]
    fn test_matches_query() {
        let s = session(0);
        assert!(s.matches_query(""));
        assert!(s.matches_query("ba7z"));
        assert!(s.matches_query("design"));
        assert!(s.matches_query("DASHBOARD"));
        assert!(!s.matches_query("standup"));
    }

    #[test]
    fn test_message_type_wire_names() {
        let json = serde_json::to_string(&MessageType::IceCandidate).unwrap();
        assert_eq!(json, "\"ice-candidate\"");
        assert_eq!(MessageType::IceCandidate.to_string(), "ice-candidate");
    }

    #[test]
    fn test_signaling_message_payload() {
        let msg = SignalingMessage {
            kind: MessageType::Offer,
            session_id: "BA7ZUM4E".into(),
            sender_id: "host_1".into(),
            data: Some(
                serde_json::to_value(SdpPayload {
                    sdp: SessionDescription::offer("v=0"),
                })
                .unwrap(),
            ),
            timestamp: 1_000,
        };

        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "offer");
        assert_eq!(json["senderId"], "host_1");
        assert_eq!(json["data"]["sdp"]["type"], "offer");

        let payload: SdpPayload = msg.payload().unwrap();
        assert_eq!(payload.sdp.sdp, "v=0");
        assert!(msg.payload::<CandidatePayload>().is_none());
    }

    #[test]
    fn test_error_payload_code_is_optional() {
        let bare: ErrorPayload = serde_json::from_str(r#"{"message":"boom"}"#).unwrap();
        assert_eq!(bare.code, None);
        assert_eq!(serde_json::to_string(&bare).unwrap(), r#"{"message":"boom"}"#);

        let coded = ErrorPayload {
            code: Some(ErrorCode::TransportFailure),
            message: "no answer".into(),
        };
        let json = serde_json::to_value(&coded).unwrap();
        assert_eq!(json["code"], "transport_failure");
    }

    #[test]
    fn test_longest_uptime_minutes() {
        let empty = RegistryStats::default();
        assert_eq!(empty.longest_uptime_minutes(1_000), None);

        let stats = RegistryStats {
            active_sessions: 2,
            total_viewers: 0,
            oldest_created_at: Some(1_000),
        };
        assert_eq!(stats.longest_uptime_minutes(1_000 + 59_999), Some(0));
        assert_eq!(stats.longest_uptime_minutes(1_000 + 5 * 60_000), Some(5));
        // Clock skew never reports negative uptime
        assert_eq!(stats.longest_uptime_minutes(0), Some(0));
    }
}
