//! Wire types shared between the gateway, the logic orchestrator, and the
//! delivery pipeline: the client frame envelope, the durable-log event
//! envelopes, and the handful of protocol constants every component needs
//! to agree on.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use serde::{Deserialize, Serialize};

/// Handshake must complete within this many milliseconds or the connection
/// is dropped.
pub const HANDSHAKE_TIMEOUT_MS: u64 = 10_000;

/// Frames larger than this are rejected before decode.
pub const MAX_PAYLOAD_BYTES: usize = 524_288;

/// Heartbeat manager re-score interval.
pub const HEARTBEAT_INTERVAL_SECS: u64 = 30;

/// Freshness window W: a gateway not heart-beating within this many seconds
/// is no longer active.
pub const MEMBERSHIP_WINDOW_SECS: i64 = 90;

/// TTL grace period added on top of the membership window for the gateway
/// instance detail hash.
pub const MEMBERSHIP_TTL_GRACE_SECS: i64 = 30;

/// Session row TTL in the KV store (`conn:{userId}:{connectionId}`).
pub const SESSION_TTL_SECS: i64 = 2 * 60 * 60;

/// Leader-lock TTL for the membership cleaner.
pub const LEADER_LOCK_TTL_SECS: i64 = 60;

/// Leader-lock re-attempt / refresh interval.
pub const LEADER_ELECTION_INTERVAL_SECS: u64 = 30;

/// Membership cleaner purge cycle.
pub const CLEANER_PURGE_INTERVAL_SECS: u64 = 5 * 60;

/// Dedup window for a push to a given socket, keyed `push:{userId}:{messageId}`.
pub const PUSH_DEDUP_TTL_SECS: i64 = 10 * 60;

/// Dedup window for push-consumer offset idempotency,
/// keyed `kafka:push:{partition}:{offset}`.
pub const CONSUMER_DEDUP_TTL_SECS: i64 = 60 * 60;

/// Locator membership re-sync interval.
pub const LOCATOR_SYNC_INTERVAL_SECS: u64 = 10;

/// Async retry producer bound.
pub const PRODUCER_MAX_RETRIES: u32 = 5;
pub const PRODUCER_BASE_BACKOFF_MS: u64 = 2_000;

pub mod topics {
    pub const MESSAGE_PERSISTENCE_LOG: &str = "message_persistence_log";
    pub const DOWNLINK_MESSAGES: &str = "downlink_messages";
}

pub mod kv_keys {
    pub fn conn(user_id: i64, connection_id: &str) -> String {
        format!("conn:{user_id}:{connection_id}")
    }

    pub const ONLINE_USERS: &str = "online_users";
    pub const ACTIVE_GATEWAYS: &str = "active_gateways";

    pub fn gateway_instance(gateway_id: &str) -> String {
        format!("gateway_instances:{gateway_id}")
    }

    pub const LOGIC_LEADER_LOCK: &str = "service:logic:leader_lock";

    pub fn push_dedup(user_id: i64, message_id: i64) -> String {
        format!("push:{user_id}:{message_id}")
    }

    pub fn consumer_dedup(partition: i32, offset: i64) -> String {
        format!("kafka:push:{partition}:{offset}")
    }
}

pub mod channels {
    pub fn gateway_user_message(gateway_id: &str) -> String {
        format!("gateway:{gateway_id}:user_message")
    }
}

/// A client's declared platform, set at handshake time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClientType {
    Web,
    Mobile,
    Desktop,
}

/// The tagged `messageType` discriminant carried on every client frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "i32", into = "i32")]
pub enum MessageType {
    Text,
    Heartbeat,
    SessionMgmt,
    StatusEvent,
    Ack,
    /// Anything else: logged and dropped per §4.4, never reconstructed back
    /// into a dispatchable variant.
    Unknown(i32),
}

impl From<MessageType> for i32 {
    fn from(value: MessageType) -> Self {
        match value {
            MessageType::Text => 1,
            MessageType::Heartbeat => 2,
            MessageType::SessionMgmt => 3,
            MessageType::StatusEvent => 10,
            MessageType::Ack => 11,
            MessageType::Unknown(code) => code,
        }
    }
}

impl TryFrom<i32> for MessageType {
    type Error = std::convert::Infallible;

    fn try_from(value: i32) -> Result<Self, Self::Error> {
        Ok(match value {
            1 => Self::Text,
            2 => Self::Heartbeat,
            3 => Self::SessionMgmt,
            10 => Self::StatusEvent,
            11 => Self::Ack,
            other => Self::Unknown(other),
        })
    }
}

/// A message's lifecycle status, never reverting once `Read`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    Sent,
    Delivered,
    Read,
    Revoked,
}

/// The client wire frame (§6): a tagged envelope carried bidirectionally
/// over the gateway's WebSocket connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientFrame {
    #[serde(rename = "messageId", default)]
    pub message_id: i64,
    pub from: i64,
    #[serde(default)]
    pub to: i64,
    #[serde(rename = "groupId", default)]
    pub group_id: i64,
    #[serde(default)]
    pub content: String,
    #[serde(rename = "messageType")]
    pub message_type: MessageType,
    pub timestamp: i64,
    #[serde(rename = "ackId", skip_serializing_if = "Option::is_none")]
    pub ack_id: Option<String>,
}

impl ClientFrame {
    /// A uplink frame targets exactly one of a user or a group, never both.
    #[must_use]
    pub fn is_private(&self) -> bool {
        self.to != 0 && self.group_id == 0
    }

    #[must_use]
    pub fn is_group(&self) -> bool {
        self.group_id != 0 && self.to == 0
    }

    /// Frames that target neither or both are malformed per the data model
    /// invariant "exactly one of `to` and `groupId` is non-zero".
    #[must_use]
    pub fn has_valid_target(&self) -> bool {
        self.is_private() ^ self.is_group()
    }
}

/// The persisted/archived message record (§3 data model).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Message {
    pub message_id: i64,
    pub from: i64,
    pub to: i64,
    pub group_id: i64,
    pub content: String,
    pub message_type: MessageType,
    pub timestamp_unix: i64,
    pub status: MessageStatus,
    pub created_at: i64,
    pub updated_at: i64,
}

/// Outbound downlink event carried on durable-log topics and per-gateway
/// pub/sub channels.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DownlinkEvent {
    NewMessage {
        message: Message,
        #[serde(rename = "targetUser")]
        target_user: i64,
        #[serde(rename = "publishedAtUnix")]
        published_at_unix: i64,
    },
    ArchiveMessage {
        message: Message,
        #[serde(rename = "publishedAtUnix")]
        published_at_unix: i64,
    },
}

/// The small structured envelope used for the per-gateway pub/sub channel:
/// `(type, message, targetUser, timestamp)`. JSON-encoded then base64-wrapped
/// for channel transport (per design note on cross-node push as pub/sub).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayEnvelope {
    pub r#type: String,
    pub message: Message,
    #[serde(rename = "targetUser")]
    pub target_user: i64,
    pub timestamp: i64,
}

impl GatewayEnvelope {
    #[must_use]
    pub fn new_message(message: Message, target_user: i64, timestamp: i64) -> Self {
        Self {
            r#type: "new_message".to_string(),
            message,
            target_user,
            timestamp,
        }
    }

    /// Encode as JSON then base64 (standard alphabet, padded) for pub/sub
    /// channel transport.
    ///
    /// # Errors
    /// Returns an error if the envelope cannot be serialized to JSON.
    pub fn to_wire(&self) -> serde_json::Result<String> {
        let json = serde_json::to_vec(self)?;
        Ok(BASE64.encode(json))
    }

    /// Decode from the base64-wrapped JSON produced by [`Self::to_wire`].
    ///
    /// # Errors
    /// Returns an error if the payload is not valid base64 or not a valid
    /// `GatewayEnvelope`.
    pub fn from_wire(payload: &str) -> Result<Self, WireDecodeError> {
        let json = BASE64.decode(payload).map_err(WireDecodeError::InvalidBase64)?;
        serde_json::from_slice(&json).map_err(WireDecodeError::InvalidJson)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum WireDecodeError {
    #[error("invalid base64 payload: {0}")]
    InvalidBase64(#[source] base64::DecodeError),
    #[error("invalid envelope json: {0}")]
    InvalidJson(#[source] serde_json::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_message(message_id: i64) -> Message {
        Message {
            message_id,
            from: 1,
            to: 2,
            group_id: 0,
            content: "hi".to_string(),
            message_type: MessageType::Text,
            timestamp_unix: 1_000,
            status: MessageStatus::Sent,
            created_at: 1_000,
            updated_at: 1_000,
        }
    }

    #[test]
    fn client_frame_private_target_is_valid() {
        let frame = ClientFrame {
            message_id: 0,
            from: 1,
            to: 2,
            group_id: 0,
            content: "hi".into(),
            message_type: MessageType::Text,
            timestamp: 1,
            ack_id: None,
        };
        assert!(frame.is_private());
        assert!(!frame.is_group());
        assert!(frame.has_valid_target());
    }

    #[test]
    fn client_frame_with_both_targets_is_invalid() {
        let frame = ClientFrame {
            message_id: 0,
            from: 1,
            to: 2,
            group_id: 5,
            content: "hi".into(),
            message_type: MessageType::Text,
            timestamp: 1,
            ack_id: None,
        };
        assert!(!frame.has_valid_target());
    }

    #[test]
    fn client_frame_with_no_target_is_invalid() {
        let frame = ClientFrame {
            message_id: 0,
            from: 1,
            to: 0,
            group_id: 0,
            content: "hi".into(),
            message_type: MessageType::Text,
            timestamp: 1,
            ack_id: None,
        };
        assert!(!frame.has_valid_target());
    }

    #[test]
    fn gateway_envelope_round_trips_through_wire_encoding() {
        let envelope = GatewayEnvelope::new_message(sample_message(42), 2, 1_234);
        let wire = envelope.to_wire().expect("encode");
        let decoded = GatewayEnvelope::from_wire(&wire).expect("decode");
        assert_eq!(decoded.target_user, 2);
        assert_eq!(decoded.message.message_id, 42);
    }

    #[test]
    fn from_wire_rejects_invalid_base64() {
        assert!(matches!(
            GatewayEnvelope::from_wire("not valid base64!!"),
            Err(WireDecodeError::InvalidBase64(_))
        ));
    }

    #[test]
    fn kv_key_helpers_match_the_documented_layout() {
        assert_eq!(kv_keys::conn(7, "conn-7-123"), "conn:7:conn-7-123");
        assert_eq!(
            kv_keys::gateway_instance("gw-1"),
            "gateway_instances:gw-1"
        );
        assert_eq!(kv_keys::push_dedup(7, 42), "push:7:42");
        assert_eq!(kv_keys::consumer_dedup(3, 100), "kafka:push:3:100");
    }
}
