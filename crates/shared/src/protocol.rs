use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    domain::{MessageId, QuoteRequestId, RoomId, UserId, UserRole},
    error::ApiError,
};

/// Topic carrying chat messages for one room.
pub fn room_topic(room_id: RoomId) -> String {
    format!("chat/{}", room_id.0)
}

/// Companion topic carrying read acknowledgements for one room.
pub fn room_read_topic(room_id: RoomId) -> String {
    format!("chat/{}/read", room_id.0)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ClientFrame {
    Connect { access_token: String },
    Subscribe { topic: String },
    Unsubscribe { topic: String },
    Publish { topic: String, body: serde_json::Value },
    Ping,
    Pong,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum BrokerFrame {
    Connected,
    Deliver { topic: String, body: serde_json::Value },
    Ping,
    Pong,
    Error(ApiError),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessagePayload {
    pub message_id: MessageId,
    pub room_id: RoomId,
    pub sender_id: UserId,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sent_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub read_by_recipient: bool,
}

/// Body published to a room topic; the broker assigns the message id and
/// echoes the stored message back as a [`ChatMessagePayload`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutgoingMessage {
    pub room_id: RoomId,
    pub sender_id: UserId,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sent_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadReceiptPayload {
    pub message_ids: Vec<MessageId>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatRoomSummary {
    pub room_id: RoomId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quote_request_id: Option<QuoteRequestId>,
    pub customer_id: UserId,
    pub customer_name: String,
    pub business_id: UserId,
    pub business_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_message: Option<String>,
    #[serde(default)]
    pub unread_count: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserProfile {
    pub user_id: UserId,
    pub name: String,
    pub email: String,
    pub role: UserRole,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenPairResponse {
    pub access_token: String,
    pub refresh_token: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefreshResponse {
    pub access_token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
}
