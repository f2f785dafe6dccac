use std::sync::Arc;

use shared::{
    domain::{MessageId, RoomId, UserId},
    protocol::{room_read_topic, ChatMessagePayload, ReadReceiptPayload},
};

use crate::{channel::ChannelManager, error::ClientError};

/// Ids of messages authored by someone else that the local user has not yet
/// acknowledged. Pure so it can be checked without any transport in place.
pub fn unread_foreign(messages: &[ChatMessagePayload], local_user: UserId) -> Vec<MessageId> {
    messages
        .iter()
        .filter(|message| !message.read_by_recipient && message.sender_id != local_user)
        .map(|message| message.message_id)
        .collect()
}

pub fn parse_receipt(body: serde_json::Value) -> Result<ReadReceiptPayload, ClientError> {
    serde_json::from_value(body)
        .map_err(|err| ClientError::Protocol(format!("invalid read receipt body: {err}")))
}

/// Emits one batched acknowledgement per merged-view change and never more
/// than the room's unread-foreign set. Receipt traffic is best-effort: a
/// failed publish is dropped, the next recomputation covers it.
pub struct ReadReceiptTracker {
    room_id: RoomId,
    local_user: UserId,
    channel: Arc<ChannelManager>,
}

impl ReadReceiptTracker {
    pub fn new(room_id: RoomId, local_user: UserId, channel: Arc<ChannelManager>) -> Self {
        Self {
            room_id,
            local_user,
            channel,
        }
    }

    /// Returns false only when there was something to acknowledge and the
    /// publish could not be handed to the broker.
    pub async fn acknowledge(&self, messages: &[ChatMessagePayload]) -> bool {
        let message_ids = unread_foreign(messages, self.local_user);
        if message_ids.is_empty() {
            return true;
        }
        let Ok(body) = serde_json::to_value(ReadReceiptPayload { message_ids }) else {
            return false;
        };
        self.channel
            .publish(&room_read_topic(self.room_id), body)
            .await
    }
}
