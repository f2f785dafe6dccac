use std::{cmp::Ordering, collections::HashMap};

use async_trait::async_trait;
use shared::{
    domain::{MessageId, RoomId},
    protocol::ChatMessagePayload,
};
use tokio::sync::{watch, Mutex};

use crate::error::ClientError;

/// One-shot historical fetch for a room, issued when a room is opened and
/// again by callers recovering from a connection outage.
#[async_trait]
pub trait HistorySource: Send + Sync {
    async fn room_messages(&self, room_id: RoomId) -> Result<Vec<ChatMessagePayload>, ClientError>;
}

struct LedgerEntry {
    message: ChatMessagePayload,
    seq: u64,
}

/// Merge reducer over the two message sources. The message id decides
/// identity, the timestamp decides order, so the merge is commutative: the
/// result is the same whichever of the historical fetch and the first live
/// delivery lands first.
#[derive(Default)]
pub struct MessageLedger {
    entries: HashMap<MessageId, LedgerEntry>,
    next_seq: u64,
}

impl MessageLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert-if-absent; a message whose id is already present is dropped,
    /// which covers live-before-history arrival and redelivery after a
    /// reconnect.
    pub fn insert(&mut self, message: ChatMessagePayload) -> bool {
        if self.entries.contains_key(&message.message_id) {
            return false;
        }
        let seq = self.next_seq;
        self.next_seq += 1;
        self.entries
            .insert(message.message_id, LedgerEntry { message, seq });
        true
    }

    pub fn insert_all(&mut self, messages: Vec<ChatMessagePayload>) -> bool {
        let mut changed = false;
        for message in messages {
            changed |= self.insert(message);
        }
        changed
    }

    /// Marks the listed ids as read. Ids that are unknown or already read are
    /// ignored, so repeated acknowledgement batches are harmless.
    pub fn mark_read(&mut self, ids: &[MessageId]) -> bool {
        let mut changed = false;
        for id in ids {
            if let Some(entry) = self.entries.get_mut(id) {
                if !entry.message.read_by_recipient {
                    entry.message.read_by_recipient = true;
                    changed = true;
                }
            }
        }
        changed
    }

    /// Messages ordered by timestamp ascending; entries without a timestamp
    /// sort last, ties fall back to arrival order.
    pub fn snapshot(&self) -> Vec<ChatMessagePayload> {
        let mut entries: Vec<&LedgerEntry> = self.entries.values().collect();
        entries.sort_by(|a, b| {
            match (a.message.sent_at, b.message.sent_at) {
                (Some(x), Some(y)) => x.cmp(&y),
                (Some(_), None) => Ordering::Less,
                (None, Some(_)) => Ordering::Greater,
                (None, None) => Ordering::Equal,
            }
            .then(a.seq.cmp(&b.seq))
        });
        entries.into_iter().map(|entry| entry.message.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Owns the merged view for one open room and publishes every change through
/// a watch channel.
pub struct RoomReconciler {
    room_id: RoomId,
    ledger: Mutex<MessageLedger>,
    updates_tx: watch::Sender<Vec<ChatMessagePayload>>,
}

impl RoomReconciler {
    pub fn new(room_id: RoomId) -> Self {
        let (updates_tx, _) = watch::channel(Vec::new());
        Self {
            room_id,
            ledger: Mutex::new(MessageLedger::new()),
            updates_tx,
        }
    }

    pub fn room_id(&self) -> RoomId {
        self.room_id
    }

    pub fn subscribe(&self) -> watch::Receiver<Vec<ChatMessagePayload>> {
        self.updates_tx.subscribe()
    }

    pub async fn ingest_history(&self, messages: Vec<ChatMessagePayload>) {
        let mut ledger = self.ledger.lock().await;
        if ledger.insert_all(messages) {
            self.updates_tx.send_replace(ledger.snapshot());
        }
    }

    /// Feed one live delivery. Bodies for other rooms are ignored; malformed
    /// bodies are surfaced as a protocol error.
    pub async fn ingest_live(&self, body: serde_json::Value) -> Result<(), ClientError> {
        let message: ChatMessagePayload = serde_json::from_value(body)
            .map_err(|err| ClientError::Protocol(format!("invalid chat message body: {err}")))?;
        if message.room_id != self.room_id {
            return Ok(());
        }
        let mut ledger = self.ledger.lock().await;
        if ledger.insert(message) {
            self.updates_tx.send_replace(ledger.snapshot());
        }
        Ok(())
    }

    pub async fn apply_receipt(&self, ids: &[MessageId]) {
        let mut ledger = self.ledger.lock().await;
        if ledger.mark_read(ids) {
            self.updates_tx.send_replace(ledger.snapshot());
        }
    }
}
