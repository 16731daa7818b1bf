//! Chat messages and the per-peer append-only conversation logs.

use std::collections::{BTreeMap, HashSet};

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use carelink_shared::protocol::FileMessageMeta;
use carelink_shared::types::PeerId;
use carelink_store::{StoredAttachment, StoredMessage};

/// A file carried by a chat message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Attachment {
    pub name: String,
    pub mime_type: String,
    pub size: u64,
    /// Empty for attachments restored from history.
    #[serde(skip)]
    pub data: Bytes,
}

/// One immutable entry of a conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChatMessage {
    pub id: Uuid,
    pub sender: PeerId,
    pub text: String,
    pub timestamp: DateTime<Utc>,
    pub attachment: Option<Attachment>,
}

impl ChatMessage {
    pub fn text(sender: PeerId, text: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            sender,
            text: text.into(),
            timestamp: Utc::now(),
            attachment: None,
        }
    }

    /// Build the message a file transfer delivers, with `sender` taken
    /// from the link it arrived on.
    pub fn from_file(sender: PeerId, meta: FileMessageMeta, data: Bytes) -> Self {
        Self {
            id: meta.id,
            sender,
            text: meta.text,
            timestamp: meta.timestamp,
            attachment: Some(Attachment {
                name: meta.attachment.name,
                mime_type: meta.attachment.mime_type,
                size: meta.attachment.size,
                data,
            }),
        }
    }

    pub fn to_stored(&self, peer: &PeerId) -> StoredMessage {
        StoredMessage {
            id: self.id,
            peer: peer.clone(),
            sender: self.sender.clone(),
            text: self.text.clone(),
            timestamp: self.timestamp,
            attachment: self.attachment.as_ref().map(|a| StoredAttachment {
                name: a.name.clone(),
                mime_type: a.mime_type.clone(),
                size: a.size,
            }),
        }
    }

    pub fn from_stored(stored: StoredMessage) -> Self {
        Self {
            id: stored.id,
            sender: stored.sender,
            text: stored.text,
            timestamp: stored.timestamp,
            attachment: stored.attachment.map(|a| Attachment {
                name: a.name,
                mime_type: a.mime_type,
                size: a.size,
                data: Bytes::new(),
            }),
        }
    }
}

/// Conversation logs keyed by remote peer. Messages are kept in append
/// order and each id is accepted once.
#[derive(Debug, Default)]
pub struct Conversations {
    logs: BTreeMap<PeerId, Vec<ChatMessage>>,
    seen: HashSet<Uuid>,
    loaded: HashSet<PeerId>,
}

impl Conversations {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_loaded(&self, peer: &PeerId) -> bool {
        self.loaded.contains(peer)
    }

    /// Put persisted history in front of anything appended this session.
    pub fn restore(&mut self, peer: &PeerId, history: Vec<ChatMessage>) {
        self.loaded.insert(peer.clone());
        let history: Vec<ChatMessage> = history
            .into_iter()
            .filter(|m| self.seen.insert(m.id))
            .collect();
        if history.is_empty() {
            return;
        }
        let log = self.logs.entry(peer.clone()).or_default();
        let live = std::mem::replace(log, history);
        log.extend(live);
    }

    /// Append `message` to the conversation with `peer`. Returns `false`
    /// when a message with the same id was already recorded.
    pub fn append(&mut self, peer: &PeerId, message: ChatMessage) -> bool {
        if !self.seen.insert(message.id) {
            return false;
        }
        self.logs.entry(peer.clone()).or_default().push(message);
        true
    }

    pub fn log(&self, peer: &PeerId) -> &[ChatMessage] {
        self.logs.get(peer).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn all(&self) -> &BTreeMap<PeerId, Vec<ChatMessage>> {
        &self.logs
    }
}
