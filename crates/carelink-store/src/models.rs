//! Records persisted in the local database.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use carelink_shared::types::PeerId;

/// One entry of a conversation's history. Attachment bytes are not kept.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StoredMessage {
    pub id: Uuid,
    /// The remote side of the conversation this message belongs to.
    pub peer: PeerId,
    pub sender: PeerId,
    pub text: String,
    pub timestamp: DateTime<Utc>,
    pub attachment: Option<StoredAttachment>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StoredAttachment {
    pub name: String,
    pub mime_type: String,
    pub size: u64,
}
