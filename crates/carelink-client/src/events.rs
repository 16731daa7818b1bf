//! Notifications emitted by the client to the view layer.

use std::collections::BTreeMap;

use serde::Serialize;
use uuid::Uuid;

use carelink_media::CallSnapshot;
use carelink_shared::stream::MediaStream;
use carelink_shared::types::{LinkId, PeerId};

use crate::badges::ConversationView;
use crate::chat::{ChatMessage, LinkStatus};

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ClientEvent {
    PeerJoined {
        peer: PeerId,
    },
    PeerLeft {
        peer: PeerId,
    },
    DirectoryUnavailable {
        error: String,
        retry_in_ms: u64,
    },
    DirectoryRestored,

    CallStateChanged(CallSnapshot),
    IncomingCall {
        from: PeerId,
    },
    /// An incoming call was declined because another call was in progress.
    MissedCall {
        from: PeerId,
    },
    RemoteStream {
        peer: PeerId,
        has_video: bool,
        #[serde(skip)]
        stream: MediaStream,
    },
    CallFailed {
        peer: PeerId,
        error: String,
    },
    MediaError {
        error: String,
    },

    MessageReceived {
        peer: PeerId,
        message: ChatMessage,
    },
    MessageSent {
        peer: PeerId,
        message: ChatMessage,
    },
    BadgeChanged {
        peer: PeerId,
        unread: bool,
    },

    LinkOpened {
        peer: PeerId,
        link: LinkId,
    },
    LinkClosed {
        peer: PeerId,
        link: LinkId,
    },
    LinkError {
        peer: PeerId,
        error: String,
    },

    TransferProgress {
        message_id: Uuid,
        peer: PeerId,
        done: u32,
        total: u32,
        outgoing: bool,
    },
    TransferCompleted {
        message_id: Uuid,
        peer: PeerId,
        outgoing: bool,
    },
    TransferAbandoned {
        message_id: Uuid,
        peer: PeerId,
        reason: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LinkSummary {
    pub peer: PeerId,
    pub link: LinkId,
    pub status: LinkStatus,
}

/// Everything the view layer renders, captured at one instant.
#[derive(Debug, Clone, Serialize)]
pub struct ClientSnapshot {
    pub local_id: PeerId,
    pub call: CallSnapshot,
    pub online: Vec<PeerId>,
    pub conversations: BTreeMap<PeerId, Vec<ChatMessage>>,
    pub unread: Vec<PeerId>,
    pub open_conversations: Vec<ConversationView>,
    pub links: Vec<LinkSummary>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_serialize_with_tag() {
        let event = ClientEvent::BadgeChanged {
            peer: PeerId::new("peer-2"),
            unread: true,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "badge_changed");
        assert_eq!(json["peer"], "peer-2");
        assert_eq!(json["unread"], true);
    }

    #[test]
    fn remote_stream_omits_the_stream() {
        let event = ClientEvent::RemoteStream {
            peer: PeerId::new("peer-2"),
            has_video: false,
            stream: MediaStream::new(Vec::new()),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert!(json.get("stream").is_none());
    }
}
