//! Cloneable handle the view layer uses to drive the client actor.

use std::path::Path;

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};
use tracing::debug;
use uuid::Uuid;

use carelink_shared::constants::DEFAULT_MIME_TYPE;
use carelink_shared::types::PeerId;
use carelink_shared::ProtocolError;

use crate::chat::ChatMessage;
use crate::error::ClientError;
use crate::events::ClientSnapshot;

pub type Reply<T> = oneshot::Sender<Result<T, ClientError>>;

/// Commands sent *into* the client task.
#[derive(Debug)]
pub enum ClientCommand {
    Call {
        peer: PeerId,
        reply: Reply<()>,
    },
    AcceptCall(Reply<()>),
    DeclineCall(Reply<()>),
    ToggleHold(Reply<bool>),
    ToggleMute(Reply<bool>),
    EndCall(Reply<()>),
    /// Open (or reuse) the data link to a peer and wait until it is usable.
    Connect {
        peer: PeerId,
        reply: Reply<()>,
    },
    SendText {
        peer: PeerId,
        text: String,
        reply: Reply<ChatMessage>,
    },
    SendFile {
        peer: PeerId,
        name: String,
        mime_type: String,
        data: Bytes,
        /// Caption sent with the file. `None` or blank uses a default.
        text: Option<String>,
        reply: Reply<ChatMessage>,
    },
    CancelFile {
        message_id: Uuid,
        reply: Reply<()>,
    },
    OpenConversation {
        peer: PeerId,
        reply: Reply<Vec<ChatMessage>>,
    },
    MinimizeConversation {
        peer: PeerId,
        reply: Reply<()>,
    },
    CloseConversation {
        peer: PeerId,
        reply: Reply<()>,
    },
    Snapshot(Reply<ClientSnapshot>),
    /// Forget the persisted peer id and stop the client.
    Logout(Reply<()>),
    Shutdown(Reply<()>),
}

#[derive(Debug, Clone)]
pub struct ClientHandle {
    cmd_tx: mpsc::Sender<ClientCommand>,
    max_file_size: usize,
}

impl ClientHandle {
    pub(crate) fn new(cmd_tx: mpsc::Sender<ClientCommand>, max_file_size: usize) -> Self {
        Self {
            cmd_tx,
            max_file_size,
        }
    }

    async fn request<T>(
        &self,
        command: impl FnOnce(Reply<T>) -> ClientCommand,
    ) -> Result<T, ClientError> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(command(reply))
            .await
            .map_err(|_| ClientError::Closed)?;
        rx.await.map_err(|_| ClientError::Closed)?
    }

    /// Ring `peer`. Resolves once the call is ringing, not when it is answered.
    pub async fn call(&self, peer: PeerId) -> Result<(), ClientError> {
        self.request(|reply| ClientCommand::Call { peer, reply }).await
    }

    pub async fn accept_call(&self) -> Result<(), ClientError> {
        self.request(ClientCommand::AcceptCall).await
    }

    pub async fn decline_call(&self) -> Result<(), ClientError> {
        self.request(ClientCommand::DeclineCall).await
    }

    /// Returns `true` when the call is now on hold.
    pub async fn toggle_hold(&self) -> Result<bool, ClientError> {
        self.request(ClientCommand::ToggleHold).await
    }

    /// Returns `true` when the microphone is now muted.
    pub async fn toggle_mute(&self) -> Result<bool, ClientError> {
        self.request(ClientCommand::ToggleMute).await
    }

    /// Hang up. Does nothing when no call is in progress.
    pub async fn end_call(&self) -> Result<(), ClientError> {
        self.request(ClientCommand::EndCall).await
    }

    pub async fn connect(&self, peer: PeerId) -> Result<(), ClientError> {
        self.request(|reply| ClientCommand::Connect { peer, reply }).await
    }

    pub async fn send_text(
        &self,
        peer: PeerId,
        text: impl Into<String>,
    ) -> Result<ChatMessage, ClientError> {
        let text = text.into();
        self.request(|reply| ClientCommand::SendText { peer, text, reply })
            .await
    }

    /// Send a file from disk. The size is checked before the file is read.
    /// Without a caption the message reads `Sending file: <name>`.
    pub async fn send_file(
        &self,
        peer: PeerId,
        path: &Path,
        mime_type: Option<&str>,
        text: Option<&str>,
    ) -> Result<ChatMessage, ClientError> {
        let size = tokio::fs::metadata(path).await?.len();
        if size > self.max_file_size as u64 {
            return Err(ProtocolError::AttachmentTooLarge {
                size,
                max: self.max_file_size as u64,
            }
            .into());
        }

        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("unknown")
            .to_string();
        let data = tokio::fs::read(path).await?;
        debug!(path = %path.display(), size = data.len(), "Read file for sending");

        self.send_file_bytes(
            peer,
            name,
            mime_type.unwrap_or(DEFAULT_MIME_TYPE),
            Bytes::from(data),
            text,
        )
        .await
    }

    pub async fn send_file_bytes(
        &self,
        peer: PeerId,
        name: impl Into<String>,
        mime_type: impl Into<String>,
        data: Bytes,
        text: Option<&str>,
    ) -> Result<ChatMessage, ClientError> {
        let name = name.into();
        let mime_type = mime_type.into();
        let text = text.map(str::to_string);
        self.request(|reply| ClientCommand::SendFile {
            peer,
            name,
            mime_type,
            data,
            text,
            reply,
        })
        .await
    }

    /// Stop an outgoing transfer and tell the receiver to discard it.
    pub async fn cancel_file(&self, message_id: Uuid) -> Result<(), ClientError> {
        self.request(|reply| ClientCommand::CancelFile { message_id, reply })
            .await
    }

    /// Show the conversation with `peer`, clearing its badge. Returns the
    /// conversation log.
    pub async fn open_conversation(&self, peer: PeerId) -> Result<Vec<ChatMessage>, ClientError> {
        self.request(|reply| ClientCommand::OpenConversation { peer, reply })
            .await
    }

    pub async fn minimize_conversation(&self, peer: PeerId) -> Result<(), ClientError> {
        self.request(|reply| ClientCommand::MinimizeConversation { peer, reply })
            .await
    }

    /// Close the conversation view and the data link behind it. The log
    /// is kept.
    pub async fn close_conversation(&self, peer: PeerId) -> Result<(), ClientError> {
        self.request(|reply| ClientCommand::CloseConversation { peer, reply })
            .await
    }

    pub async fn snapshot(&self) -> Result<ClientSnapshot, ClientError> {
        self.request(ClientCommand::Snapshot).await
    }

    pub async fn logout(&self) -> Result<(), ClientError> {
        self.request(ClientCommand::Logout).await
    }

    pub async fn shutdown(&self) -> Result<(), ClientError> {
        self.request(ClientCommand::Shutdown).await
    }
}
