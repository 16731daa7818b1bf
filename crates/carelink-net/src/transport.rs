//! Transport adapter over an external peer-to-peer connection library.
//!
//! The library itself (signaling, ICE, media encoding) lives behind the
//! [`Transport`], [`MediaCall`] and [`DataChannel`] traits. Everything it
//! reports comes back as a [`TransportEvent`] on a single unbounded channel,
//! so the session actor can process events one at a time in arrival order.

use std::fmt;
use std::sync::Arc;

use futures::future::BoxFuture;
use thiserror::Error;
use tracing::{debug, info, warn};

use carelink_shared::protocol::Payload;
use carelink_shared::stream::MediaStream;
use carelink_shared::types::{CallId, LinkId, PeerId};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("Transport is not open")]
    NotOpen,

    #[error("Peer id {0} is unavailable")]
    IdUnavailable(PeerId),

    #[error("Unknown peer: {0}")]
    UnknownPeer(PeerId),

    #[error("Cannot connect to self")]
    SelfConnect,

    #[error("Channel is not open yet")]
    ChannelNotOpen,

    #[error("Channel closed")]
    ChannelClosed,

    #[error("Transport failure: {0}")]
    Failure(String),
}

/// One media call object handed out by the transport.
pub trait MediaCall: Send + Sync + fmt::Debug {
    fn id(&self) -> CallId;
    fn remote(&self) -> &PeerId;
    /// Answer an incoming call with the local stream.
    fn answer(&self, stream: &MediaStream) -> Result<(), TransportError>;
    fn close(&self);
}

/// One logical data connection handed out by the transport.
pub trait DataChannel: Send + Sync + fmt::Debug {
    fn id(&self) -> LinkId;
    fn remote(&self) -> &PeerId;
    fn is_open(&self) -> bool;
    fn send(&self, payload: Payload) -> Result<(), TransportError>;
    fn close(&self);
}

pub type CallHandle = Arc<dyn MediaCall>;
pub type LinkHandle = Arc<dyn DataChannel>;

/// The connection object of the peer-to-peer library.
pub trait Transport: Send + Sync + 'static {
    /// Register with the signaling service, optionally asking for a
    /// specific id. Resolves to the id actually assigned.
    fn open(&self, requested: Option<PeerId>) -> BoxFuture<'static, Result<PeerId, TransportError>>;
    fn call(&self, remote: &PeerId, stream: &MediaStream) -> Result<CallHandle, TransportError>;
    fn connect(&self, remote: &PeerId) -> Result<LinkHandle, TransportError>;
    fn shutdown(&self);
}

/// Everything the transport reports back.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// A remote peer is calling us.
    IncomingCall(CallHandle),
    /// The remote side's stream arrived on a call.
    CallStream { call: CallId, stream: MediaStream },
    CallClosed { call: CallId },
    CallError { call: CallId, message: String },
    /// A remote peer opened a data link to us.
    IncomingLink(LinkHandle),
    LinkOpen { link: LinkId },
    LinkData { link: LinkId, payload: Payload },
    LinkClosed { link: LinkId },
    LinkError { link: LinkId, message: String },
}

/// Owns the transport connection object and the local peer identity.
pub struct TransportAdapter {
    transport: Arc<dyn Transport>,
    local_id: Option<PeerId>,
}

impl TransportAdapter {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            local_id: None,
        }
    }

    /// Open the transport, reusing `stored` when the signaling service
    /// still grants it. Falls back to a freshly assigned id otherwise.
    pub async fn open(&mut self, stored: Option<PeerId>) -> Result<PeerId, TransportError> {
        let id = match self.transport.open(stored.clone()).await {
            Ok(id) => id,
            Err(TransportError::IdUnavailable(taken)) => {
                warn!(peer = %taken, "Stored peer id unavailable, requesting a new one");
                self.transport.open(None).await?
            }
            Err(e) => return Err(e),
        };

        if let Some(stored) = stored.as_ref().filter(|s| **s != id) {
            warn!(stored = %stored, assigned = %id, "Transport assigned a different peer id");
        }

        info!(peer = %id, "Transport open");
        self.local_id = Some(id.clone());
        Ok(id)
    }

    pub fn local_id(&self) -> Option<&PeerId> {
        self.local_id.as_ref()
    }

    fn check_remote(&self, remote: &PeerId) -> Result<(), TransportError> {
        match &self.local_id {
            None => Err(TransportError::NotOpen),
            Some(local) if local == remote => Err(TransportError::SelfConnect),
            Some(_) => Ok(()),
        }
    }

    /// Start an outgoing call carrying `stream`.
    pub fn call(&self, remote: &PeerId, stream: &MediaStream) -> Result<CallHandle, TransportError> {
        self.check_remote(remote)?;
        debug!(peer = %remote.short(), "Placing call");
        self.transport.call(remote, stream)
    }

    pub fn accept(&self, pending: &CallHandle, stream: &MediaStream) -> Result<(), TransportError> {
        debug!(peer = %pending.remote().short(), call = %pending.id(), "Answering call");
        pending.answer(stream)
    }

    pub fn decline(&self, pending: &CallHandle) {
        debug!(peer = %pending.remote().short(), call = %pending.id(), "Declining call");
        pending.close();
    }

    pub fn connect(&self, remote: &PeerId) -> Result<LinkHandle, TransportError> {
        self.check_remote(remote)?;
        debug!(peer = %remote.short(), "Opening data link");
        self.transport.connect(remote)
    }

    pub fn shutdown(&mut self) {
        if let Some(id) = self.local_id.take() {
            info!(peer = %id, "Shutting down transport");
        }
        self.transport.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loopback::LoopbackHub;

    #[tokio::test]
    async fn open_reuses_stored_id() {
        let hub = LoopbackHub::new();
        let (transport, _events) = hub.transport();
        let mut adapter = TransportAdapter::new(Arc::new(transport));

        let id = adapter.open(Some(PeerId::new("peer-1"))).await.unwrap();
        assert_eq!(id, PeerId::new("peer-1"));
        assert_eq!(adapter.local_id(), Some(&id));
    }

    #[tokio::test]
    async fn open_falls_back_when_stored_id_taken() {
        let hub = LoopbackHub::new();
        let (first, _e1) = hub.transport();
        let (second, _e2) = hub.transport();
        TransportAdapter::new(Arc::new(first))
            .open(Some(PeerId::new("peer-1")))
            .await
            .unwrap();

        let mut adapter = TransportAdapter::new(Arc::new(second));
        let id = adapter.open(Some(PeerId::new("peer-1"))).await.unwrap();
        assert_ne!(id, PeerId::new("peer-1"));
    }

    #[tokio::test]
    async fn connect_requires_open_and_rejects_self() {
        let hub = LoopbackHub::new();
        let (transport, _events) = hub.transport();
        let mut adapter = TransportAdapter::new(Arc::new(transport));

        assert_eq!(
            adapter.connect(&PeerId::new("x")).unwrap_err(),
            TransportError::NotOpen
        );
        adapter.open(Some(PeerId::new("me"))).await.unwrap();
        assert_eq!(
            adapter.connect(&PeerId::new("me")).unwrap_err(),
            TransportError::SelfConnect
        );
    }
}
