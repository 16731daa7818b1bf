//! In-process transport connecting any number of local peers.
//!
//! Every peer registered on a [`LoopbackHub`] gets its own event channel.
//! Calls and links are modelled as shared pairs; each side's handle emits
//! events to the opposite side in the order the operations happen. The hub
//! doubles as a presence directory listing every registered peer.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use futures::future::{self, BoxFuture};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tracing::debug;

use carelink_shared::protocol::Payload;
use carelink_shared::stream::MediaStream;
use carelink_shared::types::{CallId, LinkId, PeerId};

use crate::presence::{DirectoryClient, PresenceError};
use crate::transport::{
    CallHandle, DataChannel, LinkHandle, MediaCall, Transport, TransportError, TransportEvent,
};

#[derive(Default)]
struct HubState {
    peers: HashMap<PeerId, UnboundedSender<TransportEvent>>,
    next_anonymous: u64,
    hold_link_open: bool,
}

/// Shared registry of loopback peers.
#[derive(Clone, Default)]
pub struct LoopbackHub {
    state: Arc<Mutex<HubState>>,
    next_object_id: Arc<AtomicU64>,
}

impl LoopbackHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an unregistered transport and the receiver for its events.
    pub fn transport(&self) -> (LoopbackTransport, UnboundedReceiver<TransportEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let transport = LoopbackTransport {
            hub: self.clone(),
            events: tx,
            local: Mutex::new(None),
        };
        (transport, rx)
    }

    /// When set, new links never report `LinkOpen`, simulating a peer
    /// that does not complete the handshake.
    pub fn hold_link_open(&self, hold: bool) {
        if let Ok(mut state) = self.state.lock() {
            state.hold_link_open = hold;
        }
    }

    /// Ids of all registered peers, sorted.
    pub fn peer_ids(&self) -> Vec<PeerId> {
        let mut ids: Vec<PeerId> = self
            .state
            .lock()
            .map(|s| s.peers.keys().cloned().collect())
            .unwrap_or_default();
        ids.sort();
        ids
    }

    fn sender_for(&self, peer: &PeerId) -> Result<UnboundedSender<TransportEvent>, TransportError> {
        let state = self
            .state
            .lock()
            .map_err(|e| TransportError::Failure(format!("Lock poisoned: {e}")))?;
        state
            .peers
            .get(peer)
            .cloned()
            .ok_or_else(|| TransportError::UnknownPeer(peer.clone()))
    }

    fn holds_link_open(&self) -> bool {
        self.state.lock().map(|s| s.hold_link_open).unwrap_or(false)
    }

    fn next_id(&self) -> u64 {
        self.next_object_id.fetch_add(1, Ordering::Relaxed) + 1
    }
}

impl DirectoryClient for LoopbackHub {
    fn fetch(&self) -> BoxFuture<'_, Result<Vec<PeerId>, PresenceError>> {
        Box::pin(future::ready(Ok(self.peer_ids())))
    }
}

/// One peer's view of the hub.
pub struct LoopbackTransport {
    hub: LoopbackHub,
    events: UnboundedSender<TransportEvent>,
    local: Mutex<Option<PeerId>>,
}

impl LoopbackTransport {
    fn local_id(&self) -> Result<PeerId, TransportError> {
        self.local
            .lock()
            .map_err(|e| TransportError::Failure(format!("Lock poisoned: {e}")))?
            .clone()
            .ok_or(TransportError::NotOpen)
    }

    fn register(&self, requested: Option<PeerId>) -> Result<PeerId, TransportError> {
        let mut state = self
            .hub
            .state
            .lock()
            .map_err(|e| TransportError::Failure(format!("Lock poisoned: {e}")))?;

        let id = match requested {
            Some(id) if state.peers.contains_key(&id) => {
                return Err(TransportError::IdUnavailable(id));
            }
            Some(id) => id,
            None => loop {
                state.next_anonymous += 1;
                let candidate = PeerId::new(format!("loopback-{}", state.next_anonymous));
                if !state.peers.contains_key(&candidate) {
                    break candidate;
                }
            },
        };

        state.peers.insert(id.clone(), self.events.clone());
        drop(state);

        if let Ok(mut local) = self.local.lock() {
            *local = Some(id.clone());
        }
        debug!(peer = %id, "Loopback peer registered");
        Ok(id)
    }
}

impl Transport for LoopbackTransport {
    fn open(&self, requested: Option<PeerId>) -> BoxFuture<'static, Result<PeerId, TransportError>> {
        Box::pin(future::ready(self.register(requested)))
    }

    fn call(&self, remote: &PeerId, stream: &MediaStream) -> Result<CallHandle, TransportError> {
        let local = self.local_id()?;
        let remote_tx = self.hub.sender_for(remote)?;

        let pair = Arc::new(CallPair {
            id: CallId(self.hub.next_id()),
            caller: local,
            callee: remote.clone(),
            caller_tx: self.events.clone(),
            callee_tx: remote_tx,
            caller_stream: stream.clone(),
            closed: AtomicBool::new(false),
        });

        let incoming: CallHandle = Arc::new(LoopbackCall {
            pair: pair.clone(),
            side: Side::Acceptor,
        });
        let _ = pair.callee_tx.send(TransportEvent::IncomingCall(incoming));

        Ok(Arc::new(LoopbackCall {
            pair,
            side: Side::Initiator,
        }))
    }

    fn connect(&self, remote: &PeerId) -> Result<LinkHandle, TransportError> {
        let local = self.local_id()?;
        let remote_tx = self.hub.sender_for(remote)?;

        let pair = Arc::new(LinkPair {
            id: LinkId(self.hub.next_id()),
            initiator: local,
            acceptor: remote.clone(),
            initiator_tx: self.events.clone(),
            acceptor_tx: remote_tx,
            open: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        });

        let incoming: LinkHandle = Arc::new(LoopbackLink {
            pair: pair.clone(),
            side: Side::Acceptor,
        });
        let _ = pair.acceptor_tx.send(TransportEvent::IncomingLink(incoming));

        if !self.hub.holds_link_open() {
            pair.open.store(true, Ordering::Release);
            let _ = pair.acceptor_tx.send(TransportEvent::LinkOpen { link: pair.id });
            let _ = pair.initiator_tx.send(TransportEvent::LinkOpen { link: pair.id });
        }

        Ok(Arc::new(LoopbackLink {
            pair,
            side: Side::Initiator,
        }))
    }

    fn shutdown(&self) {
        let Ok(mut local) = self.local.lock() else {
            return;
        };
        if let Some(id) = local.take() {
            if let Ok(mut state) = self.hub.state.lock() {
                state.peers.remove(&id);
            }
            debug!(peer = %id, "Loopback peer unregistered");
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Side {
    Initiator,
    Acceptor,
}

#[derive(Debug)]
struct CallPair {
    id: CallId,
    caller: PeerId,
    callee: PeerId,
    caller_tx: UnboundedSender<TransportEvent>,
    callee_tx: UnboundedSender<TransportEvent>,
    caller_stream: MediaStream,
    closed: AtomicBool,
}

#[derive(Debug)]
struct LoopbackCall {
    pair: Arc<CallPair>,
    side: Side,
}

impl MediaCall for LoopbackCall {
    fn id(&self) -> CallId {
        self.pair.id
    }

    fn remote(&self) -> &PeerId {
        match self.side {
            Side::Initiator => &self.pair.callee,
            Side::Acceptor => &self.pair.caller,
        }
    }

    fn answer(&self, stream: &MediaStream) -> Result<(), TransportError> {
        if self.side != Side::Acceptor {
            return Err(TransportError::Failure("Only the callee can answer".into()));
        }
        if self.pair.closed.load(Ordering::Acquire) {
            return Err(TransportError::ChannelClosed);
        }
        let id = self.pair.id;
        let _ = self.pair.callee_tx.send(TransportEvent::CallStream {
            call: id,
            stream: self.pair.caller_stream.clone(),
        });
        let _ = self.pair.caller_tx.send(TransportEvent::CallStream {
            call: id,
            stream: stream.clone(),
        });
        Ok(())
    }

    fn close(&self) {
        if self.pair.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let id = self.pair.id;
        let _ = self.pair.caller_tx.send(TransportEvent::CallClosed { call: id });
        let _ = self.pair.callee_tx.send(TransportEvent::CallClosed { call: id });
    }
}

#[derive(Debug)]
struct LinkPair {
    id: LinkId,
    initiator: PeerId,
    acceptor: PeerId,
    initiator_tx: UnboundedSender<TransportEvent>,
    acceptor_tx: UnboundedSender<TransportEvent>,
    open: AtomicBool,
    closed: AtomicBool,
}

#[derive(Debug)]
struct LoopbackLink {
    pair: Arc<LinkPair>,
    side: Side,
}

impl DataChannel for LoopbackLink {
    fn id(&self) -> LinkId {
        self.pair.id
    }

    fn remote(&self) -> &PeerId {
        match self.side {
            Side::Initiator => &self.pair.acceptor,
            Side::Acceptor => &self.pair.initiator,
        }
    }

    fn is_open(&self) -> bool {
        self.pair.open.load(Ordering::Acquire) && !self.pair.closed.load(Ordering::Acquire)
    }

    fn send(&self, payload: Payload) -> Result<(), TransportError> {
        if self.pair.closed.load(Ordering::Acquire) {
            return Err(TransportError::ChannelClosed);
        }
        if !self.pair.open.load(Ordering::Acquire) {
            return Err(TransportError::ChannelNotOpen);
        }
        let target = match self.side {
            Side::Initiator => &self.pair.acceptor_tx,
            Side::Acceptor => &self.pair.initiator_tx,
        };
        target
            .send(TransportEvent::LinkData {
                link: self.pair.id,
                payload,
            })
            .map_err(|_| TransportError::ChannelClosed)
    }

    fn close(&self) {
        if self.pair.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let id = self.pair.id;
        let _ = self.pair.initiator_tx.send(TransportEvent::LinkClosed { link: id });
        let _ = self.pair.acceptor_tx.send(TransportEvent::LinkClosed { link: id });
    }
}
