//! Data links, at most one per remote peer.
//!
//! A link starts `Opening` (outbound connect or inbound accept) and becomes
//! `Open` when the transport reports it. Sends issued while a link is
//! opening are queued in order and flushed on open; anything waiting on the
//! link is failed if it times out or closes first.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde::Serialize;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use carelink_net::transport::{LinkHandle, TransportError};
use carelink_shared::protocol::Payload;
use carelink_shared::types::{LinkId, PeerId};

use crate::error::LinkError;

/// Sending half of an open link. Each `send_batch` reaches the remote side
/// contiguously even when several tasks share the link.
#[derive(Debug, Clone)]
pub struct LinkWriter {
    handle: LinkHandle,
    lock: Arc<Mutex<()>>,
}

impl LinkWriter {
    fn new(handle: LinkHandle) -> Self {
        Self {
            handle,
            lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn id(&self) -> LinkId {
        self.handle.id()
    }

    pub fn remote(&self) -> &PeerId {
        self.handle.remote()
    }

    pub fn send_batch(&self, payloads: Vec<Payload>) -> Result<(), TransportError> {
        let _guard = self
            .lock
            .lock()
            .map_err(|e| TransportError::Failure(format!("Lock poisoned: {e}")))?;
        for payload in payloads {
            self.handle.send(payload)?;
        }
        Ok(())
    }
}

pub type LinkWaiter = oneshot::Sender<Result<LinkWriter, LinkError>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkStatus {
    Opening,
    Open,
}

#[derive(Debug)]
enum Phase {
    Opening {
        waiters: Vec<LinkWaiter>,
        queued: Vec<Vec<Payload>>,
    },
    Open,
}

#[derive(Debug)]
struct LinkEntry {
    writer: LinkWriter,
    phase: Phase,
}

impl LinkEntry {
    fn opening(handle: LinkHandle) -> Self {
        Self {
            writer: LinkWriter::new(handle),
            phase: Phase::Opening {
                waiters: Vec::new(),
                queued: Vec::new(),
            },
        }
    }

    fn status(&self) -> LinkStatus {
        match self.phase {
            Phase::Opening { .. } => LinkStatus::Opening,
            Phase::Open => LinkStatus::Open,
        }
    }
}

/// What became of a link the remote side opened to us.
#[derive(Debug)]
pub enum IncomingDecision {
    /// Registered; wait for it to open.
    Accepted,
    /// Registered in place of our own still-opening link, which must be
    /// closed.
    Replaced(LinkHandle),
    /// A link to this peer already exists; close the newcomer.
    Rejected(LinkHandle),
}

/// A link that just opened, with everything that was waiting on it.
#[derive(Debug)]
pub struct Opened {
    pub peer: PeerId,
    pub writer: LinkWriter,
    pub waiters: Vec<LinkWaiter>,
    pub queued: Vec<Vec<Payload>>,
}

/// A link removed from the registry.
#[derive(Debug)]
pub struct Dropped {
    pub peer: PeerId,
    pub handle: LinkHandle,
    pub waiters: Vec<LinkWaiter>,
    pub queued: usize,
}

impl Dropped {
    /// Fail every waiter with `error`.
    pub fn fail_waiters(&mut self, error: &LinkError) {
        for waiter in self.waiters.drain(..) {
            let _ = waiter.send(Err(error.clone()));
        }
    }
}

#[derive(Debug, Default)]
pub struct LinkRegistry {
    links: HashMap<PeerId, LinkEntry>,
    by_id: HashMap<LinkId, PeerId>,
}

impl LinkRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn status(&self, peer: &PeerId) -> Option<LinkStatus> {
        self.links.get(peer).map(LinkEntry::status)
    }

    pub fn link_id(&self, peer: &PeerId) -> Option<LinkId> {
        self.links.get(peer).map(|e| e.writer.id())
    }

    pub fn peer_for(&self, link: LinkId) -> Option<&PeerId> {
        self.by_id.get(&link)
    }

    /// The writer of an open link to `peer`.
    pub fn writer(&self, peer: &PeerId) -> Option<LinkWriter> {
        self.links
            .get(peer)
            .filter(|e| matches!(e.phase, Phase::Open))
            .map(|e| e.writer.clone())
    }

    pub fn summaries(&self) -> Vec<(PeerId, LinkId, LinkStatus)> {
        let mut out: Vec<_> = self
            .links
            .iter()
            .map(|(peer, e)| (peer.clone(), e.writer.id(), e.status()))
            .collect();
        out.sort_by(|a, b| a.0.cmp(&b.0));
        out
    }

    /// Register the link we just opened to its remote peer. The caller
    /// checks beforehand that no link to that peer exists.
    pub fn insert_outgoing(&mut self, handle: LinkHandle) {
        let peer = handle.remote().clone();
        debug!(peer = %peer.short(), link = %handle.id(), "Data link opening");
        self.by_id.insert(handle.id(), peer.clone());
        self.links.insert(peer, LinkEntry::opening(handle));
    }

    /// Register a link opened by the remote side. When both sides connect
    /// at once, the link initiated by the peer with the lower id wins.
    pub fn accept_incoming(&mut self, handle: LinkHandle, local: &PeerId) -> IncomingDecision {
        let peer = handle.remote().clone();
        let Some(existing) = self.links.get_mut(&peer) else {
            debug!(peer = %peer.short(), link = %handle.id(), "Accepted data link");
            self.by_id.insert(handle.id(), peer.clone());
            self.links.insert(peer, LinkEntry::opening(handle));
            return IncomingDecision::Accepted;
        };

        let replace = matches!(existing.phase, Phase::Opening { .. }) && *local > peer;
        if !replace {
            info!(peer = %peer.short(), link = %handle.id(), "Rejected duplicate data link");
            return IncomingDecision::Rejected(handle);
        }

        info!(
            peer = %peer.short(),
            link = %handle.id(),
            replaced = %existing.writer.id(),
            "Simultaneous connect, adopting remote link"
        );
        let old = std::mem::replace(&mut existing.writer, LinkWriter::new(handle.clone()));
        self.by_id.remove(&old.id());
        self.by_id.insert(handle.id(), peer);
        IncomingDecision::Replaced(old.handle)
    }

    /// Wait for the link to `peer` to open. Resolves at once when it is
    /// already open. Returns `false` when there is no such link.
    pub fn add_waiter(&mut self, peer: &PeerId, waiter: LinkWaiter) -> bool {
        let Some(entry) = self.links.get_mut(peer) else {
            return false;
        };
        match &mut entry.phase {
            Phase::Opening { waiters, .. } => waiters.push(waiter),
            Phase::Open => {
                let _ = waiter.send(Ok(entry.writer.clone()));
            }
        }
        true
    }

    /// Hold `batch` until the link to `peer` opens. Hands the batch back
    /// when the link is not opening.
    pub fn enqueue(&mut self, peer: &PeerId, batch: Vec<Payload>) -> Result<(), Vec<Payload>> {
        match self.links.get_mut(peer).map(|e| &mut e.phase) {
            Some(Phase::Opening { queued, .. }) => {
                queued.push(batch);
                Ok(())
            }
            _ => Err(batch),
        }
    }

    /// The transport reported `link` open.
    pub fn on_open(&mut self, link: LinkId) -> Option<Opened> {
        let peer = self.by_id.get(&link)?.clone();
        let entry = self.links.get_mut(&peer)?;
        match std::mem::replace(&mut entry.phase, Phase::Open) {
            Phase::Opening { waiters, queued } => Some(Opened {
                peer,
                writer: entry.writer.clone(),
                waiters,
                queued,
            }),
            Phase::Open => None,
        }
    }

    /// Drop `link` if it is still the registered link for its peer.
    pub fn on_closed(&mut self, link: LinkId) -> Option<Dropped> {
        let peer = self.by_id.get(&link)?.clone();
        self.remove(&peer)
    }

    /// Drop the link to `peer` if `link` is still registered and has not
    /// opened yet.
    pub fn on_timeout(&mut self, peer: &PeerId, link: LinkId) -> Option<Dropped> {
        let entry = self.links.get(peer)?;
        if entry.writer.id() != link || entry.status() != LinkStatus::Opening {
            return None;
        }
        warn!(peer = %peer.short(), link = %link, "Data link open timed out");
        self.remove(peer)
    }

    pub fn remove(&mut self, peer: &PeerId) -> Option<Dropped> {
        let entry = self.links.remove(peer)?;
        self.by_id.remove(&entry.writer.id());
        let (waiters, queued) = match entry.phase {
            Phase::Opening { waiters, queued } => (waiters, queued.len()),
            Phase::Open => (Vec::new(), 0),
        };
        Some(Dropped {
            peer: peer.clone(),
            handle: entry.writer.handle,
            waiters,
            queued,
        })
    }

    pub fn drain(&mut self) -> Vec<Dropped> {
        let peers: Vec<PeerId> = self.links.keys().cloned().collect();
        peers.iter().filter_map(|p| self.remove(p)).collect()
    }
}
