//! The client actor.
//!
//! One tokio task owns the call session, the data links, inbound and
//! outbound transfers, conversations and badges. Everything reaches it as
//! a message (UI commands, transport events, presence updates, finished
//! background work) and is handled one at a time, so no state is shared.
//! Notifications collected while handling a message are flushed to the
//! view layer before the next message is taken.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use chrono::Utc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};
use uuid::Uuid;

use carelink_media::{
    acquire_with_fallback, CallManager, CallState, IncomingOutcome, MediaDevices, MediaError,
    MediaOutcome,
};
use carelink_net::{
    spawn_presence_poller, DirectoryClient, HttpDirectory, LinkHandle, PresenceNotification,
    Transport, TransportAdapter, TransportError, TransportEvent,
};
use carelink_shared::protocol::{AttachmentMeta, Envelope, FileMessageMeta, Payload};
use carelink_shared::stream::MediaStream;
use carelink_shared::types::{CallId, LinkId, PeerId};
use carelink_shared::ProtocolError;
use carelink_store::Database;

use crate::badges::BadgeTracker;
use crate::chat::links::{IncomingDecision, Opened};
use crate::chat::{
    Abandoned, ChatMessage, Conversations, LinkRegistry, LinkStatus, OutboundFile, SendOutcome,
    SendSettings, TransferReport, TransferTable, TransferUpdate,
};
use crate::config::ClientConfig;
use crate::error::{ClientError, LinkError};
use crate::events::{ClientEvent, ClientSnapshot, LinkSummary};
use crate::handle::{ClientCommand, ClientHandle, Reply};

/// Collaborators a client runs against.
pub struct ClientDeps {
    pub transport: Arc<dyn Transport>,
    pub transport_events: mpsc::UnboundedReceiver<TransportEvent>,
    pub devices: Arc<dyn MediaDevices>,
    pub database: Database,
    /// Presence source. Defaults to [`HttpDirectory`] at the configured URL.
    pub directory: Option<Arc<dyn DirectoryClient>>,
}

impl ClientDeps {
    pub fn new(
        transport: Arc<dyn Transport>,
        transport_events: mpsc::UnboundedReceiver<TransportEvent>,
        devices: Arc<dyn MediaDevices>,
        database: Database,
    ) -> Self {
        Self {
            transport,
            transport_events,
            devices,
            database,
            directory: None,
        }
    }

    pub fn with_directory(mut self, directory: Arc<dyn DirectoryClient>) -> Self {
        self.directory = Some(directory);
        self
    }
}

/// Work finished outside the actor.
#[derive(Debug)]
enum Internal {
    MediaAcquired {
        generation: u64,
        result: Result<MediaStream, MediaError>,
    },
    LinkTimeout {
        peer: PeerId,
        link: LinkId,
    },
}

struct Channels {
    cmd_rx: mpsc::Receiver<ClientCommand>,
    transport_rx: mpsc::UnboundedReceiver<TransportEvent>,
    presence_rx: mpsc::Receiver<PresenceNotification>,
    internal_rx: mpsc::UnboundedReceiver<Internal>,
    report_rx: mpsc::UnboundedReceiver<TransferReport>,
    notif_tx: mpsc::Sender<ClientEvent>,
}

/// Open the transport, start presence polling and spawn the client task.
///
/// The stored peer id is requested first; when the signaling service no
/// longer grants it the client continues under a fresh id and the stored
/// one is left untouched.
///
/// Returns `(handle, notification_rx, local_peer_id)`.
pub async fn spawn_client(
    config: ClientConfig,
    deps: ClientDeps,
) -> anyhow::Result<(ClientHandle, mpsc::Receiver<ClientEvent>, PeerId)> {
    let ClientDeps {
        transport,
        transport_events,
        devices,
        database,
        directory,
    } = deps;

    let stored = database.load_local_peer_id()?;
    let mut adapter = TransportAdapter::new(transport);
    let local = adapter.open(stored.clone()).await?;
    let first = match database.save_local_peer_id(&local) {
        Ok(first) => first,
        Err(e) => {
            adapter.shutdown();
            return Err(e.into());
        }
    };
    if first {
        info!(peer = %local, "First connection, peer id stored");
    } else if stored.as_ref() != Some(&local) {
        warn!(peer = %local, "Running under a temporary peer id");
    }

    let directory: Arc<dyn DirectoryClient> = match directory {
        Some(directory) => directory,
        None => Arc::new(HttpDirectory::new(config.directory_url.clone())),
    };
    let (presence_tx, presence_rx) = mpsc::channel(64);
    let poller = spawn_presence_poller(directory, local.clone(), config.poller_config(), presence_tx);

    let (cmd_tx, cmd_rx) = mpsc::channel::<ClientCommand>(256);
    let (notif_tx, notif_rx) = mpsc::channel::<ClientEvent>(256);
    let (internal_tx, internal_rx) = mpsc::unbounded_channel();
    let (report_tx, report_rx) = mpsc::unbounded_channel();

    let handle = ClientHandle::new(cmd_tx, config.max_file_size);
    let actor = ClientActor {
        transfers: TransferTable::new(config.max_file_size),
        config,
        local: local.clone(),
        adapter,
        devices,
        database,
        calls: CallManager::new(),
        links: LinkRegistry::new(),
        outbound: HashMap::new(),
        conversations: Conversations::new(),
        badges: BadgeTracker::new(),
        online: BTreeSet::new(),
        poller,
        internal_tx,
        report_tx,
        pending: Vec::new(),
    };

    tokio::spawn(actor.run(Channels {
        cmd_rx,
        transport_rx: transport_events,
        presence_rx,
        internal_rx,
        report_rx,
        notif_tx,
    }));

    info!(peer = %local, "Client started");
    Ok((handle, notif_rx, local))
}

struct ClientActor {
    config: ClientConfig,
    local: PeerId,
    adapter: TransportAdapter,
    devices: Arc<dyn MediaDevices>,
    database: Database,
    calls: CallManager,
    links: LinkRegistry,
    transfers: TransferTable,
    outbound: HashMap<Uuid, Arc<AtomicBool>>,
    conversations: Conversations,
    badges: BadgeTracker,
    online: BTreeSet<PeerId>,
    poller: JoinHandle<()>,
    internal_tx: mpsc::UnboundedSender<Internal>,
    report_tx: mpsc::UnboundedSender<TransferReport>,
    pending: Vec<ClientEvent>,
}

impl ClientActor {
    async fn run(mut self, mut ch: Channels) {
        let mut sweep = tokio::time::interval(sweep_interval(self.config.transfer_timeout));
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let running = tokio::select! {
                cmd = ch.cmd_rx.recv() => match cmd {
                    Some(cmd) => self.handle_command(cmd),
                    None => {
                        info!("Command channel closed, shutting down client");
                        self.teardown();
                        false
                    }
                },
                Some(event) = ch.transport_rx.recv() => {
                    self.handle_transport_event(event);
                    true
                }
                Some(update) = ch.presence_rx.recv() => {
                    self.handle_presence(update);
                    true
                }
                Some(internal) = ch.internal_rx.recv() => {
                    self.handle_internal(internal);
                    true
                }
                Some(report) = ch.report_rx.recv() => {
                    self.handle_report(report);
                    true
                }
                _ = sweep.tick() => {
                    self.sweep_transfers();
                    true
                }
            };

            for event in std::mem::take(&mut self.pending) {
                let _ = ch.notif_tx.send(event).await;
            }

            if !running {
                break;
            }
        }

        debug!("Client task stopped");
    }

    fn emit(&mut self, event: ClientEvent) {
        self.pending.push(event);
    }

    fn emit_call_state(&mut self) {
        let snapshot = self.calls.snapshot();
        self.emit(ClientEvent::CallStateChanged(snapshot));
    }

    // -----------------------------------------------------------------------
    // Commands
    // -----------------------------------------------------------------------

    fn handle_command(&mut self, cmd: ClientCommand) -> bool {
        match cmd {
            ClientCommand::Call { peer, reply } => {
                let _ = reply.send(self.start_call(peer));
            }
            ClientCommand::AcceptCall(reply) => {
                let _ = reply.send(self.accept_call());
            }
            ClientCommand::DeclineCall(reply) => {
                let _ = reply.send(self.decline_call());
            }
            ClientCommand::ToggleHold(reply) => {
                let result = self.calls.toggle_hold().map_err(ClientError::from);
                if result.is_ok() {
                    self.emit_call_state();
                }
                let _ = reply.send(result);
            }
            ClientCommand::ToggleMute(reply) => {
                let result = self.calls.toggle_mute().map_err(ClientError::from);
                if result.is_ok() {
                    self.emit_call_state();
                }
                let _ = reply.send(result);
            }
            ClientCommand::EndCall(reply) => {
                self.end_call();
                let _ = reply.send(Ok(()));
            }
            ClientCommand::Connect { peer, reply } => self.connect(peer, reply),
            ClientCommand::SendText { peer, text, reply } => {
                let _ = reply.send(self.send_text(peer, text));
            }
            ClientCommand::SendFile {
                peer,
                name,
                mime_type,
                data,
                text,
                reply,
            } => {
                let _ = reply.send(self.send_file(peer, name, mime_type, data, text));
            }
            ClientCommand::CancelFile { message_id, reply } => {
                let _ = reply.send(self.cancel_file(message_id));
            }
            ClientCommand::OpenConversation { peer, reply } => {
                let _ = reply.send(Ok(self.open_conversation(&peer)));
            }
            ClientCommand::MinimizeConversation { peer, reply } => {
                if !self.badges.minimize(&peer) {
                    debug!(peer = %peer.short(), "Minimize for a conversation that is not open");
                }
                let _ = reply.send(Ok(()));
            }
            ClientCommand::CloseConversation { peer, reply } => {
                self.close_conversation(&peer);
                let _ = reply.send(Ok(()));
            }
            ClientCommand::Snapshot(reply) => {
                let _ = reply.send(Ok(self.snapshot()));
            }
            ClientCommand::Logout(reply) => {
                info!(peer = %self.local, "Logging out");
                let result = self
                    .database
                    .clear_local_peer_id()
                    .map(|_| ())
                    .map_err(ClientError::from);
                self.teardown();
                let _ = reply.send(result);
                return false;
            }
            ClientCommand::Shutdown(reply) => {
                info!("Client shutdown requested");
                self.teardown();
                let _ = reply.send(Ok(()));
                return false;
            }
        }
        true
    }

    fn teardown(&mut self) {
        if let Some(teardown) = self.calls.end() {
            teardown.release();
            self.emit_call_state();
        }
        for cancel in self.outbound.values() {
            cancel.store(true, Ordering::Release);
        }
        for mut dropped in self.links.drain() {
            dropped.fail_waiters(&LinkError::Closed);
            dropped.handle.close();
        }
        self.poller.abort();
        self.adapter.shutdown();
    }

    // -----------------------------------------------------------------------
    // Calls
    // -----------------------------------------------------------------------

    fn start_call(&mut self, peer: PeerId) -> Result<(), ClientError> {
        if peer == self.local {
            return Err(TransportError::SelfConnect.into());
        }
        let generation = self.calls.begin_outgoing(peer.clone())?;
        self.emit_call_state();
        self.acquire_media(generation);

        if let Err(e) = self.ensure_link(&peer) {
            warn!(peer = %peer.short(), error = %e, "Could not open data link alongside call");
        }
        Ok(())
    }

    fn accept_call(&mut self) -> Result<(), ClientError> {
        let generation = self.calls.begin_accept()?;
        self.acquire_media(generation);
        Ok(())
    }

    fn decline_call(&mut self) -> Result<(), ClientError> {
        let teardown = self.calls.decline()?;
        info!(peer = %teardown.remote.short(), "Call declined");
        teardown.release();
        self.emit_call_state();
        Ok(())
    }

    fn end_call(&mut self) {
        match self.calls.end() {
            Some(teardown) => {
                if teardown.previous == CallState::IncomingRinging {
                    info!(peer = %teardown.remote.short(), "Call declined");
                }
                teardown.release();
                self.emit_call_state();
            }
            None => debug!("End requested with no call in progress"),
        }
    }

    fn acquire_media(&self, generation: u64) {
        let devices = self.devices.clone();
        let internal_tx = self.internal_tx.clone();
        tokio::spawn(async move {
            let result = acquire_with_fallback(devices.as_ref()).await;
            let _ = internal_tx.send(Internal::MediaAcquired { generation, result });
        });
    }

    fn on_media(&mut self, generation: u64, result: Result<MediaStream, MediaError>) {
        let stream = match result {
            Ok(stream) => stream,
            Err(e) => {
                warn!(generation, error = %e, "Media acquisition failed");
                if let Some(teardown) = self.calls.media_failed(generation) {
                    teardown.release();
                    self.emit(ClientEvent::MediaError {
                        error: e.to_string(),
                    });
                    self.emit_call_state();
                }
                return;
            }
        };

        match self.calls.media_ready(generation, stream) {
            MediaOutcome::Place { remote, stream } => match self.adapter.call(&remote, &stream) {
                Ok(call) => {
                    if let Err(call) = self.calls.attach_outgoing(call) {
                        call.close();
                    }
                }
                Err(e) => self.fail_call(&remote, e.to_string()),
            },
            MediaOutcome::Answer { call, stream } => match self.adapter.accept(&call, &stream) {
                Ok(()) => {
                    self.calls.answered();
                    self.emit_call_state();
                }
                Err(e) => self.fail_call(call.remote(), e.to_string()),
            },
            MediaOutcome::Stale(stream) => {
                let stopped = stream.stop_all();
                debug!(generation, stopped, "Released media acquired after hang-up");
            }
        }
    }

    fn fail_call(&mut self, peer: &PeerId, error: String) {
        warn!(peer = %peer.short(), error = %error, "Call failed");
        if let Some(teardown) = self.calls.end() {
            teardown.release();
        }
        self.emit(ClientEvent::CallFailed {
            peer: peer.clone(),
            error,
        });
        self.emit_call_state();
    }

    fn end_remote_call(&mut self, call: CallId) {
        if let Some(teardown) = self.calls.end_if_call(call) {
            info!(peer = %teardown.remote.short(), call = %call, "Call ended by remote");
            teardown.release();
            self.emit_call_state();
        }
    }

    // -----------------------------------------------------------------------
    // Transport events
    // -----------------------------------------------------------------------

    fn handle_transport_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::IncomingCall(call) => {
                let from = call.remote().clone();
                match self.calls.incoming(call) {
                    IncomingOutcome::Ringing => {
                        self.emit(ClientEvent::IncomingCall { from });
                        self.emit_call_state();
                    }
                    IncomingOutcome::Busy(call) => {
                        self.adapter.decline(&call);
                        self.emit(ClientEvent::MissedCall { from });
                    }
                }
            }
            TransportEvent::CallStream { call, stream } => {
                let has_video = stream.has_video();
                if !self.calls.remote_stream(call, stream.clone()) {
                    debug!(call = %call, "Stream for a call that is not current");
                    return;
                }
                if let Some(peer) = self.calls.session().map(|s| s.remote().clone()) {
                    self.emit(ClientEvent::RemoteStream {
                        peer,
                        has_video,
                        stream,
                    });
                }
                self.emit_call_state();
            }
            TransportEvent::CallClosed { call } => self.end_remote_call(call),
            TransportEvent::CallError { call, message } => {
                warn!(call = %call, error = %message, "Call transport error");
                self.end_remote_call(call);
            }
            TransportEvent::IncomingLink(handle) => self.accept_link(handle),
            TransportEvent::LinkOpen { link } => self.link_opened(link),
            TransportEvent::LinkData { link, payload } => self.link_data(link, payload),
            TransportEvent::LinkClosed { link } => self.link_closed(link, None),
            TransportEvent::LinkError { link, message } => self.link_closed(link, Some(message)),
        }
    }

    fn handle_internal(&mut self, internal: Internal) {
        match internal {
            Internal::MediaAcquired { generation, result } => self.on_media(generation, result),
            Internal::LinkTimeout { peer, link } => self.link_timed_out(peer, link),
        }
    }

    fn handle_presence(&mut self, update: PresenceNotification) {
        match update {
            PresenceNotification::Joined(peer) => {
                if self.online.insert(peer.clone()) {
                    self.emit(ClientEvent::PeerJoined { peer });
                }
            }
            PresenceNotification::Left(peer) => {
                if self.online.remove(&peer) {
                    self.emit(ClientEvent::PeerLeft { peer });
                }
            }
            PresenceNotification::DirectoryUnavailable { error, retry_in } => {
                self.emit(ClientEvent::DirectoryUnavailable {
                    error,
                    retry_in_ms: retry_in.as_millis() as u64,
                });
            }
            PresenceNotification::DirectoryRestored => self.emit(ClientEvent::DirectoryRestored),
        }
    }

    // -----------------------------------------------------------------------
    // Links
    // -----------------------------------------------------------------------

    /// Make sure a link to `peer` exists, connecting when there is none.
    fn ensure_link(&mut self, peer: &PeerId) -> Result<LinkStatus, ClientError> {
        if let Some(status) = self.links.status(peer) {
            debug!(peer = %peer.short(), ?status, "Reusing data link");
            return Ok(status);
        }
        let handle = self.adapter.connect(peer)?;
        let link = handle.id();
        self.links.insert_outgoing(handle);
        self.arm_link_timeout(peer.clone(), link);
        Ok(LinkStatus::Opening)
    }

    fn arm_link_timeout(&self, peer: PeerId, link: LinkId) {
        let internal_tx = self.internal_tx.clone();
        let timeout = self.config.link_timeout;
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let _ = internal_tx.send(Internal::LinkTimeout { peer, link });
        });
    }

    fn connect(&mut self, peer: PeerId, reply: Reply<()>) {
        if let Err(e) = self.ensure_link(&peer) {
            let _ = reply.send(Err(e));
            return;
        }
        let (ready_tx, ready_rx) = oneshot::channel();
        self.links.add_waiter(&peer, ready_tx);
        tokio::spawn(async move {
            let result = match ready_rx.await {
                Ok(Ok(_writer)) => Ok(()),
                Ok(Err(e)) => Err(e.into()),
                Err(_) => Err(LinkError::Closed.into()),
            };
            let _ = reply.send(result);
        });
    }

    fn accept_link(&mut self, handle: LinkHandle) {
        let peer = handle.remote().clone();
        let link = handle.id();
        match self.links.accept_incoming(handle, &self.local) {
            IncomingDecision::Accepted => self.arm_link_timeout(peer, link),
            IncomingDecision::Replaced(ours) => {
                ours.close();
                self.arm_link_timeout(peer, link);
            }
            IncomingDecision::Rejected(theirs) => theirs.close(),
        }
    }

    fn link_opened(&mut self, link: LinkId) {
        let Some(Opened {
            peer,
            writer,
            waiters,
            queued,
        }) = self.links.on_open(link)
        else {
            return;
        };

        info!(peer = %peer.short(), link = %link, queued = queued.len(), "Data link open");
        for batch in queued {
            if let Err(e) = writer.send_batch(batch) {
                warn!(peer = %peer.short(), error = %e, "Failed to flush queued message");
                self.emit(ClientEvent::LinkError {
                    peer: peer.clone(),
                    error: e.to_string(),
                });
                break;
            }
        }
        for waiter in waiters {
            let _ = waiter.send(Ok(writer.clone()));
        }
        self.emit(ClientEvent::LinkOpened { peer, link });
    }

    fn link_closed(&mut self, link: LinkId, error: Option<String>) {
        let Some(mut dropped) = self.links.on_closed(link) else {
            debug!(link = %link, "Close for a link that is no longer registered");
            return;
        };
        let peer = dropped.peer.clone();

        match &error {
            Some(message) => {
                warn!(peer = %peer.short(), link = %link, error = %message, "Data link error");
                dropped.fail_waiters(&LinkError::Failed(message.clone()));
                dropped.handle.close();
            }
            None => {
                info!(peer = %peer.short(), link = %link, "Data link closed");
                dropped.fail_waiters(&LinkError::Closed);
            }
        }
        self.abandon_link_transfers(link, "link closed");

        match error {
            Some(error) => self.emit(ClientEvent::LinkError { peer, error }),
            None => self.emit(ClientEvent::LinkClosed { peer, link }),
        }
    }

    fn link_timed_out(&mut self, peer: PeerId, link: LinkId) {
        let Some(mut dropped) = self.links.on_timeout(&peer, link) else {
            return;
        };
        let error = LinkError::Timeout(self.config.link_timeout);
        if dropped.queued > 0 {
            warn!(peer = %peer.short(), queued = dropped.queued, "Dropping messages for a link that never opened");
        }
        dropped.fail_waiters(&error);
        dropped.handle.close();
        self.abandon_link_transfers(link, "link timed out");
        self.emit(ClientEvent::LinkError {
            peer,
            error: error.to_string(),
        });
    }

    fn abandon_link_transfers(&mut self, link: LinkId, reason: &str) {
        for abandoned in self.transfers.abandon_link(link) {
            self.emit_abandoned(abandoned, reason);
        }
    }

    fn emit_abandoned(&mut self, abandoned: Abandoned, reason: &str) {
        info!(
            message_id = %abandoned.message_id,
            peer = %abandoned.peer.short(),
            received = abandoned.received,
            reason,
            "Inbound transfer discarded"
        );
        self.emit(ClientEvent::TransferAbandoned {
            message_id: abandoned.message_id,
            peer: abandoned.peer,
            reason: reason.to_string(),
        });
    }

    /// Send `batch` on the link to `peer`, or queue it while the link opens.
    fn transmit(&mut self, peer: &PeerId, batch: Vec<Payload>) {
        if let Some(writer) = self.links.writer(peer) {
            if let Err(e) = writer.send_batch(batch) {
                warn!(peer = %peer.short(), error = %e, "Send failed");
                self.emit(ClientEvent::LinkError {
                    peer: peer.clone(),
                    error: e.to_string(),
                });
            }
        } else if let Err(batch) = self.links.enqueue(peer, batch) {
            warn!(peer = %peer.short(), dropped = batch.len(), "No data link, message not sent");
        }
    }

    // -----------------------------------------------------------------------
    // Chat
    // -----------------------------------------------------------------------

    fn send_text(&mut self, peer: PeerId, text: String) -> Result<ChatMessage, ClientError> {
        let message = ChatMessage::text(self.local.clone(), text);
        let payload = Envelope::Text {
            id: message.id,
            text: message.text.clone(),
            timestamp: message.timestamp,
        }
        .to_payload()?;

        self.ensure_link(&peer)?;
        self.transmit(&peer, vec![payload]);
        self.record_sent(&peer, message.clone());
        Ok(message)
    }

    fn send_file(
        &mut self,
        peer: PeerId,
        name: String,
        mime_type: String,
        data: Bytes,
        text: Option<String>,
    ) -> Result<ChatMessage, ClientError> {
        let max = self.config.max_file_size;
        if data.len() > max {
            warn!(peer = %peer.short(), size = data.len(), max, "File too large, not sent");
            return Err(ProtocolError::AttachmentTooLarge {
                size: data.len() as u64,
                max: max as u64,
            }
            .into());
        }

        self.ensure_link(&peer)?;

        let text = file_caption(text.as_deref(), &name);
        let meta = FileMessageMeta {
            id: Uuid::new_v4(),
            sender: self.local.clone(),
            text,
            timestamp: Utc::now(),
            attachment: AttachmentMeta::describe(name, mime_type, &data),
        };
        let message = ChatMessage::from_file(self.local.clone(), meta.clone(), data.clone());

        let cancel = Arc::new(AtomicBool::new(false));
        self.outbound.insert(meta.id, cancel.clone());
        let file = OutboundFile {
            peer: peer.clone(),
            meta,
            data,
            cancel,
        };

        let (ready_tx, ready_rx) = oneshot::channel();
        self.links.add_waiter(&peer, ready_tx);
        let settings = SendSettings {
            chunk_size: self.config.chunk_size,
            chunk_delay: self.config.chunk_delay,
        };
        let reports = self.report_tx.clone();
        tokio::spawn(async move {
            let failure = match ready_rx.await {
                Ok(Ok(writer)) => return file.run(writer, settings, reports).await,
                Ok(Err(e)) => e.to_string(),
                Err(_) => LinkError::Closed.to_string(),
            };
            let _ = reports.send(TransferReport::Finished {
                message_id: file.message_id(),
                peer: file.peer,
                outcome: SendOutcome::Failed(failure),
            });
        });

        self.record_sent(&peer, message.clone());
        Ok(message)
    }

    fn cancel_file(&mut self, message_id: Uuid) -> Result<(), ClientError> {
        let cancel = self
            .outbound
            .get(&message_id)
            .ok_or(ClientError::UnknownTransfer(message_id))?;
        cancel.store(true, Ordering::Release);
        Ok(())
    }

    fn handle_report(&mut self, report: TransferReport) {
        match report {
            TransferReport::Progress {
                message_id,
                peer,
                sent,
                total,
            } => self.emit(ClientEvent::TransferProgress {
                message_id,
                peer,
                done: sent,
                total,
                outgoing: true,
            }),
            TransferReport::Finished {
                message_id,
                peer,
                outcome,
            } => {
                self.outbound.remove(&message_id);
                let event = match outcome {
                    SendOutcome::Completed => ClientEvent::TransferCompleted {
                        message_id,
                        peer,
                        outgoing: true,
                    },
                    SendOutcome::Cancelled => ClientEvent::TransferAbandoned {
                        message_id,
                        peer,
                        reason: "cancelled".to_string(),
                    },
                    SendOutcome::Failed(reason) => ClientEvent::TransferAbandoned {
                        message_id,
                        peer,
                        reason,
                    },
                };
                self.emit(event);
            }
        }
    }

    fn link_data(&mut self, link: LinkId, payload: Payload) {
        let Some(peer) = self.links.peer_for(link).cloned() else {
            warn!(link = %link, "Data on an unknown link dropped");
            return;
        };

        let outcome = match payload {
            Payload::Text(raw) => {
                Envelope::from_json(&raw).and_then(|envelope| self.handle_envelope(&peer, link, envelope))
            }
            Payload::Binary(raw) => self.transfers.on_frame(link, raw),
        };

        match outcome {
            Ok(Some(update)) => self.apply_transfer_update(update),
            Ok(None) => {}
            Err(e) => warn!(peer = %peer.short(), link = %link, error = %e, "Dropped data link message"),
        }
    }

    fn handle_envelope(
        &mut self,
        peer: &PeerId,
        link: LinkId,
        envelope: Envelope,
    ) -> Result<Option<TransferUpdate>, ProtocolError> {
        match envelope {
            Envelope::Text {
                id,
                text,
                timestamp,
            } => {
                self.receive_message(
                    peer,
                    ChatMessage {
                        id,
                        sender: peer.clone(),
                        text,
                        timestamp,
                        attachment: None,
                    },
                );
                Ok(None)
            }
            Envelope::FileMeta { message } => self.transfers.on_meta(peer, link, message),
            Envelope::FileChunkMeta {
                message_id,
                chunk_index,
                total_chunks,
            } => self
                .transfers
                .on_chunk_meta(link, message_id, chunk_index, total_chunks)
                .map(|()| None),
            Envelope::FileAbort { message_id } => {
                if let Some(abandoned) = self.transfers.abort(peer, message_id) {
                    self.emit_abandoned(abandoned, "aborted by sender");
                }
                Ok(None)
            }
        }
    }

    fn apply_transfer_update(&mut self, update: TransferUpdate) {
        match update {
            TransferUpdate::Progress {
                message_id,
                peer,
                received,
                total,
            } => self.emit(ClientEvent::TransferProgress {
                message_id,
                peer,
                done: received,
                total,
                outgoing: false,
            }),
            TransferUpdate::Completed { peer, message } => {
                let message_id = message.id;
                self.receive_message(&peer, message);
                self.emit(ClientEvent::TransferCompleted {
                    message_id,
                    peer,
                    outgoing: false,
                });
            }
        }
    }

    fn sweep_transfers(&mut self) {
        let idle = self.config.transfer_timeout;
        for abandoned in self.transfers.sweep(Instant::now(), idle) {
            self.emit_abandoned(abandoned, "timed out");
        }
    }

    // -----------------------------------------------------------------------
    // Conversations
    // -----------------------------------------------------------------------

    fn load_history(&mut self, peer: &PeerId) {
        if self.conversations.is_loaded(peer) {
            return;
        }
        let history = match self.database.messages_with(peer) {
            Ok(stored) => stored.into_iter().map(ChatMessage::from_stored).collect(),
            Err(e) => {
                warn!(peer = %peer.short(), error = %e, "Failed to load conversation history");
                Vec::new()
            }
        };
        self.conversations.restore(peer, history);
    }

    fn persist(&self, peer: &PeerId, message: &ChatMessage) {
        if let Err(e) = self.database.append_message(&message.to_stored(peer)) {
            warn!(message_id = %message.id, error = %e, "Failed to persist message");
        }
    }

    fn record_sent(&mut self, peer: &PeerId, message: ChatMessage) {
        self.load_history(peer);
        if self.conversations.append(peer, message.clone()) {
            self.persist(peer, &message);
            self.emit(ClientEvent::MessageSent {
                peer: peer.clone(),
                message,
            });
        }
    }

    fn receive_message(&mut self, peer: &PeerId, message: ChatMessage) {
        self.load_history(peer);
        if !self.conversations.append(peer, message.clone()) {
            debug!(message_id = %message.id, "Duplicate message ignored");
            return;
        }
        self.persist(peer, &message);
        self.emit(ClientEvent::MessageReceived {
            peer: peer.clone(),
            message,
        });
        if self.badges.on_message(peer) {
            self.emit(ClientEvent::BadgeChanged {
                peer: peer.clone(),
                unread: true,
            });
        }
    }

    fn open_conversation(&mut self, peer: &PeerId) -> Vec<ChatMessage> {
        self.load_history(peer);
        if self.badges.open(peer) {
            self.emit(ClientEvent::BadgeChanged {
                peer: peer.clone(),
                unread: false,
            });
        }
        self.conversations.log(peer).to_vec()
    }

    fn close_conversation(&mut self, peer: &PeerId) {
        if self.badges.close(peer) {
            self.emit(ClientEvent::BadgeChanged {
                peer: peer.clone(),
                unread: false,
            });
        }
        if let Some(mut dropped) = self.links.remove(peer) {
            let link = dropped.handle.id();
            info!(peer = %peer.short(), link = %link, "Closing data link with conversation");
            dropped.fail_waiters(&LinkError::Closed);
            dropped.handle.close();
            self.abandon_link_transfers(link, "conversation closed");
            self.emit(ClientEvent::LinkClosed {
                peer: peer.clone(),
                link,
            });
        }
    }

    fn snapshot(&self) -> ClientSnapshot {
        ClientSnapshot {
            local_id: self.local.clone(),
            call: self.calls.snapshot(),
            online: self.online.iter().cloned().collect(),
            conversations: self.conversations.all().clone(),
            unread: self.badges.unread().cloned().collect(),
            open_conversations: self.badges.views(),
            links: self
                .links
                .summaries()
                .into_iter()
                .map(|(peer, link, status)| LinkSummary { peer, link, status })
                .collect(),
        }
    }
}

/// Trimmed caption, or `Sending file: <name>` when blank.
fn file_caption(text: Option<&str>, name: &str) -> String {
    match text.map(str::trim) {
        Some(text) if !text.is_empty() => text.to_string(),
        _ => format!("Sending file: {name}"),
    }
}

fn sweep_interval(transfer_timeout: Duration) -> Duration {
    (transfer_timeout / 4).clamp(Duration::from_millis(50), Duration::from_secs(15))
}

#[cfg(test)]
mod tests {
    use super::*;
    use carelink_media::{CallError, SyntheticDevices};
    use carelink_net::LoopbackHub;
    use carelink_shared::constants::DEFAULT_MIME_TYPE;

    struct TestPeer {
        id: PeerId,
        handle: ClientHandle,
        events: mpsc::Receiver<ClientEvent>,
    }

    impl TestPeer {
        async fn wait_for<T>(&mut self, mut pick: impl FnMut(ClientEvent) -> Option<T>) -> T {
            tokio::time::timeout(Duration::from_secs(5), async {
                loop {
                    let event = self.events.recv().await.expect("client stopped");
                    if let Some(found) = pick(event) {
                        return found;
                    }
                }
            })
            .await
            .expect("timed out waiting for event")
        }

        async fn wait_for_call_state(&mut self, state: CallState) {
            self.wait_for(|e| match e {
                ClientEvent::CallStateChanged(s) if s.state == state => Some(()),
                _ => None,
            })
            .await
        }
    }

    fn test_config() -> ClientConfig {
        ClientConfig {
            poll_interval: Duration::from_millis(20),
            max_poll_backoff: Duration::from_millis(100),
            link_timeout: Duration::from_millis(300),
            chunk_size: 1024,
            chunk_delay: Duration::ZERO,
            transfer_timeout: Duration::from_secs(5),
            ..ClientConfig::default()
        }
    }

    async fn start_with(hub: &LoopbackHub, name: &str, config: ClientConfig, database: Database) -> TestPeer {
        database.save_local_peer_id(&PeerId::new(name)).unwrap();
        let (transport, events) = hub.transport();
        let deps = ClientDeps::new(
            Arc::new(transport),
            events,
            Arc::new(SyntheticDevices::new()),
            database,
        )
        .with_directory(Arc::new(hub.clone()));
        let (handle, events, id) = spawn_client(config, deps).await.unwrap();
        assert_eq!(id, PeerId::new(name));
        TestPeer { id, handle, events }
    }

    async fn start(hub: &LoopbackHub, name: &str) -> TestPeer {
        start_with(hub, name, test_config(), Database::open_in_memory().unwrap()).await
    }

    fn pattern(len: usize) -> Bytes {
        Bytes::from((0..len).map(|i| (i % 251) as u8).collect::<Vec<u8>>())
    }

    #[tokio::test]
    async fn call_goes_active_and_hangup_releases_media() {
        let hub = LoopbackHub::new();
        let mut alice = start(&hub, "alice").await;
        let mut bob = start(&hub, "bob").await;

        alice.handle.call(bob.id.clone()).await.unwrap();
        let from = bob
            .wait_for(|e| match e {
                ClientEvent::IncomingCall { from } => Some(from),
                _ => None,
            })
            .await;
        assert_eq!(from, alice.id);

        bob.handle.accept_call().await.unwrap();
        let alice_stream = bob
            .wait_for(|e| match e {
                ClientEvent::RemoteStream { stream, .. } => Some(stream),
                _ => None,
            })
            .await;
        alice.wait_for_call_state(CallState::Active).await;

        assert!(alice.handle.toggle_mute().await.unwrap());
        assert!(alice.handle.toggle_hold().await.unwrap());
        assert!(!alice.handle.toggle_hold().await.unwrap());

        alice.handle.end_call().await.unwrap();
        assert!(alice_stream.is_stopped());
        alice.wait_for_call_state(CallState::Idle).await;
        bob.wait_for_call_state(CallState::Idle).await;

        // Hanging up twice is harmless.
        alice.handle.end_call().await.unwrap();
        assert_eq!(alice.handle.snapshot().await.unwrap().call.state, CallState::Idle);

        // A fresh call after the first one ended.
        alice.handle.call(bob.id.clone()).await.unwrap();
        bob.wait_for_call_state(CallState::IncomingRinging).await;
        bob.handle.decline_call().await.unwrap();
        alice.wait_for_call_state(CallState::Idle).await;
    }

    #[tokio::test]
    async fn busy_peer_declines_second_caller() {
        let hub = LoopbackHub::new();
        let alice = start(&hub, "alice").await;
        let mut bob = start(&hub, "bob").await;
        let mut carol = start(&hub, "carol").await;

        alice.handle.call(bob.id.clone()).await.unwrap();
        bob.wait_for_call_state(CallState::IncomingRinging).await;

        carol.handle.call(bob.id.clone()).await.unwrap();
        let missed = bob
            .wait_for(|e| match e {
                ClientEvent::MissedCall { from } => Some(from),
                _ => None,
            })
            .await;
        assert_eq!(missed, carol.id);
        carol.wait_for_call_state(CallState::Idle).await;

        let call = bob.handle.snapshot().await.unwrap().call;
        assert_eq!(call.state, CallState::IncomingRinging);
        assert_eq!(call.remote, Some(alice.id.clone()));

        let err = bob.handle.call(carol.id.clone()).await.unwrap_err();
        assert!(matches!(err, ClientError::Call(CallError::Busy)));
    }

    #[tokio::test]
    async fn calling_yourself_is_rejected() {
        let hub = LoopbackHub::new();
        let alice = start(&hub, "alice").await;
        let err = alice.handle.call(alice.id.clone()).await.unwrap_err();
        assert!(matches!(err, ClientError::Transport(TransportError::SelfConnect)));
    }

    #[tokio::test]
    async fn unwritable_store_releases_the_peer_id() {
        let hub = LoopbackHub::new();
        let database = Database::open_in_memory().unwrap();
        database.conn().pragma_update(None, "query_only", true).unwrap();

        let (transport, events) = hub.transport();
        let deps = ClientDeps::new(
            Arc::new(transport),
            events,
            Arc::new(SyntheticDevices::new()),
            database,
        )
        .with_directory(Arc::new(hub.clone()));

        assert!(spawn_client(test_config(), deps).await.is_err());
        assert!(hub.peer_ids().is_empty());
    }

    #[tokio::test]
    async fn messages_raise_and_clear_badges() {
        let hub = LoopbackHub::new();
        let alice = start(&hub, "alice").await;
        let mut bob = start(&hub, "bob").await;

        alice.handle.send_text(bob.id.clone(), "hello").await.unwrap();
        let text = bob
            .wait_for(|e| match e {
                ClientEvent::MessageReceived { message, .. } => Some(message.text),
                _ => None,
            })
            .await;
        assert_eq!(text, "hello");
        bob.wait_for(|e| match e {
            ClientEvent::BadgeChanged { unread: true, .. } => Some(()),
            _ => None,
        })
        .await;

        let log = bob.handle.open_conversation(alice.id.clone()).await.unwrap();
        assert_eq!(log.len(), 1);
        assert!(bob.handle.snapshot().await.unwrap().unread.is_empty());

        // Visible conversation: no badge.
        alice.handle.send_text(bob.id.clone(), "still there?").await.unwrap();
        bob.wait_for(|e| match e {
            ClientEvent::MessageReceived { message, .. } if message.text == "still there?" => Some(()),
            _ => None,
        })
        .await;
        assert!(bob.handle.snapshot().await.unwrap().unread.is_empty());

        bob.handle.minimize_conversation(alice.id.clone()).await.unwrap();
        alice.handle.send_text(bob.id.clone(), "ping").await.unwrap();
        bob.wait_for(|e| match e {
            ClientEvent::BadgeChanged { unread: true, .. } => Some(()),
            _ => None,
        })
        .await;
        let snapshot = bob.handle.snapshot().await.unwrap();
        assert_eq!(snapshot.unread, vec![alice.id.clone()]);
        assert_eq!(snapshot.conversations[&alice.id].len(), 3);

        let sent = alice.handle.snapshot().await.unwrap().conversations[&bob.id].len();
        assert_eq!(sent, 3);
    }

    #[tokio::test]
    async fn existing_link_is_reused() {
        let hub = LoopbackHub::new();
        let alice = start(&hub, "alice").await;
        let bob = start(&hub, "bob").await;

        alice.handle.connect(bob.id.clone()).await.unwrap();
        let first = alice.handle.snapshot().await.unwrap().links;
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].status, LinkStatus::Open);

        alice.handle.send_text(bob.id.clone(), "one").await.unwrap();
        alice.handle.connect(bob.id.clone()).await.unwrap();
        let second = alice.handle.snapshot().await.unwrap().links;
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].link, first[0].link);
    }

    #[tokio::test]
    async fn file_arrives_intact() {
        let hub = LoopbackHub::new();
        let mut alice = start(&hub, "alice").await;
        let mut bob = start(&hub, "bob").await;

        let data = pattern(10_000);
        let sent = alice
            .handle
            .send_file_bytes(
                bob.id.clone(),
                "scan.bin",
                "application/x-scan",
                data.clone(),
                Some("left lung, lateral"),
            )
            .await
            .unwrap();
        assert_eq!(sent.text, "left lung, lateral");

        let received = bob
            .wait_for(|e| match e {
                ClientEvent::MessageReceived { message, .. } => Some(message),
                _ => None,
            })
            .await;
        assert_eq!(received.id, sent.id);
        assert_eq!(received.text, "left lung, lateral");
        let attachment = received.attachment.unwrap();
        assert_eq!(attachment.name, "scan.bin");
        assert_eq!(attachment.mime_type, "application/x-scan");
        assert_eq!(attachment.data, data);

        bob.wait_for(|e| match e {
            ClientEvent::TransferCompleted { message_id, outgoing: false, .. } => Some(message_id),
            _ => None,
        })
        .await;
        let done = alice
            .wait_for(|e| match e {
                ClientEvent::TransferCompleted { message_id, outgoing: true, .. } => Some(message_id),
                _ => None,
            })
            .await;
        assert_eq!(done, sent.id);
    }

    #[tokio::test]
    async fn file_from_disk_uses_its_name_and_default_type() {
        let hub = LoopbackHub::new();
        let alice = start(&hub, "alice").await;
        let mut bob = start(&hub, "bob").await;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("report.pdf");
        std::fs::write(&path, pattern(3000)).unwrap();

        alice.handle.send_file(bob.id.clone(), &path, None, None).await.unwrap();
        let message = bob
            .wait_for(|e| match e {
                ClientEvent::MessageReceived { message, .. } => Some(message),
                _ => None,
            })
            .await;
        assert_eq!(message.text, "Sending file: report.pdf");
        let attachment = message.attachment.unwrap();
        assert_eq!(attachment.name, "report.pdf");
        assert_eq!(attachment.mime_type, DEFAULT_MIME_TYPE);
        assert_eq!(attachment.data, pattern(3000));
    }

    #[tokio::test]
    async fn oversized_file_is_refused_before_connecting() {
        let hub = LoopbackHub::new();
        let config = ClientConfig {
            max_file_size: 4096,
            ..test_config()
        };
        let alice = start_with(&hub, "alice", config, Database::open_in_memory().unwrap()).await;
        let bob = start(&hub, "bob").await;

        let err = alice
            .handle
            .send_file_bytes(bob.id.clone(), "big.bin", DEFAULT_MIME_TYPE, pattern(5000), None)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ClientError::Protocol(ProtocolError::AttachmentTooLarge { size: 5000, max: 4096 })
        ));
        assert!(alice.handle.snapshot().await.unwrap().links.is_empty());
    }

    #[tokio::test]
    async fn link_that_never_opens_times_out() {
        let hub = LoopbackHub::new();
        let mut alice = start(&hub, "alice").await;
        // The acceptor waits longer so the initiator's timer fires first.
        let patient = ClientConfig {
            link_timeout: Duration::from_secs(5),
            ..test_config()
        };
        let bob = start_with(&hub, "bob", patient, Database::open_in_memory().unwrap()).await;
        hub.hold_link_open(true);

        let err = alice.handle.connect(bob.id.clone()).await.unwrap_err();
        assert!(matches!(err, ClientError::Link(LinkError::Timeout(_))));
        alice
            .wait_for(|e| match e {
                ClientEvent::LinkError { peer, .. } => Some(peer),
                _ => None,
            })
            .await;
        assert!(alice.handle.snapshot().await.unwrap().links.is_empty());
    }

    #[tokio::test]
    async fn cancelled_send_is_discarded_by_receiver() {
        let hub = LoopbackHub::new();
        let config = ClientConfig {
            chunk_delay: Duration::from_millis(20),
            ..test_config()
        };
        let mut alice = start_with(&hub, "alice", config, Database::open_in_memory().unwrap()).await;
        let mut bob = start(&hub, "bob").await;

        let sent = alice
            .handle
            .send_file_bytes(bob.id.clone(), "x-ray.dcm", DEFAULT_MIME_TYPE, pattern(64 * 1024), None)
            .await
            .unwrap();
        bob.wait_for(|e| match e {
            ClientEvent::TransferProgress { outgoing: false, .. } => Some(()),
            _ => None,
        })
        .await;

        alice.handle.cancel_file(sent.id).await.unwrap();
        let reason = bob
            .wait_for(|e| match e {
                ClientEvent::TransferAbandoned { message_id, reason, .. } if message_id == sent.id => Some(reason),
                _ => None,
            })
            .await;
        assert_eq!(reason, "aborted by sender");
        let reason = alice
            .wait_for(|e| match e {
                ClientEvent::TransferAbandoned { reason, .. } => Some(reason),
                _ => None,
            })
            .await;
        assert_eq!(reason, "cancelled");

        let err = alice.handle.cancel_file(sent.id).await.unwrap_err();
        assert!(matches!(err, ClientError::UnknownTransfer(id) if id == sent.id));
    }

    #[tokio::test]
    async fn closing_conversation_drops_partial_transfer() {
        let hub = LoopbackHub::new();
        let config = ClientConfig {
            chunk_delay: Duration::from_millis(20),
            ..test_config()
        };
        let mut alice = start_with(&hub, "alice", config, Database::open_in_memory().unwrap()).await;
        let mut bob = start(&hub, "bob").await;

        alice
            .handle
            .send_file_bytes(bob.id.clone(), "scan.bin", DEFAULT_MIME_TYPE, pattern(64 * 1024), None)
            .await
            .unwrap();
        bob.wait_for(|e| match e {
            ClientEvent::TransferProgress { outgoing: false, .. } => Some(()),
            _ => None,
        })
        .await;

        bob.handle.close_conversation(alice.id.clone()).await.unwrap();
        let reason = bob
            .wait_for(|e| match e {
                ClientEvent::TransferAbandoned { reason, .. } => Some(reason),
                _ => None,
            })
            .await;
        assert_eq!(reason, "conversation closed");
        assert!(bob.handle.snapshot().await.unwrap().links.is_empty());

        alice
            .wait_for(|e| match e {
                ClientEvent::LinkClosed { peer, .. } => Some(peer),
                _ => None,
            })
            .await;
    }

    #[tokio::test]
    async fn presence_follows_the_directory() {
        let hub = LoopbackHub::new();
        let mut alice = start(&hub, "alice").await;
        let bob = start(&hub, "bob").await;

        let joined = alice
            .wait_for(|e| match e {
                ClientEvent::PeerJoined { peer } => Some(peer),
                _ => None,
            })
            .await;
        assert_eq!(joined, bob.id);

        bob.handle.shutdown().await.unwrap();
        let left = alice
            .wait_for(|e| match e {
                ClientEvent::PeerLeft { peer } => Some(peer),
                _ => None,
            })
            .await;
        assert_eq!(left, bob.id);
        assert!(alice.handle.snapshot().await.unwrap().online.is_empty());
    }

    #[tokio::test]
    async fn logout_forgets_the_peer_id() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("carelink.db");
        let hub = LoopbackHub::new();

        let alice = start_with(&hub, "alice", test_config(), Database::open_at(&path).unwrap()).await;
        alice.handle.logout().await.unwrap();
        assert!(matches!(alice.handle.snapshot().await, Err(ClientError::Closed)));
        assert!(hub.peer_ids().is_empty());

        let db = Database::open_at(&path).unwrap();
        assert_eq!(db.load_local_peer_id().unwrap(), None);
    }

    #[tokio::test]
    async fn history_survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("carelink.db");
        let hub = LoopbackHub::new();

        let alice = start(&hub, "alice").await;
        let mut bob = start_with(&hub, "bob", test_config(), Database::open_at(&path).unwrap()).await;

        alice.handle.send_text(bob.id.clone(), "take two tablets").await.unwrap();
        bob.wait_for(|e| match e {
            ClientEvent::MessageReceived { .. } => Some(()),
            _ => None,
        })
        .await;
        bob.handle.shutdown().await.unwrap();

        let bob = start_with(&hub, "bob", test_config(), Database::open_at(&path).unwrap()).await;
        let log = bob.handle.open_conversation(alice.id.clone()).await.unwrap();
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].text, "take two tablets");
        assert_eq!(log[0].sender, alice.id);
    }

    #[tokio::test]
    async fn concurrent_files_on_one_link_reassemble_separately() {
        let hub = LoopbackHub::new();
        let config = ClientConfig {
            chunk_delay: Duration::from_millis(1),
            ..test_config()
        };
        let alice = start_with(&hub, "alice", config, Database::open_in_memory().unwrap()).await;
        let mut bob = start(&hub, "bob").await;

        alice.handle.connect(bob.id.clone()).await.unwrap();
        let first = pattern(20_000);
        let second = Bytes::from(pattern(30_000).iter().rev().copied().collect::<Vec<u8>>());
        let (a, b) = tokio::join!(
            alice.handle.send_file_bytes(
                bob.id.clone(),
                "ecg.csv",
                "text/csv",
                first.clone(),
                None
            ),
            alice.handle.send_file_bytes(
                bob.id.clone(),
                "mri.bin",
                DEFAULT_MIME_TYPE,
                second.clone(),
                None
            ),
        );
        let (a, b) = (a.unwrap(), b.unwrap());

        let mut received = HashMap::new();
        while received.len() < 2 {
            let message = bob
                .wait_for(|e| match e {
                    ClientEvent::MessageReceived { message, .. } => Some(message),
                    _ => None,
                })
                .await;
            received.insert(message.id, message);
        }
        let data_of = |id: &Uuid| received[id].attachment.as_ref().unwrap().data.clone();
        assert_eq!(data_of(&a.id), first);
        assert_eq!(data_of(&b.id), second);
        assert_eq!(bob.handle.snapshot().await.unwrap().links.len(), 1);
    }

    #[tokio::test]
    async fn call_transport_error_returns_to_idle() {
        let hub = LoopbackHub::new();
        let (transport, mut transport_rx) = hub.transport();
        let database = Database::open_in_memory().unwrap();
        database.save_local_peer_id(&PeerId::new("alice")).unwrap();

        // Relay alice's transport events so the test can inject its own and
        // learn the id of the call once its stream arrives.
        let (inject_tx, mut inject_rx) = mpsc::unbounded_channel();
        let (relay_tx, relay_rx) = mpsc::unbounded_channel();
        let (call_tx, mut call_rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    Some(event) = transport_rx.recv() => event,
                    Some(event) = inject_rx.recv() => event,
                    else => break,
                };
                if let TransportEvent::CallStream { call, .. } = &event {
                    let _ = call_tx.send(*call);
                }
                if relay_tx.send(event).is_err() {
                    break;
                }
            }
        });

        let deps = ClientDeps::new(
            Arc::new(transport),
            relay_rx,
            Arc::new(SyntheticDevices::new()),
            database,
        )
        .with_directory(Arc::new(hub.clone()));
        let (handle, events, id) = spawn_client(test_config(), deps).await.unwrap();
        let mut alice = TestPeer { id, handle, events };
        let mut bob = start(&hub, "bob").await;

        alice.handle.call(bob.id.clone()).await.unwrap();
        bob.wait_for_call_state(CallState::IncomingRinging).await;
        bob.handle.accept_call().await.unwrap();
        let alice_stream = bob
            .wait_for(|e| match e {
                ClientEvent::RemoteStream { stream, .. } => Some(stream),
                _ => None,
            })
            .await;
        alice.wait_for_call_state(CallState::Active).await;
        let call = call_rx.recv().await.unwrap();

        // An error for a call that is not ours leaves the session alone.
        inject_tx
            .send(TransportEvent::CallError {
                call: CallId(0),
                message: "stale".into(),
            })
            .unwrap();
        inject_tx
            .send(TransportEvent::CallError {
                call,
                message: "ice failed".into(),
            })
            .unwrap();

        alice.wait_for_call_state(CallState::Idle).await;
        assert!(alice_stream.is_stopped());
        bob.wait_for_call_state(CallState::Idle).await;
    }

    #[test]
    fn blank_caption_names_the_file() {
        assert_eq!(file_caption(None, "scan.pdf"), "Sending file: scan.pdf");
        assert_eq!(file_caption(Some("  "), "scan.pdf"), "Sending file: scan.pdf");
        assert_eq!(file_caption(Some(" see page 2 "), "scan.pdf"), "see page 2");
    }

    #[test]
    fn sweep_interval_is_clamped() {
        assert_eq!(sweep_interval(Duration::from_millis(10)), Duration::from_millis(50));
        assert_eq!(sweep_interval(Duration::from_secs(8)), Duration::from_secs(2));
        assert_eq!(sweep_interval(Duration::from_secs(600)), Duration::from_secs(15));
    }
}
