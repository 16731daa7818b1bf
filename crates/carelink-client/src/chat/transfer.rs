//! Inbound file transfer reassembly.
//!
//! A transfer opens on `file-meta` and collects the chunks announced by
//! `file-chunk-meta`. Each binary frame must match the chunk most recently
//! announced on its link, and names its transfer in the frame header, so
//! concurrent transfers never get mixed up. Chunks are keyed by index and
//! concatenated in index order once the declared total has arrived.

use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use tracing::{debug, info, warn};
use uuid::Uuid;

use carelink_shared::frame::ChunkFrame;
use carelink_shared::protocol::FileMessageMeta;
use carelink_shared::types::{LinkId, PeerId};
use carelink_shared::ProtocolError;

use super::conversation::ChatMessage;

#[derive(Debug)]
struct InboundTransfer {
    peer: PeerId,
    link: LinkId,
    meta: FileMessageMeta,
    total: Option<u32>,
    chunks: BTreeMap<u32, Bytes>,
    received_bytes: u64,
    last_activity: Instant,
}

impl InboundTransfer {
    fn is_complete(&self) -> bool {
        self.total
            .is_some_and(|total| self.chunks.len() as u32 == total)
    }

    fn assemble(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.received_bytes as usize);
        for chunk in self.chunks.values() {
            buf.extend_from_slice(chunk);
        }
        buf.freeze()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferUpdate {
    Progress {
        message_id: Uuid,
        peer: PeerId,
        received: u32,
        total: u32,
    },
    Completed {
        peer: PeerId,
        message: ChatMessage,
    },
}

/// An inbound transfer that was given up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Abandoned {
    pub message_id: Uuid,
    pub peer: PeerId,
    pub received: u32,
}

#[derive(Debug)]
pub struct TransferTable {
    transfers: HashMap<Uuid, InboundTransfer>,
    announced: HashMap<LinkId, (Uuid, u32)>,
    max_file_size: u64,
}

impl TransferTable {
    pub fn new(max_file_size: usize) -> Self {
        Self {
            transfers: HashMap::new(),
            announced: HashMap::new(),
            max_file_size: max_file_size as u64,
        }
    }

    pub fn len(&self) -> usize {
        self.transfers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.transfers.is_empty()
    }

    /// `file-meta` arrived from `peer` on `link`.
    pub fn on_meta(
        &mut self,
        peer: &PeerId,
        link: LinkId,
        meta: FileMessageMeta,
    ) -> Result<Option<TransferUpdate>, ProtocolError> {
        let size = meta.attachment.size;
        if size > self.max_file_size {
            return Err(ProtocolError::AttachmentTooLarge {
                size,
                max: self.max_file_size,
            });
        }
        if self.transfers.contains_key(&meta.id) {
            debug!(message_id = %meta.id, "Ignoring repeated file-meta");
            return Ok(None);
        }

        if size == 0 {
            meta.attachment.verify(&[])?;
            info!(message_id = %meta.id, peer = %peer.short(), "Received empty file");
            return Ok(Some(TransferUpdate::Completed {
                peer: peer.clone(),
                message: ChatMessage::from_file(peer.clone(), meta, Bytes::new()),
            }));
        }

        info!(
            message_id = %meta.id,
            peer = %peer.short(),
            name = %meta.attachment.name,
            size,
            "Inbound file transfer started"
        );
        self.transfers.insert(
            meta.id,
            InboundTransfer {
                peer: peer.clone(),
                link,
                meta,
                total: None,
                chunks: BTreeMap::new(),
                received_bytes: 0,
                last_activity: Instant::now(),
            },
        );
        Ok(None)
    }

    /// `file-chunk-meta` arrived on `link`; the next binary frame on that
    /// link must carry this chunk.
    pub fn on_chunk_meta(
        &mut self,
        link: LinkId,
        message_id: Uuid,
        chunk_index: u32,
        total_chunks: u32,
    ) -> Result<(), ProtocolError> {
        self.announced.remove(&link);

        let transfer = self
            .transfers
            .get_mut(&message_id)
            .filter(|t| t.link == link)
            .ok_or(ProtocolError::UnknownTransfer(message_id))?;

        if total_chunks == 0 || u64::from(total_chunks) > transfer.meta.attachment.size {
            return Err(ProtocolError::ChunkOutOfRange {
                index: chunk_index,
                total: total_chunks,
            });
        }
        match transfer.total {
            Some(expected) if expected != total_chunks => {
                return Err(ProtocolError::ChunkTotalMismatch {
                    expected,
                    got: total_chunks,
                });
            }
            Some(_) => {}
            None => transfer.total = Some(total_chunks),
        }
        if chunk_index >= total_chunks {
            return Err(ProtocolError::ChunkOutOfRange {
                index: chunk_index,
                total: total_chunks,
            });
        }

        transfer.last_activity = Instant::now();
        self.announced.insert(link, (message_id, chunk_index));
        Ok(())
    }

    /// A binary frame arrived on `link`.
    ///
    /// A failed integrity check on the last chunk discards the transfer
    /// and reports the error.
    pub fn on_frame(
        &mut self,
        link: LinkId,
        raw: Bytes,
    ) -> Result<Option<TransferUpdate>, ProtocolError> {
        let expected = self
            .announced
            .remove(&link)
            .ok_or(ProtocolError::UnannouncedChunk)?;
        let frame = ChunkFrame::decode(raw)?;
        if (frame.message_id, frame.chunk_index) != expected {
            return Err(ProtocolError::UnannouncedChunk);
        }

        let transfer = self
            .transfers
            .get_mut(&frame.message_id)
            .ok_or(ProtocolError::UnknownTransfer(frame.message_id))?;
        transfer.last_activity = Instant::now();

        if transfer.chunks.contains_key(&frame.chunk_index) {
            debug!(message_id = %frame.message_id, chunk = frame.chunk_index, "Duplicate chunk ignored");
            return Ok(None);
        }

        let size = transfer.meta.attachment.size;
        let received_bytes = transfer.received_bytes + frame.data.len() as u64;
        if received_bytes > size {
            self.transfers.remove(&frame.message_id);
            return Err(ProtocolError::SizeMismatch {
                expected: size,
                got: received_bytes,
            });
        }
        transfer.received_bytes = received_bytes;
        transfer.chunks.insert(frame.chunk_index, frame.data);

        if !transfer.is_complete() {
            return Ok(Some(TransferUpdate::Progress {
                message_id: frame.message_id,
                peer: transfer.peer.clone(),
                received: transfer.chunks.len() as u32,
                total: transfer.total.unwrap_or(0),
            }));
        }

        let Some(transfer) = self.transfers.remove(&frame.message_id) else {
            return Ok(None);
        };
        let data = transfer.assemble();
        transfer.meta.attachment.verify(&data)?;
        info!(
            message_id = %transfer.meta.id,
            peer = %transfer.peer.short(),
            size = data.len(),
            "Inbound file transfer complete"
        );
        Ok(Some(TransferUpdate::Completed {
            peer: transfer.peer.clone(),
            message: ChatMessage::from_file(transfer.peer, transfer.meta, data),
        }))
    }

    /// The sender aborted `message_id`. Only the peer that started a
    /// transfer can abort it.
    pub fn abort(&mut self, peer: &PeerId, message_id: Uuid) -> Option<Abandoned> {
        if self.transfers.get(&message_id)?.peer != *peer {
            warn!(message_id = %message_id, peer = %peer.short(), "Abort from foreign peer ignored");
            return None;
        }
        let transfer = self.transfers.remove(&message_id)?;
        self.announced.retain(|_, (id, _)| *id != message_id);
        Some(abandoned(message_id, transfer))
    }

    /// Discard every transfer that was arriving on `link`.
    pub fn abandon_link(&mut self, link: LinkId) -> Vec<Abandoned> {
        self.announced.remove(&link);
        self.take_where(|t| t.link == link)
    }

    /// Discard transfers with no activity for longer than `idle`.
    pub fn sweep(&mut self, now: Instant, idle: Duration) -> Vec<Abandoned> {
        let stale = self.take_where(|t| now.saturating_duration_since(t.last_activity) > idle);
        if !stale.is_empty() {
            let ids: Vec<Uuid> = stale.iter().map(|a| a.message_id).collect();
            self.announced.retain(|_, (id, _)| !ids.contains(id));
        }
        stale
    }

    fn take_where(&mut self, pred: impl Fn(&InboundTransfer) -> bool) -> Vec<Abandoned> {
        let ids: Vec<Uuid> = self
            .transfers
            .iter()
            .filter(|(_, t)| pred(t))
            .map(|(id, _)| *id)
            .collect();
        ids.into_iter()
            .filter_map(|id| self.transfers.remove(&id).map(|t| abandoned(id, t)))
            .collect()
    }
}

fn abandoned(message_id: Uuid, transfer: InboundTransfer) -> Abandoned {
    Abandoned {
        message_id,
        peer: transfer.peer,
        received: transfer.chunks.len() as u32,
    }
}
