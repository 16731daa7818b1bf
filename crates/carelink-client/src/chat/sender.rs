//! Outbound file transfer.
//!
//! A transfer runs as its own task: `file-meta`, then one
//! `file-chunk-meta` + binary frame pair per chunk, throttled by a fixed
//! delay. Each pair goes out as one batch so it stays contiguous on the
//! link. Setting the cancel flag stops the task, which then tells the
//! receiver to discard what it has.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use carelink_shared::frame::split_into_frames;
use carelink_shared::protocol::{Envelope, FileMessageMeta, Payload};
use carelink_shared::types::PeerId;

use super::links::LinkWriter;
use crate::error::ClientError;

#[derive(Debug, Clone, Copy)]
pub struct SendSettings {
    pub chunk_size: usize,
    pub chunk_delay: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendOutcome {
    Completed,
    Cancelled,
    Failed(String),
}

/// Reports from running transfers back to the client actor.
#[derive(Debug)]
pub enum TransferReport {
    Progress {
        message_id: Uuid,
        peer: PeerId,
        sent: u32,
        total: u32,
    },
    Finished {
        message_id: Uuid,
        peer: PeerId,
        outcome: SendOutcome,
    },
}

/// One outbound transfer, ready to run once its link is open.
#[derive(Debug)]
pub struct OutboundFile {
    pub peer: PeerId,
    pub meta: FileMessageMeta,
    pub data: Bytes,
    pub cancel: Arc<AtomicBool>,
}

impl OutboundFile {
    pub fn message_id(&self) -> Uuid {
        self.meta.id
    }

    pub async fn run(
        self,
        writer: LinkWriter,
        settings: SendSettings,
        reports: mpsc::UnboundedSender<TransferReport>,
    ) {
        let message_id = self.meta.id;
        let peer = self.peer.clone();
        let outcome = match self.transmit(&writer, settings, &reports).await {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(message_id = %message_id, peer = %peer.short(), error = %e, "File send failed");
                SendOutcome::Failed(e.to_string())
            }
        };
        let _ = reports.send(TransferReport::Finished {
            message_id,
            peer,
            outcome,
        });
    }

    async fn transmit(
        self,
        writer: &LinkWriter,
        settings: SendSettings,
        reports: &mpsc::UnboundedSender<TransferReport>,
    ) -> Result<SendOutcome, ClientError> {
        let message_id = self.meta.id;
        let frames = split_into_frames(message_id, &self.data, settings.chunk_size);
        let total = frames.len() as u32;

        info!(
            message_id = %message_id,
            peer = %self.peer.short(),
            size = self.data.len(),
            chunks = total,
            "Sending file"
        );
        let announce = Envelope::FileMeta { message: self.meta }.to_payload()?;
        writer.send_batch(vec![announce])?;

        for frame in frames {
            if self.cancel.load(Ordering::Acquire) {
                return Ok(abort(writer, message_id));
            }

            let chunk_meta = Envelope::FileChunkMeta {
                message_id,
                chunk_index: frame.chunk_index,
                total_chunks: total,
            }
            .to_payload()?;
            writer.send_batch(vec![chunk_meta, Payload::Binary(frame.encode())])?;

            let _ = reports.send(TransferReport::Progress {
                message_id,
                peer: self.peer.clone(),
                sent: frame.chunk_index + 1,
                total,
            });

            if !settings.chunk_delay.is_zero() {
                tokio::time::sleep(settings.chunk_delay).await;
            }
        }

        debug!(message_id = %message_id, "All chunks sent");
        Ok(SendOutcome::Completed)
    }
}

fn abort(writer: &LinkWriter, message_id: Uuid) -> SendOutcome {
    info!(message_id = %message_id, "File send cancelled");
    let notice = Envelope::FileAbort { message_id }.to_payload();
    match notice.map(|p| writer.send_batch(vec![p])) {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!(message_id = %message_id, error = %e, "Could not send file-abort"),
        Err(e) => warn!(message_id = %message_id, error = %e, "Could not encode file-abort"),
    }
    SendOutcome::Cancelled
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    use carelink_net::transport::TransportEvent;
    use carelink_net::{LoopbackHub, Transport};
    use carelink_shared::frame::ChunkFrame;
    use carelink_shared::protocol::AttachmentMeta;

    use crate::chat::links::LinkRegistry;

    async fn open_writer(hub: &LoopbackHub) -> (LinkWriter, mpsc::UnboundedReceiver<TransportEvent>) {
        let (a, _a_rx) = hub.transport();
        let (b, b_rx) = hub.transport();
        a.open(Some(PeerId::new("a"))).await.unwrap();
        b.open(Some(PeerId::new("b"))).await.unwrap();
        let link = a.connect(&PeerId::new("b")).unwrap();
        let link_id = link.id();

        let mut registry = LinkRegistry::new();
        registry.insert_outgoing(link);
        let opened = registry.on_open(link_id).unwrap();
        (opened.writer, b_rx)
    }

    fn outbound(data: &'static [u8]) -> OutboundFile {
        OutboundFile {
            peer: PeerId::new("b"),
            meta: FileMessageMeta {
                id: Uuid::new_v4(),
                sender: PeerId::new("a"),
                text: String::new(),
                timestamp: Utc::now(),
                attachment: AttachmentMeta::describe("notes.txt", "text/plain", data),
            },
            data: Bytes::from_static(data),
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }

    fn payloads(rx: &mut mpsc::UnboundedReceiver<TransportEvent>) -> Vec<Payload> {
        let mut out = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let TransportEvent::LinkData { payload, .. } = event {
                out.push(payload);
            }
        }
        out
    }

    #[tokio::test]
    async fn sends_meta_then_chunk_pairs() {
        let hub = LoopbackHub::new();
        let (writer, mut rx) = open_writer(&hub).await;
        let (report_tx, mut report_rx) = mpsc::unbounded_channel();
        let file = outbound(b"0123456789");
        let id = file.message_id();

        let settings = SendSettings {
            chunk_size: 4,
            chunk_delay: Duration::ZERO,
        };
        file.run(writer, settings, report_tx).await;

        let sent = payloads(&mut rx);
        assert_eq!(sent.len(), 1 + 2 * 3);
        assert!(matches!(
            &sent[0],
            Payload::Text(t) if matches!(Envelope::from_json(t).unwrap(), Envelope::FileMeta { .. })
        ));
        for (i, pair) in sent[1..].chunks(2).enumerate() {
            match (&pair[0], &pair[1]) {
                (Payload::Text(meta), Payload::Binary(raw)) => {
                    assert_eq!(
                        Envelope::from_json(meta).unwrap(),
                        Envelope::FileChunkMeta {
                            message_id: id,
                            chunk_index: i as u32,
                            total_chunks: 3
                        }
                    );
                    assert_eq!(ChunkFrame::decode(raw.clone()).unwrap().chunk_index, i as u32);
                }
                other => panic!("unexpected {other:?}"),
            }
        }

        let mut last = None;
        while let Ok(report) = report_rx.try_recv() {
            last = Some(report);
        }
        assert!(matches!(
            last,
            Some(TransferReport::Finished { outcome: SendOutcome::Completed, .. })
        ));
    }

    #[tokio::test]
    async fn empty_file_sends_only_meta() {
        let hub = LoopbackHub::new();
        let (writer, mut rx) = open_writer(&hub).await;
        let (report_tx, _report_rx) = mpsc::unbounded_channel();
        let settings = SendSettings {
            chunk_size: 4,
            chunk_delay: Duration::ZERO,
        };
        outbound(b"").run(writer, settings, report_tx).await;
        assert_eq!(payloads(&mut rx).len(), 1);
    }

    #[tokio::test]
    async fn cancelled_send_emits_abort() {
        let hub = LoopbackHub::new();
        let (writer, mut rx) = open_writer(&hub).await;
        let (report_tx, mut report_rx) = mpsc::unbounded_channel();
        let file = outbound(b"0123456789");
        let id = file.message_id();
        file.cancel.store(true, Ordering::Release);

        let settings = SendSettings {
            chunk_size: 4,
            chunk_delay: Duration::ZERO,
        };
        file.run(writer, settings, report_tx).await;

        let sent = payloads(&mut rx);
        assert_eq!(sent.len(), 2);
        match &sent[1] {
            Payload::Text(t) => assert_eq!(
                Envelope::from_json(t).unwrap(),
                Envelope::FileAbort { message_id: id }
            ),
            other => panic!("unexpected {other:?}"),
        }
        assert!(matches!(
            report_rx.try_recv().unwrap(),
            TransferReport::Finished { outcome: SendOutcome::Cancelled, .. }
        ));
    }
}
