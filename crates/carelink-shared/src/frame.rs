//! Binary chunk framing.
//!
//! Every binary payload on a data link starts with a short header naming
//! the transfer it belongs to, so reassembly never depends on which
//! transfer happens to be in flight.
//!
//! ```text
//! +---------+------------------+-------------+-----------+
//! | version | message id       | chunk index | data      |
//! | 1 byte  | 16 bytes (UUID)  | u32 BE      | remaining |
//! +---------+------------------+-------------+-----------+
//! ```

use bytes::{Buf, BufMut, Bytes, BytesMut};
use uuid::Uuid;

use crate::constants::FRAME_VERSION;
use crate::error::ProtocolError;

pub const FRAME_HEADER_LEN: usize = 1 + 16 + 4;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkFrame {
    pub message_id: Uuid,
    pub chunk_index: u32,
    pub data: Bytes,
}

impl ChunkFrame {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(FRAME_HEADER_LEN + self.data.len());
        buf.put_u8(FRAME_VERSION);
        buf.put_slice(self.message_id.as_bytes());
        buf.put_u32(self.chunk_index);
        buf.put_slice(&self.data);
        buf.freeze()
    }

    pub fn decode(mut raw: Bytes) -> Result<Self, ProtocolError> {
        if raw.len() < FRAME_HEADER_LEN {
            return Err(ProtocolError::FrameTooShort(raw.len()));
        }
        let version = raw.get_u8();
        if version != FRAME_VERSION {
            return Err(ProtocolError::UnsupportedFrameVersion(version));
        }
        let mut id = [0u8; 16];
        raw.copy_to_slice(&mut id);
        let chunk_index = raw.get_u32();
        Ok(Self {
            message_id: Uuid::from_bytes(id),
            chunk_index,
            data: raw,
        })
    }
}

/// Number of chunks a buffer of `len` bytes splits into.
pub fn chunk_count(len: usize, chunk_size: usize) -> u32 {
    if chunk_size == 0 {
        return 0;
    }
    len.div_ceil(chunk_size) as u32
}

/// Split `data` into framed chunks of at most `chunk_size` bytes.
pub fn split_into_frames(message_id: Uuid, data: &Bytes, chunk_size: usize) -> Vec<ChunkFrame> {
    if chunk_size == 0 {
        return Vec::new();
    }
    (0..data.len())
        .step_by(chunk_size)
        .enumerate()
        .map(|(index, start)| ChunkFrame {
            message_id,
            chunk_index: index as u32,
            data: data.slice(start..(start + chunk_size).min(data.len())),
        })
        .collect()
}
