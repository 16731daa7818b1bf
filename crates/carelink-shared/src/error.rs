use thiserror::Error;

#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Malformed envelope: {0}")]
    MalformedEnvelope(#[from] serde_json::Error),

    #[error("Chunk frame too short: {0} bytes")]
    FrameTooShort(usize),

    #[error("Unsupported chunk frame version: {0}")]
    UnsupportedFrameVersion(u8),

    #[error("Chunk {index} out of range (total {total})")]
    ChunkOutOfRange { index: u32, total: u32 },

    #[error("Chunk total changed from {expected} to {got}")]
    ChunkTotalMismatch { expected: u32, got: u32 },

    #[error("Binary chunk does not match the announced chunk")]
    UnannouncedChunk,

    #[error("Unknown transfer: {0}")]
    UnknownTransfer(uuid::Uuid),

    #[error("Attachment too large: {size} bytes (max {max})")]
    AttachmentTooLarge { size: u64, max: u64 },

    #[error("Reassembled size {got} does not match declared size {expected}")]
    SizeMismatch { expected: u64, got: u64 },

    #[error("Attachment digest mismatch")]
    DigestMismatch,
}
