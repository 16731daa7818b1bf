/// Application name
pub const APP_NAME: &str = "CareLink";

/// Maximum attachment size accepted for sending or receiving (10 MiB)
pub const MAX_FILE_SIZE: usize = 10 * 1024 * 1024;

/// Size of one binary file chunk on a data link (16 KiB)
pub const CHUNK_SIZE: usize = 16 * 1024;

/// Delay inserted between outgoing chunks, in milliseconds
pub const CHUNK_DELAY_MS: u64 = 10;

/// Bounded wait for a data link to open, in milliseconds
pub const LINK_OPEN_TIMEOUT_MS: u64 = 5_000;

/// Presence directory poll cadence, in milliseconds
pub const PRESENCE_POLL_INTERVAL_MS: u64 = 5_000;

/// Upper bound for the directory poll backoff, in milliseconds
pub const PRESENCE_MAX_BACKOFF_MS: u64 = 60_000;

/// Idle time after which a partial inbound transfer is discarded, in milliseconds
pub const TRANSFER_IDLE_TIMEOUT_MS: u64 = 60_000;

/// Version byte leading every binary chunk frame
pub const FRAME_VERSION: u8 = 1;

/// Fallback MIME type for attachments without a declared type
pub const DEFAULT_MIME_TYPE: &str = "application/octet-stream";

/// Settings key under which the local peer id is persisted
pub const SETTING_LOCAL_PEER_ID: &str = "local_peer_id";
