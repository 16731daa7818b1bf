//! Chat and file transfer over per-peer data links.

pub mod conversation;
pub mod links;
pub mod sender;
pub mod transfer;

pub use conversation::{Attachment, ChatMessage, Conversations};
pub use links::{LinkRegistry, LinkStatus, LinkWriter};
pub use sender::{OutboundFile, SendOutcome, SendSettings, TransferReport};
pub use transfer::{Abandoned, TransferTable, TransferUpdate};
