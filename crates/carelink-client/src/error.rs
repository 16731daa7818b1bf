use std::time::Duration;

use thiserror::Error;
use uuid::Uuid;

use carelink_media::CallError;
use carelink_net::TransportError;
use carelink_shared::ProtocolError;
use carelink_store::StoreError;

/// Why a data link could not be used.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LinkError {
    #[error("Data link did not open within {0:?}")]
    Timeout(Duration),

    #[error("Data link closed")]
    Closed,

    #[error("Data link failed: {0}")]
    Failed(String),
}

#[derive(Error, Debug)]
pub enum ClientError {
    #[error("Call error: {0}")]
    Call(#[from] CallError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Link error: {0}")]
    Link(#[from] LinkError),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("No outgoing transfer {0}")]
    UnknownTransfer(Uuid),

    #[error("Client is not running")]
    Closed,
}
