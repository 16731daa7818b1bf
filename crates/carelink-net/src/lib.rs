// Transport adapter and presence polling on top of an external
// peer-to-peer connection library.

pub mod loopback;
pub mod presence;
pub mod transport;

pub use loopback::{LoopbackHub, LoopbackTransport};
pub use presence::{
    spawn_presence_poller, DirectoryClient, HttpDirectory, PollerConfig, PresenceDiff,
    PresenceError, PresenceNotification, PresenceTracker,
};
pub use transport::{
    CallHandle, DataChannel, LinkHandle, MediaCall, Transport, TransportAdapter, TransportError,
    TransportEvent,
};
