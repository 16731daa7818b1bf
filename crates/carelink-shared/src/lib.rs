//! Types shared by every CareLink crate: identifiers, media stream
//! handles, and the data-link wire protocol.

pub mod constants;
pub mod error;
pub mod frame;
pub mod protocol;
pub mod stream;
pub mod types;

pub use error::ProtocolError;
pub use protocol::{AttachmentMeta, Envelope, FileMessageMeta, Payload};
pub use stream::{MediaStream, MediaTrack, TrackKind};
pub use types::{CallId, LinkId, PeerId};
