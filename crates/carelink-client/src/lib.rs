pub mod badges;
pub mod chat;
pub mod config;
pub mod error;
pub mod events;
pub mod handle;
pub mod manager;

use tracing_subscriber::{fmt, EnvFilter};

pub use badges::{BadgeTracker, ConversationView};
pub use chat::{Attachment, ChatMessage};
pub use config::ClientConfig;
pub use error::{ClientError, LinkError};
pub use events::{ClientEvent, ClientSnapshot, LinkSummary};
pub use handle::ClientHandle;
pub use manager::{spawn_client, ClientDeps};

/// Install the global log subscriber. `RUST_LOG` overrides the default
/// filter. Calling it again is a no-op.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(
            "carelink_client=debug,carelink_net=debug,carelink_media=info,carelink_store=info,warn",
        )
    });

    let _ = fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .try_init();
}
