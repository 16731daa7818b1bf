//! Presence directory polling.
//!
//! The directory endpoint answers `GET` with a JSON array of online peer
//! ids. A background task polls it, diffs each answer against the set it
//! last reported, and emits one join or leave per changed peer.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use carelink_shared::constants::{PRESENCE_MAX_BACKOFF_MS, PRESENCE_POLL_INTERVAL_MS};
use carelink_shared::types::PeerId;

#[derive(Error, Debug)]
pub enum PresenceError {
    #[error("Directory request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Directory unavailable: {0}")]
    Unavailable(String),
}

/// Source of the online peer list.
pub trait DirectoryClient: Send + Sync + 'static {
    fn fetch(&self) -> BoxFuture<'_, Result<Vec<PeerId>, PresenceError>>;
}

/// Directory reached over HTTP.
#[derive(Debug, Clone)]
pub struct HttpDirectory {
    client: reqwest::Client,
    url: String,
}

impl HttpDirectory {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: url.into(),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

impl DirectoryClient for HttpDirectory {
    fn fetch(&self) -> BoxFuture<'_, Result<Vec<PeerId>, PresenceError>> {
        Box::pin(async move {
            let peers = self
                .client
                .get(&self.url)
                .send()
                .await?
                .error_for_status()?
                .json::<Vec<PeerId>>()
                .await?;
            Ok(peers)
        })
    }
}

/// Peers that appeared and disappeared between two polls.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PresenceDiff {
    pub added: Vec<PeerId>,
    pub removed: Vec<PeerId>,
}

impl PresenceDiff {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

/// The locally displayed presence list.
#[derive(Debug, Clone)]
pub struct PresenceTracker {
    local: PeerId,
    listed: BTreeSet<PeerId>,
}

impl PresenceTracker {
    pub fn new(local: PeerId) -> Self {
        Self {
            local,
            listed: BTreeSet::new(),
        }
    }

    /// Replace the listed set with `fetched` and return what changed.
    /// The local peer is never listed.
    pub fn apply(&mut self, fetched: impl IntoIterator<Item = PeerId>) -> PresenceDiff {
        let fetched: BTreeSet<PeerId> = fetched
            .into_iter()
            .filter(|id| *id != self.local)
            .collect();

        let diff = PresenceDiff {
            added: fetched.difference(&self.listed).cloned().collect(),
            removed: self.listed.difference(&fetched).cloned().collect(),
        };
        self.listed = fetched;
        diff
    }

    pub fn listed(&self) -> impl Iterator<Item = &PeerId> {
        self.listed.iter()
    }
}

/// Updates emitted by the poller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PresenceNotification {
    Joined(PeerId),
    Left(PeerId),
    DirectoryUnavailable { error: String, retry_in: Duration },
    DirectoryRestored,
}

#[derive(Debug, Clone)]
pub struct PollerConfig {
    pub interval: Duration,
    pub max_backoff: Duration,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(PRESENCE_POLL_INTERVAL_MS),
            max_backoff: Duration::from_millis(PRESENCE_MAX_BACKOFF_MS),
        }
    }
}

/// Delay before the next poll after `failures` consecutive failures.
pub fn backoff_delay(interval: Duration, max: Duration, failures: u32) -> Duration {
    let factor = 1u32.checked_shl(failures.min(16)).unwrap_or(u32::MAX);
    interval.saturating_mul(factor).min(max.max(interval))
}

/// Poll `directory` until the notification receiver is dropped.
pub fn spawn_presence_poller(
    directory: Arc<dyn DirectoryClient>,
    local: PeerId,
    config: PollerConfig,
    notif_tx: mpsc::Sender<PresenceNotification>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut tracker = PresenceTracker::new(local);
        let mut failures: u32 = 0;

        info!(interval_ms = config.interval.as_millis() as u64, "Presence poller started");

        loop {
            let delay = match directory.fetch().await {
                Ok(fetched) => {
                    if failures > 0 {
                        info!(failures, "Directory reachable again");
                        failures = 0;
                        if notif_tx.send(PresenceNotification::DirectoryRestored).await.is_err() {
                            break;
                        }
                    }

                    let diff = tracker.apply(fetched);
                    if !diff.is_empty() {
                        debug!(
                            added = diff.added.len(),
                            removed = diff.removed.len(),
                            "Presence changed"
                        );
                    }
                    let updates = diff
                        .removed
                        .into_iter()
                        .map(PresenceNotification::Left)
                        .chain(diff.added.into_iter().map(PresenceNotification::Joined));
                    let mut closed = false;
                    for update in updates {
                        if notif_tx.send(update).await.is_err() {
                            closed = true;
                            break;
                        }
                    }
                    if closed {
                        break;
                    }
                    config.interval
                }
                Err(e) => {
                    failures = failures.saturating_add(1);
                    let retry_in = backoff_delay(config.interval, config.max_backoff, failures);
                    warn!(
                        error = %e,
                        failures,
                        retry_ms = retry_in.as_millis() as u64,
                        "Failed to fetch peer directory"
                    );
                    let unavailable = PresenceNotification::DirectoryUnavailable {
                        error: e.to_string(),
                        retry_in,
                    };
                    if notif_tx.send(unavailable).await.is_err() {
                        break;
                    }
                    retry_in
                }
            };

            tokio::time::sleep(delay).await;
        }

        debug!("Presence poller stopped");
    })
}
