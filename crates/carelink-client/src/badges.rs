//! Unread badges and conversation view state.
//!
//! A conversation is visible while it is open and not minimized. Messages
//! that arrive for a peer whose conversation is not visible set that
//! peer's badge; opening the conversation clears it.

use std::collections::{BTreeMap, BTreeSet};

use serde::Serialize;

use carelink_shared::types::PeerId;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConversationView {
    pub peer: PeerId,
    pub minimized: bool,
}

#[derive(Debug, Default)]
pub struct BadgeTracker {
    views: BTreeMap<PeerId, bool>,
    unread: BTreeSet<PeerId>,
}

impl BadgeTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_visible(&self, peer: &PeerId) -> bool {
        self.views.get(peer).is_some_and(|minimized| !minimized)
    }

    pub fn has_badge(&self, peer: &PeerId) -> bool {
        self.unread.contains(peer)
    }

    /// A message from `peer` was received. Returns `true` when this set
    /// the badge.
    pub fn on_message(&mut self, peer: &PeerId) -> bool {
        if self.is_visible(peer) {
            return false;
        }
        self.unread.insert(peer.clone())
    }

    /// Open or restore the conversation. Returns `true` when a badge was
    /// cleared.
    pub fn open(&mut self, peer: &PeerId) -> bool {
        self.views.insert(peer.clone(), false);
        self.unread.remove(peer)
    }

    /// Minimize an open conversation. Returns `false` when it was not open.
    pub fn minimize(&mut self, peer: &PeerId) -> bool {
        match self.views.get_mut(peer) {
            Some(minimized) => {
                *minimized = true;
                true
            }
            None => false,
        }
    }

    /// Close the conversation. Returns `true` when a badge was cleared.
    pub fn close(&mut self, peer: &PeerId) -> bool {
        self.views.remove(peer);
        self.unread.remove(peer)
    }

    pub fn unread(&self) -> impl Iterator<Item = &PeerId> {
        self.unread.iter()
    }

    pub fn views(&self) -> Vec<ConversationView> {
        self.views
            .iter()
            .map(|(peer, minimized)| ConversationView {
                peer: peer.clone(),
                minimized: *minimized,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn badge_set_while_hidden_and_cleared_on_open() {
        let bob = PeerId::new("bob");
        let mut badges = BadgeTracker::new();
        assert!(badges.on_message(&bob));
        assert!(!badges.on_message(&bob));
        assert!(badges.has_badge(&bob));

        assert!(badges.open(&bob));
        assert!(!badges.has_badge(&bob));
        assert!(!badges.on_message(&bob));
    }

    #[test]
    fn minimized_conversation_collects_badges() {
        let bob = PeerId::new("bob");
        let mut badges = BadgeTracker::new();
        badges.open(&bob);
        assert!(badges.minimize(&bob));
        assert!(!badges.is_visible(&bob));
        assert!(badges.on_message(&bob));
        assert_eq!(
            badges.views(),
            vec![ConversationView {
                peer: bob.clone(),
                minimized: true
            }]
        );

        assert!(badges.close(&bob));
        assert!(badges.views().is_empty());
        assert!(!badges.minimize(&bob));
    }

    #[test]
    fn badges_are_per_peer() {
        let mut badges = BadgeTracker::new();
        badges.open(&PeerId::new("bob"));
        assert!(!badges.on_message(&PeerId::new("bob")));
        assert!(badges.on_message(&PeerId::new("carol")));
        assert_eq!(badges.unread().cloned().collect::<Vec<_>>(), vec![PeerId::new("carol")]);
    }
}
