use std::collections::HashMap;

use shared::{domain::UserId, protocol::SessionDescription};
use tracing::debug;

/// Offers received before the local user has accepted or rejected, keyed by
/// the calling peer. A newer offer from the same peer silently replaces a
/// stale one; entries have no TTL.
#[derive(Debug, Default)]
pub struct PendingOfferStore {
    offers: HashMap<UserId, SessionDescription>,
}

impl PendingOfferStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&mut self, peer: UserId, offer: SessionDescription) {
        if self.offers.insert(peer.clone(), offer).is_some() {
            debug!(peer = %peer, "replaced stale pending offer");
        }
    }

    pub fn get(&self, peer: &UserId) -> Option<&SessionDescription> {
        self.offers.get(peer)
    }

    pub fn remove(&mut self, peer: &UserId) -> Option<SessionDescription> {
        self.offers.remove(peer)
    }

    pub fn clear(&mut self) {
        self.offers.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.offers.is_empty()
    }
}
