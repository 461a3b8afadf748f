use std::sync::Arc;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use shared::{
    domain::UserId,
    protocol::{IceCandidate, SessionDescription},
};
use thiserror::Error;
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, info, warn};

use crate::pending::PendingOfferStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl LinkState {
    /// Terminal states run the same cleanup path as an explicit hangup.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Disconnected | Self::Failed | Self::Closed)
    }
}

#[derive(Debug, Clone)]
pub enum LinkEvent {
    LocalCandidate(IceCandidate),
    StateChanged(LinkState),
}

/// The peer-connection primitive, behind a seam so the core never depends
/// on a concrete media stack.
#[async_trait]
pub trait PeerLink: Send + Sync {
    async fn create_offer(&self) -> Result<SessionDescription>;
    async fn create_answer(&self) -> Result<SessionDescription>;
    async fn set_remote_description(&self, description: SessionDescription) -> Result<()>;
    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()>;
    async fn close(&self);
    fn subscribe_events(&self) -> broadcast::Receiver<LinkEvent>;
}

#[async_trait]
pub trait PeerConnector: Send + Sync {
    async fn open(&self) -> Result<Arc<dyn PeerLink>>;
}

/// Stand-in for builds without a media backend.
pub struct MissingPeerConnector;

#[async_trait]
impl PeerConnector for MissingPeerConnector {
    async fn open(&self) -> Result<Arc<dyn PeerLink>> {
        Err(anyhow!("no media backend is available"))
    }
}

#[derive(Debug, Error)]
pub enum NegotiationError {
    #[error("no cached offer from {0} to accept")]
    MissingOffer(UserId),
    #[error("no peer link is open")]
    NoLink,
    #[error("peer link failure: {0}")]
    Link(String),
}

struct CoordinatorState {
    link: Option<Arc<dyn PeerLink>>,
    remote_description_set: bool,
    queued_candidates: Vec<IceCandidate>,
}

/// Drives offer/answer/candidate exchange against the peer link.
///
/// Remote candidates may trickle in before the remote description exists;
/// they are queued here and flushed in arrival order once it does, so an
/// early candidate is never an error. This is also the only component that
/// consumes entries from the pending-offer store.
pub struct NegotiationCoordinator {
    connector: Arc<dyn PeerConnector>,
    inner: Mutex<CoordinatorState>,
}

impl NegotiationCoordinator {
    pub fn new(connector: Arc<dyn PeerConnector>) -> Self {
        Self {
            connector,
            inner: Mutex::new(CoordinatorState {
                link: None,
                remote_description_set: false,
                queued_candidates: Vec::new(),
            }),
        }
    }

    /// Caller side: open a link and produce the local offer.
    pub async fn start_outbound(
        &self,
    ) -> Result<(SessionDescription, broadcast::Receiver<LinkEvent>), NegotiationError> {
        let link = self.open_link().await?;
        let events = link.subscribe_events();
        let offer = link
            .create_offer()
            .await
            .map_err(|err| NegotiationError::Link(err.to_string()))?;
        debug!("local offer created");
        Ok((offer, events))
    }

    /// Callee side: open a link, apply the consumed offer and produce the
    /// answer.
    pub async fn accept_inbound(
        &self,
        offer: SessionDescription,
    ) -> Result<(SessionDescription, broadcast::Receiver<LinkEvent>), NegotiationError> {
        let link = self.open_link().await?;
        let events = link.subscribe_events();
        link.set_remote_description(offer)
            .await
            .map_err(|err| NegotiationError::Link(err.to_string()))?;
        self.mark_remote_description_set().await?;
        let answer = link
            .create_answer()
            .await
            .map_err(|err| NegotiationError::Link(err.to_string()))?;
        debug!("local answer created");
        Ok((answer, events))
    }

    /// Caller side: apply the remote answer, then flush any candidates that
    /// arrived early.
    pub async fn apply_answer(&self, answer: SessionDescription) -> Result<(), NegotiationError> {
        let link = self.current_link().await.ok_or(NegotiationError::NoLink)?;
        link.set_remote_description(answer)
            .await
            .map_err(|err| NegotiationError::Link(err.to_string()))?;
        self.mark_remote_description_set().await?;
        Ok(())
    }

    /// Queues the candidate while the remote description is still missing,
    /// forwards it otherwise.
    pub async fn add_remote_candidate(&self, candidate: IceCandidate) -> Result<(), NegotiationError> {
        let link = {
            let mut state = self.inner.lock().await;
            if state.link.is_none() || !state.remote_description_set {
                debug!("queueing early ICE candidate");
                state.queued_candidates.push(candidate);
                return Ok(());
            }
            state.link.clone()
        };
        if let Some(link) = link {
            link.add_ice_candidate(candidate)
                .await
                .map_err(|err| NegotiationError::Link(err.to_string()))?;
        }
        Ok(())
    }

    /// The single deletion point for pending offers.
    pub fn consume_offer(
        &self,
        store: &mut PendingOfferStore,
        peer: &UserId,
    ) -> Result<SessionDescription, NegotiationError> {
        store
            .remove(peer)
            .ok_or_else(|| NegotiationError::MissingOffer(peer.clone()))
    }

    pub fn discard_offer(&self, store: &mut PendingOfferStore, peer: &UserId) {
        if store.remove(peer).is_some() {
            debug!(peer = %peer, "discarded pending offer");
        }
    }

    /// Releases the link and resets negotiation state. Shared by explicit
    /// hangup and terminal link states.
    pub async fn close(&self) {
        let link = {
            let mut state = self.inner.lock().await;
            state.remote_description_set = false;
            state.queued_candidates.clear();
            state.link.take()
        };
        if let Some(link) = link {
            info!("closing peer link");
            link.close().await;
        }
    }

    async fn open_link(&self) -> Result<Arc<dyn PeerLink>, NegotiationError> {
        let link = self
            .connector
            .open()
            .await
            .map_err(|err| NegotiationError::Link(err.to_string()))?;
        let mut state = self.inner.lock().await;
        if let Some(previous) = state.link.take() {
            warn!("replacing an existing peer link");
            previous.close().await;
        }
        state.remote_description_set = false;
        state.queued_candidates.clear();
        state.link = Some(Arc::clone(&link));
        Ok(link)
    }

    async fn current_link(&self) -> Option<Arc<dyn PeerLink>> {
        self.inner.lock().await.link.clone()
    }

    async fn mark_remote_description_set(&self) -> Result<(), NegotiationError> {
        let (link, queued) = {
            let mut state = self.inner.lock().await;
            state.remote_description_set = true;
            let queued = std::mem::take(&mut state.queued_candidates);
            (state.link.clone(), queued)
        };
        let link = link.ok_or(NegotiationError::NoLink)?;
        for candidate in queued {
            debug!("flushing queued ICE candidate");
            link.add_ice_candidate(candidate)
                .await
                .map_err(|err| NegotiationError::Link(err.to_string()))?;
        }
        Ok(())
    }
}

#[cfg(test)]
#[path = "tests/negotiation_tests.rs"]
mod tests;
