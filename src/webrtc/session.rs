//! Signaling Session
//!
//! Per-peer negotiation state machine. Drives a `MediaSession` from the
//! offer/answer/candidate messages received over one rendezvous connection:
//! - deterministic offerer selection (higher peer id offers)
//! - buffering of candidates that arrive before a remote description
//! - offer collision handling and explicit negotiation restarts

use super::signaling::{IceCandidate, SignalingMessage};
use super::{MediaSession, MediaState, NegotiationError};
use crate::transport::PeerId;
use bytes::Bytes;
use log::{debug, info, warn};
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Session state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    /// Created, not yet attached to a connection
    Idle,
    /// Connection up, no negotiation started
    Connected,
    /// Offer/answer exchange in progress
    Negotiating,
    /// Media path connected
    Established,
    /// Connection closed (intentionally or by the peer)
    Closed,
    /// Unrecoverable negotiation error
    Failed,
}

impl SessionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Closed | SessionState::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Idle => "idle",
            SessionState::Connected => "connected",
            SessionState::Negotiating => "negotiating",
            SessionState::Established => "established",
            SessionState::Closed => "closed",
            SessionState::Failed => "failed",
        }
    }
}

/// Which side starts the negotiation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Offerer,
    Answerer,
}

impl Role {
    /// The lexicographically higher identifier offers. Equal identifiers
    /// (a node talking to itself) never offer.
    pub fn resolve(local: &PeerId, remote: &PeerId) -> Self {
        if local > remote {
            Role::Offerer
        } else {
            Role::Answerer
        }
    }
}

/// Outbound half of a signaling connection
#[derive(Debug, Clone)]
pub struct SignalSender {
    tx: mpsc::UnboundedSender<Bytes>,
}

impl SignalSender {
    pub fn new(tx: mpsc::UnboundedSender<Bytes>) -> Self {
        Self { tx }
    }

    pub fn send(&self, message: &SignalingMessage) -> Result<(), NegotiationError> {
        let json = message.to_json()?;
        self.tx.send(Bytes::from(json)).map_err(|_| NegotiationError::ConnectionClosed)
    }
}

/// Negotiation state for one participant
pub struct SignalingSession {
    local_id: PeerId,
    remote_id: PeerId,
    role: Role,
    state: SessionState,
    media: Arc<dyn MediaSession>,
    outbound: SignalSender,
    pending_candidates: VecDeque<IceCandidate>,
    remote_description_set: bool,
    local_offer_pending: bool,
    media_connected: bool,
    restarts: u32,
    transitions: Vec<SessionState>,
}

impl SignalingSession {
    pub fn new(local_id: PeerId, remote_id: PeerId, media: Arc<dyn MediaSession>, outbound: SignalSender) -> Self {
        let role = Role::resolve(&local_id, &remote_id);
        Self {
            local_id,
            remote_id,
            role,
            state: SessionState::Idle,
            media,
            outbound,
            pending_candidates: VecDeque::new(),
            remote_description_set: false,
            local_offer_pending: false,
            media_connected: false,
            restarts: 0,
            transitions: Vec::new(),
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn remote_id(&self) -> &PeerId {
        &self.remote_id
    }

    pub fn media(&self) -> &Arc<dyn MediaSession> {
        &self.media
    }

    pub fn outbound(&self) -> &SignalSender {
        &self.outbound
    }

    /// Candidates waiting for a remote description
    pub fn buffered_candidates(&self) -> usize {
        self.pending_candidates.len()
    }

    pub fn restarts(&self) -> u32 {
        self.restarts
    }

    pub fn is_established(&self) -> bool {
        self.state == SessionState::Established
    }

    fn set_state(&mut self, state: SessionState) {
        if self.state != state {
            debug!("Session {} state change: {:?} -> {:?}", self.remote_id.short(), self.state, state);
            self.state = state;
            self.transitions.push(state);
        }
    }

    /// States entered since the last call, oldest first
    pub fn drain_transitions(&mut self) -> Vec<SessionState> {
        std::mem::take(&mut self.transitions)
    }

    /// Attach to a live connection; the offering side sends its offer.
    pub async fn start(&mut self) -> Result<(), NegotiationError> {
        if self.state != SessionState::Idle {
            return Err(NegotiationError::InvalidState { operation: "start", state: self.state });
        }
        self.set_state(SessionState::Connected);
        debug!(
            "Session {} started as {:?} (local {})",
            self.remote_id.short(),
            self.role,
            self.local_id.short()
        );
        if self.role == Role::Offerer {
            self.send_offer(false).await?;
        }
        Ok(())
    }

    async fn send_offer(&mut self, ice_restart: bool) -> Result<(), NegotiationError> {
        let sdp = self.media.create_offer(ice_restart).await?;
        self.local_offer_pending = true;
        self.outbound.send(&SignalingMessage::offer(sdp))?;
        self.set_state(SessionState::Negotiating);
        Ok(())
    }

    /// Handle an inbound negotiation message.
    pub async fn handle_signal(&mut self, message: SignalingMessage) -> Result<(), NegotiationError> {
        if self.state.is_terminal() {
            debug!("Session {} ignoring {} after close", self.remote_id.short(), message.kind());
            return Ok(());
        }
        if self.state == SessionState::Idle {
            return Err(NegotiationError::OutOfSequence { message: message.kind(), state: self.state });
        }

        match message {
            SignalingMessage::Offer { sdp } => self.on_offer(&sdp).await,
            SignalingMessage::Answer { sdp } => self.on_answer(&sdp).await,
            SignalingMessage::Candidate { candidate } => {
                self.on_candidate(candidate).await;
                Ok(())
            }
            other @ (SignalingMessage::Audio { .. } | SignalingMessage::UserInfo { .. }) => {
                Err(NegotiationError::OutOfSequence { message: other.kind(), state: self.state })
            }
        }
    }

    async fn on_offer(&mut self, sdp: &str) -> Result<(), NegotiationError> {
        if self.local_offer_pending {
            match self.role {
                Role::Offerer => {
                    debug!("Session {}: offer collision, keeping local offer", self.remote_id.short());
                    return Ok(());
                }
                Role::Answerer => {
                    debug!("Session {}: offer collision, rolling back local offer", self.remote_id.short());
                    self.media.rollback().await?;
                    self.local_offer_pending = false;
                }
            }
        }

        let answer = self.media.accept_offer(sdp).await?;
        self.remote_description_set = true;
        self.set_state(SessionState::Negotiating);
        self.flush_candidates().await;
        self.outbound.send(&SignalingMessage::answer(answer))?;
        self.check_established();
        Ok(())
    }

    async fn on_answer(&mut self, sdp: &str) -> Result<(), NegotiationError> {
        if !self.local_offer_pending {
            return Err(NegotiationError::OutOfSequence { message: "answer", state: self.state });
        }
        self.media.accept_answer(sdp).await?;
        self.local_offer_pending = false;
        self.remote_description_set = true;
        self.flush_candidates().await;
        self.check_established();
        Ok(())
    }

    async fn on_candidate(&mut self, candidate: IceCandidate) {
        if self.remote_description_set {
            if let Err(e) = self.media.add_ice_candidate(&candidate).await {
                warn!("Session {}: candidate rejected: {}", self.remote_id.short(), e);
            }
        } else {
            self.pending_candidates.push_back(candidate);
        }
    }

    async fn flush_candidates(&mut self) {
        if !self.pending_candidates.is_empty() {
            debug!(
                "Session {}: applying {} buffered candidates",
                self.remote_id.short(),
                self.pending_candidates.len()
            );
        }
        while let Some(candidate) = self.pending_candidates.pop_front() {
            if let Err(e) = self.media.add_ice_candidate(&candidate).await {
                warn!("Session {}: buffered candidate rejected: {}", self.remote_id.short(), e);
            }
        }
    }

    fn check_established(&mut self) {
        if self.state == SessionState::Negotiating
            && self.media_connected
            && self.remote_description_set
            && !self.local_offer_pending
        {
            info!("Session {} established", self.remote_id.short());
            self.set_state(SessionState::Established);
        }
    }

    /// React to a media connection state change.
    pub fn on_media_state(&mut self, state: MediaState) -> Result<(), NegotiationError> {
        if self.state.is_terminal() {
            return Ok(());
        }
        match state {
            MediaState::Connected => {
                self.media_connected = true;
                self.check_established();
            }
            MediaState::Failed => {
                self.media_connected = false;
                return Err(NegotiationError::MediaFailed);
            }
            MediaState::New | MediaState::Connecting | MediaState::Disconnected => {
                self.media_connected = false;
            }
            MediaState::Closed => {}
        }
        Ok(())
    }

    /// Forward a locally gathered candidate to the peer.
    pub fn on_local_candidate(&mut self, candidate: IceCandidate) -> Result<(), NegotiationError> {
        if self.state.is_terminal() {
            return Ok(());
        }
        self.outbound.send(&SignalingMessage::candidate(candidate))
    }

    /// Re-offer with a fresh network path discovery cycle.
    pub async fn restart(&mut self) -> Result<(), NegotiationError> {
        let restartable = matches!(self.state, SessionState::Negotiating | SessionState::Established);
        if !restartable || self.local_offer_pending {
            return Err(NegotiationError::InvalidState { operation: "restart", state: self.state });
        }
        self.restarts += 1;
        info!("Session {}: restarting negotiation (#{})", self.remote_id.short(), self.restarts);
        self.send_offer(true).await
    }

    fn discard(&mut self) {
        self.pending_candidates.clear();
        self.local_offer_pending = false;
        self.remote_description_set = false;
        self.media_connected = false;
    }

    async fn release_media(&self) {
        if let Err(e) = self.media.close().await {
            warn!("Session {}: media close failed: {}", self.remote_id.short(), e);
        }
    }

    /// Tear down after the connection closed. Never fails.
    pub async fn close(&mut self) {
        if self.state.is_terminal() {
            return;
        }
        self.set_state(SessionState::Closed);
        self.discard();
        self.release_media().await;
    }

    /// Tear down after an unrecoverable error. Never fails.
    pub async fn fail(&mut self, reason: &NegotiationError) {
        if self.state.is_terminal() {
            return;
        }
        warn!("Session {} failed: {}", self.remote_id.short(), reason);
        self.set_state(SessionState::Failed);
        self.discard();
        self.release_media().await;
    }
}
