//! Peer negotiation and media sessions
//!
//! This module provides:
//! - the JSON signaling protocol spoken over rendezvous connections
//! - the per-peer signaling state machine
//! - the media session seam and its implementations

pub mod relay;
pub mod session;
pub mod signaling;

#[cfg(feature = "webrtc-media")]
pub mod peer_connection;

pub use relay::RelayMediaFactory;
pub use session::{Role, SessionState, SignalingSession};
pub use signaling::{IceCandidate, SignalingMessage};

#[cfg(feature = "webrtc-media")]
pub use peer_connection::WebRtcMediaFactory;

use crate::transport::PeerId;
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Media collaborator errors
#[derive(Debug, thiserror::Error)]
pub enum MediaError {
    #[error("connection failed: {0}")]
    ConnectionFailed(String),
    #[error("SDP error: {0}")]
    Sdp(String),
    #[error("ICE error: {0}")]
    Ice(String),
    #[error("data channel error: {0}")]
    DataChannel(String),
    #[error("media session closed")]
    Closed,
    #[error("operation not supported by this media session")]
    Unsupported,
}

/// Negotiation failures that move a single session to `Failed`
#[derive(Debug, thiserror::Error)]
pub enum NegotiationError {
    #[error("malformed signaling message: {0}")]
    Malformed(String),
    #[error("unexpected {message} in state {state:?}")]
    OutOfSequence { message: &'static str, state: SessionState },
    #[error("cannot {operation} in state {state:?}")]
    InvalidState { operation: &'static str, state: SessionState },
    #[error("media error: {0}")]
    Media(#[from] MediaError),
    #[error("media path failed")]
    MediaFailed,
    #[error("signaling connection closed")]
    ConnectionClosed,
}

/// Connection state reported by a media session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

/// Asynchronous notifications from a media session
#[derive(Debug, Clone)]
pub enum MediaEvent {
    StateChanged(MediaState),
    /// Locally gathered network-path candidate to forward to the peer
    LocalCandidate(IceCandidate),
    /// Encoded audio frame received over the media path
    Frame(Bytes),
}

/// Media events tagged with their originating session
#[derive(Debug)]
pub struct TaggedMediaEvent {
    pub peer: PeerId,
    pub epoch: u64,
    pub event: MediaEvent,
}

/// Handle a media session uses to report events.
#[derive(Debug, Clone)]
pub struct MediaEvents {
    peer: PeerId,
    epoch: u64,
    tx: mpsc::UnboundedSender<TaggedMediaEvent>,
}

impl MediaEvents {
    pub fn new(peer: PeerId, epoch: u64, tx: mpsc::UnboundedSender<TaggedMediaEvent>) -> Self {
        Self { peer, epoch, tx }
    }

    pub fn peer(&self) -> &PeerId {
        &self.peer
    }

    /// Returns false once the receiving side is gone.
    pub fn emit(&self, event: MediaEvent) -> bool {
        self.tx
            .send(TaggedMediaEvent { peer: self.peer.clone(), epoch: self.epoch, event })
            .is_ok()
    }
}

/// The negotiated peer-to-peer audio path.
///
/// Description-setting operations are combined the way a negotiation uses
/// them: `create_offer` also installs the offer locally, `accept_offer`
/// installs the remote offer and the local answer.
#[async_trait]
pub trait MediaSession: Send + Sync {
    async fn create_offer(&self, ice_restart: bool) -> Result<String, MediaError>;

    async fn accept_offer(&self, sdp: &str) -> Result<String, MediaError>;

    async fn accept_answer(&self, sdp: &str) -> Result<(), MediaError>;

    /// Discard a pending local offer
    async fn rollback(&self) -> Result<(), MediaError>;

    async fn add_ice_candidate(&self, candidate: &IceCandidate) -> Result<(), MediaError>;

    async fn send_frame(&self, payload: Bytes) -> Result<(), MediaError>;

    async fn close(&self) -> Result<(), MediaError>;
}

/// Creates one media session per participant.
#[async_trait]
pub trait MediaFactory: Send + Sync {
    async fn create(&self, peer: &PeerId, events: MediaEvents) -> Result<Arc<dyn MediaSession>, MediaError>;
}
