//! Negotiation-only media sessions.
//!
//! Used when audio rides the signaling connection itself: the offer/answer
//! exchange still runs so both ends agree the path is up, but no transport
//! is opened. The session reports `Connected` once both descriptions are in
//! place and trickles a single synthetic host candidate.

use super::signaling::IceCandidate;
use super::{MediaError, MediaEvent, MediaEvents, MediaFactory, MediaSession, MediaState};
use crate::transport::PeerId;
use async_trait::async_trait;
use bytes::Bytes;
use log::debug;
use parking_lot::Mutex;
use std::sync::Arc;

#[derive(Debug, Default)]
struct RelayState {
    local_set: bool,
    remote_set: bool,
    connected: bool,
    closed: bool,
    generation: u32,
    remote_candidates: Vec<IceCandidate>,
}

pub struct RelayMedia {
    session_id: u64,
    events: MediaEvents,
    state: Mutex<RelayState>,
}

impl RelayMedia {
    pub fn new(events: MediaEvents) -> Self {
        Self {
            session_id: rand::random::<u32>() as u64,
            events,
            state: Mutex::new(RelayState::default()),
        }
    }

    fn describe(&self, generation: u32, kind: &str) -> String {
        format!(
            "v=0\r\no=- {} {} IN IP4 0.0.0.0\r\ns=walkie-relay\r\nt=0 0\r\na=ice-ufrag:r{}\r\na=setup:{}\r\n",
            self.session_id, generation, generation, kind
        )
    }

    fn validate(sdp: &str) -> Result<(), MediaError> {
        if sdp.starts_with("v=0") {
            Ok(())
        } else {
            Err(MediaError::Sdp("session description must start with v=0".to_string()))
        }
    }

    fn gather(&self, generation: u32) {
        self.events.emit(MediaEvent::LocalCandidate(IceCandidate {
            candidate: format!("candidate:relay{} 1 tcp 2105524479 0.0.0.0 9 typ host tcptype passive", generation),
            sdp_mid: Some("0".to_string()),
            sdp_mline_index: Some(0),
        }));
    }

    /// Emit the connected transition once both descriptions are set.
    fn maybe_connect(&self, state: &mut RelayState) {
        if state.local_set && state.remote_set && !state.connected {
            state.connected = true;
            self.events.emit(MediaEvent::StateChanged(MediaState::Connecting));
            self.events.emit(MediaEvent::StateChanged(MediaState::Connected));
        }
    }

    /// Remote candidates applied so far
    pub fn remote_candidates(&self) -> Vec<IceCandidate> {
        self.state.lock().remote_candidates.clone()
    }
}

#[async_trait]
impl MediaSession for RelayMedia {
    async fn create_offer(&self, ice_restart: bool) -> Result<String, MediaError> {
        let generation = {
            let mut state = self.state.lock();
            if state.closed {
                return Err(MediaError::Closed);
            }
            if ice_restart {
                state.generation += 1;
                state.remote_set = false;
                if state.connected {
                    state.connected = false;
                    self.events.emit(MediaEvent::StateChanged(MediaState::Connecting));
                }
            }
            state.local_set = true;
            state.generation
        };
        self.gather(generation);
        Ok(self.describe(generation, "actpass"))
    }

    async fn accept_offer(&self, sdp: &str) -> Result<String, MediaError> {
        Self::validate(sdp)?;
        let generation = {
            let mut state = self.state.lock();
            if state.closed {
                return Err(MediaError::Closed);
            }
            if state.connected {
                // remote restart
                state.connected = false;
                state.generation += 1;
            }
            state.remote_set = true;
            state.local_set = true;
            self.maybe_connect(&mut state);
            state.generation
        };
        self.gather(generation);
        Ok(self.describe(generation, "active"))
    }

    async fn accept_answer(&self, sdp: &str) -> Result<(), MediaError> {
        Self::validate(sdp)?;
        let mut state = self.state.lock();
        if state.closed {
            return Err(MediaError::Closed);
        }
        if !state.local_set {
            return Err(MediaError::Sdp("answer without a local offer".to_string()));
        }
        state.remote_set = true;
        self.maybe_connect(&mut state);
        Ok(())
    }

    async fn rollback(&self) -> Result<(), MediaError> {
        let mut state = self.state.lock();
        state.local_set = false;
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: &IceCandidate) -> Result<(), MediaError> {
        let mut state = self.state.lock();
        if !state.remote_set && !state.connected {
            return Err(MediaError::Ice("remote description not set".to_string()));
        }
        state.remote_candidates.push(candidate.clone());
        Ok(())
    }

    async fn send_frame(&self, _payload: Bytes) -> Result<(), MediaError> {
        Err(MediaError::Unsupported)
    }

    async fn close(&self) -> Result<(), MediaError> {
        let mut state = self.state.lock();
        if !state.closed {
            state.closed = true;
            state.connected = false;
            self.events.emit(MediaEvent::StateChanged(MediaState::Closed));
        }
        Ok(())
    }
}

/// Factory for negotiation-only sessions
#[derive(Debug, Clone, Default)]
pub struct RelayMediaFactory;

impl RelayMediaFactory {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl MediaFactory for RelayMediaFactory {
    async fn create(&self, peer: &PeerId, events: MediaEvents) -> Result<Arc<dyn MediaSession>, MediaError> {
        debug!("Creating relay media session for {}", peer.short());
        Ok(Arc::new(RelayMedia::new(events)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::webrtc::TaggedMediaEvent;
    use tokio::sync::mpsc;

    fn relay() -> (RelayMedia, mpsc::UnboundedReceiver<TaggedMediaEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (RelayMedia::new(MediaEvents::new(PeerId::new("ab"), 1, tx)), rx)
    }

    fn states(rx: &mut mpsc::UnboundedReceiver<TaggedMediaEvent>) -> Vec<MediaState> {
        let mut out = Vec::new();
        while let Ok(ev) = rx.try_recv() {
            if let MediaEvent::StateChanged(state) = ev.event {
                out.push(state);
            }
        }
        out
    }

    #[tokio::test]
    async fn offer_answer_connects_both_sides() {
        let (offerer, mut offer_rx) = relay();
        let (answerer, mut answer_rx) = relay();

        let offer = offerer.create_offer(false).await.unwrap();
        let answer = answerer.accept_offer(&offer).await.unwrap();
        assert_eq!(states(&mut answer_rx), vec![MediaState::Connecting, MediaState::Connected]);

        offerer.accept_answer(&answer).await.unwrap();
        assert_eq!(states(&mut offer_rx), vec![MediaState::Connecting, MediaState::Connected]);
    }

    #[tokio::test]
    async fn candidates_need_remote_description() {
        let (media, _rx) = relay();
        let c = IceCandidate { candidate: "c".into(), sdp_mid: None, sdp_mline_index: None };
        assert!(media.add_ice_candidate(&c).await.is_err());
        media.accept_offer("v=0\r\n").await.unwrap();
        media.add_ice_candidate(&c).await.unwrap();
        assert_eq!(media.remote_candidates(), vec![c]);
    }

    #[tokio::test]
    async fn rejects_malformed_description() {
        let (media, _rx) = relay();
        assert!(matches!(media.accept_offer("garbage").await, Err(MediaError::Sdp(_))));
        assert!(media.accept_answer("v=0").await.is_err());
    }

    #[tokio::test]
    async fn restart_reconnects() {
        let (media, mut rx) = relay();
        media.create_offer(false).await.unwrap();
        media.accept_answer("v=0").await.unwrap();
        states(&mut rx);

        let offer = media.create_offer(true).await.unwrap();
        assert!(offer.contains("ice-ufrag:r1"));
        assert_eq!(states(&mut rx), vec![MediaState::Connecting]);
        media.accept_answer("v=0").await.unwrap();
        assert_eq!(states(&mut rx), vec![MediaState::Connecting, MediaState::Connected]);
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let (media, mut rx) = relay();
        media.close().await.unwrap();
        media.close().await.unwrap();
        assert_eq!(states(&mut rx), vec![MediaState::Closed]);
        assert!(matches!(media.create_offer(false).await, Err(MediaError::Closed)));
    }
}
