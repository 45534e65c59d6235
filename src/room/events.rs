//! Room state-change notifications for UI adapters.

use crate::transport::{PeerId, Topic};
use crate::webrtc::SessionState;
use log::debug;
use tokio::sync::broadcast;

const EVENT_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq)]
pub enum RoomEvent {
    RoomCreated { topic: Topic },
    RoomJoined { topic: Topic },
    RoomLeft { topic: Topic },
    ParticipantJoined { peer: PeerId, name: String },
    ParticipantLeft { peer: PeerId },
    ParticipantRenamed { peer: PeerId, name: String },
    SessionStateChanged { peer: PeerId, state: SessionState },
    NegotiationFailed { peer: PeerId, reason: String },
    /// The direct media path dropped; negotiation may be restarted
    MediaPathDegraded { peer: PeerId },
    /// Remote speaking flag rose or decayed
    TransmissionStateChanged { peer: PeerId, speaking: bool },
    LocalTransmissionChanged { transmitting: bool },
}

impl RoomEvent {
    /// Participant the event concerns, if any
    pub fn peer(&self) -> Option<&PeerId> {
        match self {
            RoomEvent::ParticipantJoined { peer, .. }
            | RoomEvent::ParticipantLeft { peer }
            | RoomEvent::ParticipantRenamed { peer, .. }
            | RoomEvent::SessionStateChanged { peer, .. }
            | RoomEvent::NegotiationFailed { peer, .. }
            | RoomEvent::MediaPathDegraded { peer }
            | RoomEvent::TransmissionStateChanged { peer, .. } => Some(peer),
            RoomEvent::RoomCreated { .. }
            | RoomEvent::RoomJoined { .. }
            | RoomEvent::RoomLeft { .. }
            | RoomEvent::LocalTransmissionChanged { .. } => None,
        }
    }
}

/// Fan-out of room events to any number of subscribers.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<RoomEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(EVENT_CAPACITY);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RoomEvent> {
        self.sender.subscribe()
    }

    /// Publishing with no subscribers is not an error.
    pub fn emit(&self, event: RoomEvent) {
        debug!("Room event: {:?}", event);
        let _ = self.sender.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
