//! walkie-core - peer-to-peer push-to-talk core
//!
//! Rooms are shared 256-bit topics. Peers meet through a rendezvous channel,
//! negotiate a media path with a small JSON signaling protocol and exchange
//! short bursts of linear PCM audio.

pub mod audio;
pub mod config;
pub mod room;
pub mod transport;
pub mod webrtc;

// Re-exports
pub use audio::{AudioSink, CodecError, DeviceError, FrameCodec};
pub use config::{Config, ConfigError};
pub use room::{RoomController, RoomError, RoomEvent};
pub use transport::{PeerId, Rendezvous, RendezvousError, Topic, TopicError};
pub use webrtc::{MediaError, NegotiationError, SessionState, SignalingMessage};

/// Any error the core can surface
#[derive(Debug, thiserror::Error)]
pub enum WalkieError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Room(#[from] RoomError),
    #[error(transparent)]
    Device(#[from] DeviceError),
    #[error(transparent)]
    Codec(#[from] CodecError),
}

impl From<RendezvousError> for WalkieError {
    fn from(e: RendezvousError) -> Self {
        WalkieError::Room(RoomError::Rendezvous(e))
    }
}

impl From<TopicError> for WalkieError {
    fn from(e: TopicError) -> Self {
        WalkieError::Room(RoomError::InvalidTopic(e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errors_convert_into_walkie_error() {
        let err: WalkieError = "zz".parse::<transport::Topic>().unwrap_err().into();
        assert!(matches!(err, WalkieError::Room(RoomError::InvalidTopic(TopicError::Length { .. }))));

        let err: WalkieError = ConfigError::Invalid("room.max_peers must be non-zero").into();
        assert!(matches!(err, WalkieError::Config(_)));
    }
}
