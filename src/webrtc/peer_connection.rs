//! WebRTC media sessions
//!
//! Direct peer-to-peer audio path over webrtc-rs. Each participant gets one
//! RTCPeerConnection carrying a pre-negotiated, unordered, unreliable data
//! channel; encoded PCM frames travel as binary messages on it.

use super::signaling::IceCandidate;
use super::{MediaError, MediaEvent, MediaEvents, MediaFactory, MediaSession, MediaState};
use crate::config::WebRTCConfig;
use crate::transport::PeerId;
use async_trait::async_trait;
use bytes::Bytes;
use log::{debug, warn};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::offer_answer_options::RTCOfferOptions;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;

/// Stream id shared by both ends of the pre-negotiated channel
const AUDIO_CHANNEL_ID: u16 = 0;

fn media_state(state: RTCPeerConnectionState) -> MediaState {
    match state {
        RTCPeerConnectionState::Unspecified | RTCPeerConnectionState::New => MediaState::New,
        RTCPeerConnectionState::Connecting => MediaState::Connecting,
        RTCPeerConnectionState::Connected => MediaState::Connected,
        RTCPeerConnectionState::Disconnected => MediaState::Disconnected,
        RTCPeerConnectionState::Failed => MediaState::Failed,
        RTCPeerConnectionState::Closed => MediaState::Closed,
    }
}

/// Creates webrtc-rs backed media sessions
#[derive(Debug, Clone)]
pub struct WebRtcMediaFactory {
    config: WebRTCConfig,
}

impl WebRtcMediaFactory {
    pub fn new(config: WebRTCConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl MediaFactory for WebRtcMediaFactory {
    async fn create(&self, peer: &PeerId, events: MediaEvents) -> Result<Arc<dyn MediaSession>, MediaError> {
        debug!("Creating WebRTC media session for {}", peer.short());
        let media = WebRtcMedia::new(self.config.clone(), events).await?;
        Ok(Arc::new(media))
    }
}

struct Connection {
    pc: Arc<RTCPeerConnection>,
    channel: Arc<RTCDataChannel>,
}

/// One RTCPeerConnection plus its audio data channel.
///
/// webrtc-rs cannot apply a rollback description, so rolling back a local
/// offer replaces the peer connection with a fresh one. Callbacks from a
/// replaced connection are muted by generation.
pub struct WebRtcMedia {
    config: WebRTCConfig,
    events: MediaEvents,
    generation: Arc<AtomicU64>,
    conn: Mutex<Connection>,
}

impl WebRtcMedia {
    pub async fn new(config: WebRTCConfig, events: MediaEvents) -> Result<Self, MediaError> {
        let generation = Arc::new(AtomicU64::new(0));
        let conn = connect(&config, &events, &generation, 0).await?;
        Ok(Self { config, events, generation, conn: Mutex::new(conn) })
    }
}

async fn connect(
    config: &WebRTCConfig,
    events: &MediaEvents,
    current: &Arc<AtomicU64>,
    generation: u64,
) -> Result<Connection, MediaError> {
    let mut media_engine = MediaEngine::default();
    media_engine
        .register_default_codecs()
        .map_err(|e| MediaError::ConnectionFailed(format!("Failed to register codecs: {}", e)))?;

    let mut registry = Registry::new();
    registry = register_default_interceptors(registry, &mut media_engine)
        .map_err(|e| MediaError::ConnectionFailed(format!("Failed to register interceptors: {}", e)))?;

    let api = APIBuilder::new()
        .with_media_engine(media_engine)
        .with_interceptor_registry(registry)
        .build();

    let ice_servers = config
        .ice_servers
        .iter()
        .map(|server| RTCIceServer {
            urls: server.urls.clone(),
            username: server.username.clone().unwrap_or_default(),
            credential: server.credential.clone().unwrap_or_default(),
            ..Default::default()
        })
        .collect();

    let rtc_config = RTCConfiguration { ice_servers, ..Default::default() };

    let pc = Arc::new(
        api.new_peer_connection(rtc_config)
            .await
            .map_err(|e| MediaError::ConnectionFailed(format!("Failed to create peer connection: {}", e)))?,
    );

    let channel = pc
        .create_data_channel(
            &config.data_channel_label,
            Some(RTCDataChannelInit {
                ordered: Some(false),
                max_retransmits: Some(0),
                negotiated: Some(AUDIO_CHANNEL_ID),
                ..Default::default()
            }),
        )
        .await
        .map_err(|e| MediaError::DataChannel(format!("Failed to create data channel: {}", e)))?;

    let state_events = events.clone();
    let state_current = current.clone();
    pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
        if state_current.load(Ordering::SeqCst) == generation {
            state_events.emit(MediaEvent::StateChanged(media_state(state)));
        }
        Box::pin(async {})
    }));

    let ice_events = events.clone();
    let ice_current = current.clone();
    pc.on_ice_candidate(Box::new(move |candidate| {
        let ice_events = ice_events.clone();
        let ice_current = ice_current.clone();
        Box::pin(async move {
            // None marks the end of gathering
            let Some(candidate) = candidate else { return };
            if ice_current.load(Ordering::SeqCst) != generation {
                return;
            }
            match candidate.to_json() {
                Ok(init) => {
                    ice_events.emit(MediaEvent::LocalCandidate(IceCandidate {
                        candidate: init.candidate,
                        sdp_mid: init.sdp_mid,
                        sdp_mline_index: init.sdp_mline_index,
                    }));
                }
                Err(e) => warn!("Failed to serialize local candidate: {}", e),
            }
        })
    }));

    let frame_events = events.clone();
    let frame_current = current.clone();
    channel.on_message(Box::new(move |msg: DataChannelMessage| {
        if frame_current.load(Ordering::SeqCst) == generation && !msg.is_string {
            frame_events.emit(MediaEvent::Frame(msg.data));
        }
        Box::pin(async {})
    }));

    Ok(Connection { pc, channel })
}

#[async_trait]
impl MediaSession for WebRtcMedia {
    async fn create_offer(&self, ice_restart: bool) -> Result<String, MediaError> {
        let conn = self.conn.lock().await;
        let options = RTCOfferOptions { ice_restart, voice_activity_detection: false };
        let offer = conn
            .pc
            .create_offer(Some(options))
            .await
            .map_err(|e| MediaError::Sdp(format!("Failed to create offer: {}", e)))?;
        conn.pc
            .set_local_description(offer.clone())
            .await
            .map_err(|e| MediaError::Sdp(format!("Failed to set local description: {}", e)))?;
        Ok(offer.sdp)
    }

    async fn accept_offer(&self, sdp: &str) -> Result<String, MediaError> {
        let conn = self.conn.lock().await;
        let offer = RTCSessionDescription::offer(sdp.to_string())
            .map_err(|e| MediaError::Sdp(format!("Invalid SDP offer: {}", e)))?;
        conn.pc
            .set_remote_description(offer)
            .await
            .map_err(|e| MediaError::Sdp(format!("Failed to set remote description: {}", e)))?;

        let answer = conn
            .pc
            .create_answer(None)
            .await
            .map_err(|e| MediaError::Sdp(format!("Failed to create answer: {}", e)))?;
        conn.pc
            .set_local_description(answer.clone())
            .await
            .map_err(|e| MediaError::Sdp(format!("Failed to set local description: {}", e)))?;
        Ok(answer.sdp)
    }

    async fn accept_answer(&self, sdp: &str) -> Result<(), MediaError> {
        let conn = self.conn.lock().await;
        let answer = RTCSessionDescription::answer(sdp.to_string())
            .map_err(|e| MediaError::Sdp(format!("Invalid SDP answer: {}", e)))?;
        conn.pc
            .set_remote_description(answer)
            .await
            .map_err(|e| MediaError::Sdp(format!("Failed to set remote description: {}", e)))
    }

    async fn rollback(&self) -> Result<(), MediaError> {
        let mut conn = self.conn.lock().await;
        let next = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let fresh = connect(&self.config, &self.events, &self.generation, next).await?;
        let stale = std::mem::replace(&mut *conn, fresh);
        if let Err(e) = stale.pc.close().await {
            debug!("Closing rolled back peer connection for {}: {}", self.events.peer().short(), e);
        }
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: &IceCandidate) -> Result<(), MediaError> {
        let conn = self.conn.lock().await;
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate.clone(),
            sdp_mid: candidate.sdp_mid.clone(),
            sdp_mline_index: candidate.sdp_mline_index,
            username_fragment: None,
        };
        conn.pc
            .add_ice_candidate(init)
            .await
            .map_err(|e| MediaError::Ice(format!("Failed to add ICE candidate: {}", e)))
    }

    async fn send_frame(&self, payload: Bytes) -> Result<(), MediaError> {
        let channel = self.conn.lock().await.channel.clone();
        channel
            .send(&payload)
            .await
            .map(|_| ())
            .map_err(|e| MediaError::DataChannel(format!("Failed to send frame: {}", e)))
    }

    async fn close(&self) -> Result<(), MediaError> {
        let conn = self.conn.lock().await;
        conn.pc
            .close()
            .await
            .map_err(|e| MediaError::ConnectionFailed(format!("Failed to close connection: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_mapping() {
        assert_eq!(media_state(RTCPeerConnectionState::New), MediaState::New);
        assert_eq!(media_state(RTCPeerConnectionState::Connected), MediaState::Connected);
        assert_eq!(media_state(RTCPeerConnectionState::Disconnected), MediaState::Disconnected);
        assert_eq!(media_state(RTCPeerConnectionState::Failed), MediaState::Failed);
    }

    #[tokio::test]
    async fn test_offer_contains_data_channel() {
        let (tx, _rx) = tokio::sync::mpsc::unbounded_channel();
        let config = WebRTCConfig { ice_servers: Vec::new(), ..WebRTCConfig::default() };
        let media = WebRtcMedia::new(config, MediaEvents::new(PeerId::new("ab"), 0, tx)).await.unwrap();
        let offer = media.create_offer(false).await.unwrap();
        assert!(offer.contains("m=application"));
        media.rollback().await.unwrap();
        media.close().await.unwrap();
    }
}
