//! Room Controller
//!
//! Owns the single active room: its rendezvous membership, the participant
//! registry with one signaling session per peer, push-to-talk gating and the
//! speaking flags of remote peers. Background tasks only forward inputs over
//! channels; every state change happens in `dispatch`, one input at a time.

pub mod events;
pub mod participant;

pub use events::{EventBus, RoomEvent};
pub use participant::{default_display_name, Participant, ParticipantInfo};

use crate::audio::{is_silent, AudioSink, FrameAssembler, FrameCodec};
use crate::config::{AudioRoute, Config};
use crate::transport::framing::{read_frame, write_frame, FrameDecoder};
use crate::transport::{
    ConnectionCallback, JoinMode, Membership, PeerConnection, PeerId, Rendezvous, RendezvousError, Topic, TopicError,
};
use crate::webrtc::session::SignalSender;
use crate::webrtc::signaling::epoch_millis;
use crate::webrtc::{
    MediaEvent, MediaEvents, MediaFactory, MediaState, NegotiationError, Role, SessionState, SignalingMessage,
    SignalingSession, TaggedMediaEvent,
};
use bytes::Bytes;
use log::{debug, info, trace, warn};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::AsyncWriteExt;
use tokio::sync::{broadcast, mpsc};

#[derive(Debug, thiserror::Error)]
pub enum RoomError {
    #[error("rendezvous failed: {0}")]
    Rendezvous(#[from] RendezvousError),
    #[error("invalid topic: {0}")]
    InvalidTopic(#[from] TopicError),
    #[error("no participant {0}")]
    UnknownParticipant(String),
    #[error("negotiation error: {0}")]
    Negotiation(#[from] NegotiationError),
}

/// Work items delivered to the controller's event loop
pub enum RoomInput {
    /// Rendezvous reported a peer connection for the room with this epoch
    Connected { room: u64, connection: PeerConnection },
    /// One framed message from a participant's connection
    Signal { peer: PeerId, epoch: u64, payload: Bytes },
    /// A participant's connection ended
    Closed { peer: PeerId, epoch: u64, reason: Option<String> },
    Media(TaggedMediaEvent),
}

impl std::fmt::Debug for RoomInput {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RoomInput::Connected { room, connection } => {
                write!(f, "Connected(room {}, {})", room, connection.remote_id.short())
            }
            RoomInput::Signal { peer, epoch, payload } => {
                write!(f, "Signal({}#{}, {} bytes)", peer.short(), epoch, payload.len())
            }
            RoomInput::Closed { peer, epoch, reason } => write!(f, "Closed({}#{}, {:?})", peer.short(), epoch, reason),
            RoomInput::Media(ev) => write!(f, "Media({}#{}, {:?})", ev.peer.short(), ev.epoch, ev.event),
        }
    }
}

struct Room {
    topic: Topic,
    epoch: u64,
    membership: Membership,
}

pub struct RoomController {
    config: Config,
    local_id: PeerId,
    display_name: String,
    rendezvous: Arc<dyn Rendezvous>,
    media_factory: Arc<dyn MediaFactory>,
    sink: Box<dyn AudioSink>,
    codec: FrameCodec,
    assembler: FrameAssembler,
    room: Option<Room>,
    participants: HashMap<PeerId, Participant>,
    transmitting: bool,
    last_sent_at: Option<Instant>,
    next_epoch: u64,
    events: EventBus,
    inputs_tx: mpsc::UnboundedSender<RoomInput>,
    inputs_rx: mpsc::UnboundedReceiver<RoomInput>,
    media_tx: mpsc::UnboundedSender<TaggedMediaEvent>,
    media_rx: mpsc::UnboundedReceiver<TaggedMediaEvent>,
}

impl RoomController {
    pub fn new(
        config: Config,
        rendezvous: Arc<dyn Rendezvous>,
        media_factory: Arc<dyn MediaFactory>,
        sink: Box<dyn AudioSink>,
    ) -> Self {
        let local_id = rendezvous.local_id().clone();
        let display_name = match config.room.display_name.trim() {
            "" => default_display_name(&local_id),
            name => name.to_string(),
        };
        let (inputs_tx, inputs_rx) = mpsc::unbounded_channel();
        let (media_tx, media_rx) = mpsc::unbounded_channel();
        Self {
            codec: FrameCodec::from_config(&config.audio),
            assembler: FrameAssembler::new(config.audio.frame_size),
            config,
            local_id,
            display_name,
            rendezvous,
            media_factory,
            sink,
            room: None,
            participants: HashMap::new(),
            transmitting: false,
            last_sent_at: None,
            next_epoch: 0,
            events: EventBus::new(),
            inputs_tx,
            inputs_rx,
            media_tx,
            media_rx,
        }
    }

    pub fn local_id(&self) -> &PeerId {
        &self.local_id
    }

    pub fn display_name(&self) -> &str {
        &self.display_name
    }

    pub fn topic(&self) -> Option<Topic> {
        self.room.as_ref().map(|r| r.topic)
    }

    pub fn is_transmitting(&self) -> bool {
        self.transmitting
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RoomEvent> {
        self.events.subscribe()
    }

    /// Snapshot of the registry, ordered by peer id
    pub fn participants(&self) -> Vec<ParticipantInfo> {
        let mut list: Vec<ParticipantInfo> = self.participants.values().map(|p| p.info()).collect();
        list.sort_by(|a, b| a.id.cmp(&b.id));
        list
    }

    pub fn participant_state(&self, peer: &PeerId) -> Option<SessionState> {
        self.participants.get(peer).map(|p| p.state())
    }

    /// Resolve a unique participant from an id prefix.
    pub fn find_participant(&self, prefix: &str) -> Option<PeerId> {
        let prefix = prefix.trim().to_ascii_lowercase();
        if prefix.is_empty() {
            return None;
        }
        let mut matches = self.participants.keys().filter(|id| id.as_str().starts_with(&prefix));
        match (matches.next(), matches.next()) {
            (Some(id), None) => Some(id.clone()),
            _ => None,
        }
    }

    fn decay_window(&self) -> Duration {
        Duration::from_millis(self.config.room.speaking_decay_ms)
    }

    pub fn is_speaking(&self, peer: &PeerId, now: Instant) -> bool {
        let decay = self.decay_window();
        self.participants.get(peer).map(|p| p.is_speaking(now, decay)).unwrap_or(false)
    }

    fn allocate_epoch(&mut self) -> u64 {
        self.next_epoch += 1;
        self.next_epoch
    }

    // Room lifecycle

    /// Start a new room under a fresh topic, accepting and initiating
    /// connections.
    pub async fn create_room(&mut self) -> Result<Topic, RoomError> {
        self.leave_room().await;
        let topic = Topic::random();
        self.enter(topic, JoinMode::ClientAndServer).await?;
        info!("Created room {}", topic);
        self.events.emit(RoomEvent::RoomCreated { topic });
        Ok(topic)
    }

    /// Join an existing room. A malformed topic leaves the current room
    /// untouched.
    pub async fn join_room(&mut self, topic: &str) -> Result<(), RoomError> {
        let topic: Topic = topic.parse()?;
        self.leave_room().await;
        self.enter(topic, JoinMode::Client).await?;
        info!("Joined room {}", topic);
        self.events.emit(RoomEvent::RoomJoined { topic });
        Ok(())
    }

    async fn enter(&mut self, topic: Topic, mode: JoinMode) -> Result<(), RoomError> {
        let epoch = self.allocate_epoch();
        let tx = self.inputs_tx.clone();
        let on_connection: ConnectionCallback = Arc::new(move |connection| {
            let _ = tx.send(RoomInput::Connected { room: epoch, connection });
        });
        let membership = self.rendezvous.join(&topic, mode, on_connection).await?;
        self.room = Some(Room { topic, epoch, membership });
        Ok(())
    }

    /// Close every session, leave the rendezvous and clear the registry.
    /// Safe to call at any time, any number of times.
    pub async fn leave_room(&mut self) {
        let peers: Vec<PeerId> = self.participants.keys().cloned().collect();
        for peer in peers {
            if let Some(p) = self.participants.get_mut(&peer) {
                p.session.close().await;
            }
            self.settle(&peer, Ok(())).await.ok();
        }

        // Inputs still queued belong to the room being torn down
        while self.inputs_rx.try_recv().is_ok() {}
        while self.media_rx.try_recv().is_ok() {}

        self.set_transmitting(false);

        if let Some(mut room) = self.room.take() {
            room.membership.leave();
            info!("Left room {}", room.topic);
            self.events.emit(RoomEvent::RoomLeft { topic: room.topic });
        }
    }

    // Push-to-talk

    pub fn start_transmitting(&mut self) {
        self.set_transmitting(true);
    }

    pub fn stop_transmitting(&mut self) {
        self.set_transmitting(false);
    }

    fn set_transmitting(&mut self, on: bool) {
        if self.transmitting == on {
            return;
        }
        self.transmitting = on;
        if !on {
            self.assembler.reset();
            self.last_sent_at = None;
        }
        debug!("Local transmission {}", if on { "started" } else { "stopped" });
        self.events.emit(RoomEvent::LocalTransmissionChanged { transmitting: on });
    }

    /// Feed captured samples. While transmitting, complete non-silent frames
    /// are broadcast subject to the send throttle. Returns the number of
    /// frame deliveries made.
    pub async fn on_captured_audio(&mut self, samples: &[f32]) -> usize {
        if !self.transmitting || samples.is_empty() {
            return 0;
        }
        let threshold = self.config.audio.silence_threshold;
        let min_interval = Duration::from_millis(self.config.audio.min_send_interval_ms);
        let mut delivered = 0;
        for frame in self.assembler.push(samples) {
            if is_silent(&frame, threshold) {
                trace!("Skipping silent frame");
                continue;
            }
            let now = Instant::now();
            if let Some(last) = self.last_sent_at {
                if now.saturating_duration_since(last) < min_interval {
                    trace!("Send throttled");
                    continue;
                }
            }
            self.last_sent_at = Some(now);
            delivered += self.broadcast(&frame).await;
        }
        delivered
    }

    /// Encode one frame and send it to every established participant.
    /// Per-peer failures are logged. Returns the number of peers reached.
    pub async fn broadcast(&mut self, samples: &[f32]) -> usize {
        if samples.is_empty() {
            return 0;
        }
        let mut reached = 0;
        match self.config.room.audio_route {
            AudioRoute::Signaling => {
                let message = SignalingMessage::audio(self.codec.encode_pcm(samples), &self.display_name, epoch_millis());
                for p in self.participants.values().filter(|p| p.session.is_established()) {
                    match p.session.outbound().send(&message) {
                        Ok(()) => reached += 1,
                        Err(e) => warn!("Failed to send audio to {}: {}", p.id().short(), e),
                    }
                }
            }
            AudioRoute::Media => {
                let payload = self.codec.encode(samples);
                for p in self.participants.values().filter(|p| p.session.is_established()) {
                    match p.session.media().send_frame(payload.clone()).await {
                        Ok(()) => reached += 1,
                        Err(e) => warn!("Failed to send audio to {}: {}", p.id().short(), e),
                    }
                }
            }
        }
        trace!("Broadcast {} samples to {} peers", samples.len(), reached);
        reached
    }

    /// Handle an encoded frame received from a participant. Invalid and
    /// silent frames are dropped.
    pub fn on_participant_audio(&mut self, peer: &PeerId, payload: &[u8]) {
        match self.codec.decode(payload) {
            Ok(samples) => self.accept_audio(peer, &samples, Instant::now()),
            Err(e) => debug!("Dropping frame from {}: {}", peer.short(), e),
        }
    }

    fn accept_audio(&mut self, peer: &PeerId, samples: &[f32], now: Instant) {
        let frame_size = self.config.audio.frame_size;
        if samples.len() != frame_size {
            debug!("Dropping frame from {}: {} samples, expected {}", peer.short(), samples.len(), frame_size);
            return;
        }
        if is_silent(samples, self.config.audio.silence_threshold) {
            trace!("Dropping silent frame from {}", peer.short());
            return;
        }
        let Some(p) = self.participants.get_mut(peer) else {
            debug!("Dropping frame from unknown peer {}", peer.short());
            return;
        };
        if p.mark_audio(now) {
            self.events.emit(RoomEvent::TransmissionStateChanged { peer: peer.clone(), speaking: true });
        }
        self.sink.play(peer, samples);
    }

    /// Clear speaking flags whose decay window has elapsed.
    pub fn tick(&mut self, now: Instant) {
        let decay = self.decay_window();
        let expired: Vec<PeerId> = self
            .participants
            .values_mut()
            .filter_map(|p| p.expire(now, decay).then(|| p.id().clone()))
            .collect();
        for peer in expired {
            self.events.emit(RoomEvent::TransmissionStateChanged { peer, speaking: false });
        }
    }

    /// Change the local display name and announce it to every peer.
    pub fn set_display_name(&mut self, name: &str) {
        let name = name.trim();
        self.display_name = if name.is_empty() { default_display_name(&self.local_id) } else { name.to_string() };
        info!("Display name set to {}", self.display_name);
        let message = SignalingMessage::user_info(&self.display_name, epoch_millis());
        for p in self.participants.values().filter(|p| !p.state().is_terminal()) {
            if let Err(e) = p.session.outbound().send(&message) {
                warn!("Failed to announce name to {}: {}", p.id().short(), e);
            }
        }
    }

    /// Re-offer to one participant with a fresh network path discovery.
    pub async fn restart_negotiation(&mut self, peer: &PeerId) -> Result<(), RoomError> {
        let p = self
            .participants
            .get_mut(peer)
            .ok_or_else(|| RoomError::UnknownParticipant(peer.short().to_string()))?;
        let result = p.session.restart().await;
        match result {
            // The session itself is still healthy
            Err(e @ NegotiationError::InvalidState { .. }) => Err(e.into()),
            result => self.settle(peer, result).await.map_err(RoomError::from),
        }
    }

    // Event loop

    /// Wait for the next input. Cancel-safe.
    pub async fn recv(&mut self) -> RoomInput {
        tokio::select! {
            Some(input) = self.inputs_rx.recv() => input,
            Some(event) = self.media_rx.recv() => RoomInput::Media(event),
            else => futures::future::pending().await,
        }
    }

    /// Wait for and handle one input.
    pub async fn step(&mut self) {
        let input = self.recv().await;
        self.dispatch(input).await;
    }

    /// Apply one input. Never fails; per-peer errors only affect that
    /// peer's session.
    pub async fn dispatch(&mut self, input: RoomInput) {
        trace!("Dispatch {:?}", input);
        match input {
            RoomInput::Connected { room, connection } => self.on_connection(room, connection).await,
            RoomInput::Signal { peer, epoch, payload } => {
                if self.is_current(&peer, epoch) {
                    self.on_signal(&peer, &payload).await;
                }
            }
            RoomInput::Closed { peer, epoch, reason } => {
                if !self.is_current(&peer, epoch) {
                    return;
                }
                match reason {
                    Some(reason) => info!("Connection to {} lost: {}", peer.short(), reason),
                    None => info!("Connection to {} closed", peer.short()),
                }
                if let Some(p) = self.participants.get_mut(&peer) {
                    p.session.close().await;
                }
                self.settle(&peer, Ok(())).await.ok();
            }
            RoomInput::Media(TaggedMediaEvent { peer, epoch, event }) => {
                if self.is_current(&peer, epoch) {
                    self.on_media_event(&peer, event).await;
                }
            }
        }
    }

    fn is_current(&self, peer: &PeerId, epoch: u64) -> bool {
        let current = self.participants.get(peer).map(|p| p.epoch() == epoch).unwrap_or(false);
        if !current {
            trace!("Ignoring stale input from {}#{}", peer.short(), epoch);
        }
        current
    }

    async fn on_connection(&mut self, room: u64, connection: PeerConnection) {
        let room_epoch = self.room.as_ref().map(|r| r.epoch);
        if room_epoch != Some(room) {
            debug!("Dropping connection from {} for a previous room", connection.remote_id.short());
            return;
        }
        let peer = connection.remote_id.clone();
        if peer == self.local_id {
            debug!("Ignoring connection to self");
            return;
        }

        let previous = self.participants.remove(&peer);
        if previous.is_none() && self.participants.len() >= self.config.room.max_peers {
            warn!("Refusing connection from {}: room is full ({} peers)", peer.short(), self.config.room.max_peers);
            return;
        }
        let previous_name = match previous {
            Some(mut old) => {
                info!("Replacing connection to {}", peer.short());
                old.session.close().await;
                old.abort_tasks();
                Some(old.display_name().to_string())
            }
            None => None,
        };

        let epoch = self.allocate_epoch();
        let events = MediaEvents::new(peer.clone(), epoch, self.media_tx.clone());
        let media = match self.media_factory.create(&peer, events).await {
            Ok(media) => media,
            Err(e) => {
                warn!("Failed to create media session for {}: {}", peer.short(), e);
                self.events.emit(RoomEvent::NegotiationFailed { peer: peer.clone(), reason: e.to_string() });
                if previous_name.is_some() {
                    self.events.emit(RoomEvent::ParticipantLeft { peer });
                }
                return;
            }
        };

        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let tasks = spawn_connection(peer.clone(), epoch, connection, out_rx, self.inputs_tx.clone());
        let session = SignalingSession::new(self.local_id.clone(), peer.clone(), media, SignalSender::new(out_tx));
        let mut participant = Participant::new(peer.clone(), epoch, session, tasks);
        if let Some(name) = previous_name.clone() {
            participant.set_display_name(name);
        } else {
            self.events.emit(RoomEvent::ParticipantJoined {
                peer: peer.clone(),
                name: participant.display_name().to_string(),
            });
        }

        let announce = SignalingMessage::user_info(&self.display_name, epoch_millis());
        if let Err(e) = participant.session.outbound().send(&announce) {
            warn!("Failed to announce name to {}: {}", peer.short(), e);
        }
        self.participants.insert(peer.clone(), participant);
        info!("Participant {} connected ({} in room)", peer.short(), self.participants.len());

        let result = match self.participants.get_mut(&peer) {
            Some(p) => p.session.start().await,
            None => return,
        };
        self.settle(&peer, result).await.ok();
    }

    async fn on_signal(&mut self, peer: &PeerId, payload: &[u8]) {
        let message = match SignalingMessage::from_json(payload) {
            Ok(message) => message,
            Err(e) => {
                self.settle(peer, Err(e)).await.ok();
                return;
            }
        };
        trace!("Received {} from {}", message.kind(), peer.short());

        match message {
            SignalingMessage::UserInfo { username, .. } => self.rename(peer, &username),
            SignalingMessage::Audio { data, username, .. } => {
                self.rename(peer, &username);
                match self.codec.decode_pcm(&data) {
                    Ok(samples) => self.accept_audio(peer, &samples, Instant::now()),
                    Err(e) => debug!("Dropping frame from {}: {}", peer.short(), e),
                }
            }
            negotiation => {
                let result = match self.participants.get_mut(peer) {
                    Some(p) => p.session.handle_signal(negotiation).await,
                    None => return,
                };
                self.settle(peer, result).await.ok();
            }
        }
    }

    fn rename(&mut self, peer: &PeerId, name: &str) {
        if let Some(p) = self.participants.get_mut(peer) {
            if p.rename(name) {
                let name = p.display_name().to_string();
                info!("Participant {} is now {}", peer.short(), name);
                self.events.emit(RoomEvent::ParticipantRenamed { peer: peer.clone(), name });
            }
        }
    }

    async fn on_media_event(&mut self, peer: &PeerId, event: MediaEvent) {
        match event {
            MediaEvent::Frame(payload) => self.on_participant_audio(peer, &payload),
            MediaEvent::LocalCandidate(candidate) => {
                let result = match self.participants.get_mut(peer) {
                    Some(p) => p.session.on_local_candidate(candidate),
                    None => return,
                };
                self.settle(peer, result).await.ok();
            }
            MediaEvent::StateChanged(state) => {
                let (result, role) = match self.participants.get_mut(peer) {
                    Some(p) => (p.session.on_media_state(state), p.session.role()),
                    None => return,
                };
                self.settle(peer, result).await.ok();
                if state != MediaState::Disconnected || !self.participants.contains_key(peer) {
                    return;
                }
                warn!("Media path to {} degraded", peer.short());
                self.events.emit(RoomEvent::MediaPathDegraded { peer: peer.clone() });
                if self.config.room.restart_on_disconnect && role == Role::Offerer {
                    if let Err(e) = self.restart_negotiation(peer).await {
                        warn!("Automatic restart for {} failed: {}", peer.short(), e);
                    }
                }
            }
        }
    }

    /// Publish state transitions of a participant's session after an
    /// operation and apply its outcome. An error fails the session; a
    /// terminal session is removed from the registry. Returns the error
    /// that failed the session.
    async fn settle(&mut self, peer: &PeerId, outcome: Result<(), NegotiationError>) -> Result<(), NegotiationError> {
        let Some(p) = self.participants.get_mut(peer) else {
            return outcome;
        };
        if let Err(e) = &outcome {
            p.session.fail(e).await;
        }
        let transitions = p.session.drain_transitions();
        let terminal = p.state().is_terminal();

        for state in transitions {
            self.events.emit(RoomEvent::SessionStateChanged { peer: peer.clone(), state });
        }
        if let Err(e) = &outcome {
            self.events.emit(RoomEvent::NegotiationFailed { peer: peer.clone(), reason: e.to_string() });
        }
        if terminal {
            self.remove_participant(peer);
        }
        outcome
    }

    fn remove_participant(&mut self, peer: &PeerId) {
        if let Some(mut p) = self.participants.remove(peer) {
            p.abort_tasks();
            if p.speaking() {
                self.events.emit(RoomEvent::TransmissionStateChanged { peer: peer.clone(), speaking: false });
            }
            info!("Participant {} left ({} in room)", peer.short(), self.participants.len());
            self.events.emit(RoomEvent::ParticipantLeft { peer: peer.clone() });
        }
    }
}

/// Spawn the reader and writer tasks for one participant connection.
fn spawn_connection(
    peer: PeerId,
    epoch: u64,
    connection: PeerConnection,
    mut outbound: mpsc::UnboundedReceiver<Bytes>,
    inputs: mpsc::UnboundedSender<RoomInput>,
) -> Vec<tokio::task::JoinHandle<()>> {
    let (mut reader, mut writer) = tokio::io::split(connection.stream);

    let writer_peer = peer.clone();
    let writer_inputs = inputs.clone();
    let writer_task = tokio::spawn(async move {
        while let Some(message) = outbound.recv().await {
            if let Err(e) = write_frame(&mut writer, &message).await {
                let _ = writer_inputs.send(RoomInput::Closed {
                    peer: writer_peer,
                    epoch,
                    reason: Some(format!("write failed: {}", e)),
                });
                return;
            }
        }
        let _ = writer.shutdown().await;
    });

    let reader_task = tokio::spawn(async move {
        let mut decoder = FrameDecoder::new();
        let reason = loop {
            match read_frame(&mut reader, &mut decoder).await {
                Ok(Some(payload)) => {
                    if inputs.send(RoomInput::Signal { peer: peer.clone(), epoch, payload }).is_err() {
                        return;
                    }
                }
                Ok(None) => break None,
                Err(e) => break Some(format!("read failed: {}", e)),
            }
        };
        let _ = inputs.send(RoomInput::Closed { peer, epoch, reason });
    });

    vec![reader_task, writer_task]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::AudioSink;
    use crate::transport::MemoryHub;
    use crate::webrtc::RelayMediaFactory;
    use parking_lot::Mutex;

    #[derive(Clone, Default)]
    struct Recorder(Arc<Mutex<Vec<(PeerId, usize)>>>);

    impl AudioSink for Recorder {
        fn play(&mut self, from: &PeerId, samples: &[f32]) {
            self.0.lock().push((from.clone(), samples.len()));
        }
    }

    fn controller(hub: &MemoryHub, id: &str) -> (RoomController, Recorder) {
        let recorder = Recorder::default();
        let controller = RoomController::new(
            Config::default(),
            Arc::new(hub.endpoint_with_id(PeerId::new(id))),
            Arc::new(RelayMediaFactory::new()),
            Box::new(recorder.clone()),
        );
        (controller, recorder)
    }

    #[tokio::test]
    async fn invalid_topic_keeps_current_room() {
        let hub = MemoryHub::new();
        let (mut a, _) = controller(&hub, "aa");
        let topic = a.create_room().await.unwrap();

        assert!(matches!(a.join_room("").await, Err(RoomError::InvalidTopic(TopicError::Empty))));
        assert!(matches!(a.join_room("xyz").await, Err(RoomError::InvalidTopic(_))));
        assert_eq!(a.topic(), Some(topic));
        assert_eq!(hub.members(&topic), 1);
    }

    #[tokio::test]
    async fn create_replaces_previous_room() {
        let hub = MemoryHub::new();
        let (mut a, _) = controller(&hub, "aa");
        let mut events = a.subscribe();
        let first = a.create_room().await.unwrap();
        let second = a.create_room().await.unwrap();
        assert_ne!(first, second);
        assert_eq!(hub.members(&first), 0);
        assert_eq!(hub.members(&second), 1);

        assert_eq!(events.try_recv().unwrap(), RoomEvent::RoomCreated { topic: first });
        assert_eq!(events.try_recv().unwrap(), RoomEvent::RoomLeft { topic: first });
        assert_eq!(events.try_recv().unwrap(), RoomEvent::RoomCreated { topic: second });
    }

    #[tokio::test]
    async fn leave_is_idempotent() {
        let hub = MemoryHub::new();
        let (mut a, _) = controller(&hub, "aa");
        a.leave_room().await;
        let topic = a.create_room().await.unwrap();
        a.leave_room().await;
        a.leave_room().await;
        assert_eq!(a.topic(), None);
        assert_eq!(hub.members(&topic), 0);
        assert!(a.participants().is_empty());
    }

    #[tokio::test]
    async fn transmit_toggle_emits_on_change_only() {
        let hub = MemoryHub::new();
        let (mut a, _) = controller(&hub, "aa");
        let mut events = a.subscribe();
        a.stop_transmitting();
        a.start_transmitting();
        a.start_transmitting();
        a.stop_transmitting();
        a.stop_transmitting();
        assert!(!a.is_transmitting());
        assert_eq!(events.try_recv().unwrap(), RoomEvent::LocalTransmissionChanged { transmitting: true });
        assert_eq!(events.try_recv().unwrap(), RoomEvent::LocalTransmissionChanged { transmitting: false });
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn captured_audio_ignored_when_idle() {
        let hub = MemoryHub::new();
        let (mut a, _) = controller(&hub, "aa");
        assert_eq!(a.on_captured_audio(&[0.5; 4096]).await, 0);
        a.start_transmitting();
        // no peers yet
        assert_eq!(a.on_captured_audio(&[0.5; 4096]).await, 0);
        assert_eq!(a.broadcast(&[]).await, 0);
    }

    #[tokio::test]
    async fn audio_from_unknown_peer_is_dropped() {
        let hub = MemoryHub::new();
        let (mut a, recorder) = controller(&hub, "aa");
        a.on_participant_audio(&PeerId::new("bb"), &[0x00, 0x40, 0x00, 0x40]);
        a.on_participant_audio(&PeerId::new("bb"), &[]);
        assert!(recorder.0.lock().is_empty());
        assert!(!a.is_speaking(&PeerId::new("bb"), Instant::now()));
    }

    #[tokio::test]
    async fn display_name_defaults_from_id() {
        let hub = MemoryHub::new();
        let (mut a, _) = controller(&hub, "0123456789ab");
        assert_eq!(a.display_name(), "peer-012345");
        a.set_display_name("  alpha ");
        assert_eq!(a.display_name(), "alpha");
        a.set_display_name("");
        assert_eq!(a.display_name(), "peer-012345");
    }
}
