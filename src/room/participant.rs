//! Participant registry entries.

use crate::transport::PeerId;
use crate::webrtc::{Role, SessionState, SignalingSession};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;

/// Placeholder shown until a peer announces its own name
pub fn default_display_name(id: &PeerId) -> String {
    format!("peer-{}", id.short())
}

/// One remote peer: its connection, negotiation and speaking state.
pub struct Participant {
    id: PeerId,
    display_name: String,
    epoch: u64,
    pub(crate) session: SignalingSession,
    last_audio_at: Option<Instant>,
    speaking: bool,
    tasks: Vec<JoinHandle<()>>,
}

impl Participant {
    pub fn new(id: PeerId, epoch: u64, session: SignalingSession, tasks: Vec<JoinHandle<()>>) -> Self {
        let display_name = default_display_name(&id);
        Self { id, display_name, epoch, session, last_audio_at: None, speaking: false, tasks }
    }

    pub fn id(&self) -> &PeerId {
        &self.id
    }

    pub fn display_name(&self) -> &str {
        &self.display_name
    }

    /// Returns true if the name actually changed.
    pub fn rename(&mut self, name: &str) -> bool {
        let name = name.trim();
        if name.is_empty() || name == self.display_name {
            return false;
        }
        self.display_name = name.to_string();
        true
    }

    pub(crate) fn set_display_name(&mut self, name: String) {
        self.display_name = name;
    }

    /// Connection generation; inputs tagged with another epoch are stale.
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn state(&self) -> SessionState {
        self.session.state()
    }

    /// Record a received frame. Returns true on the rising edge.
    pub fn mark_audio(&mut self, now: Instant) -> bool {
        self.last_audio_at = Some(now);
        let rising = !self.speaking;
        self.speaking = true;
        rising
    }

    pub fn is_speaking(&self, now: Instant, decay: Duration) -> bool {
        match self.last_audio_at {
            Some(at) => now.saturating_duration_since(at) < decay,
            None => false,
        }
    }

    /// Clear an expired speaking flag. Returns true on the falling edge.
    pub fn expire(&mut self, now: Instant, decay: Duration) -> bool {
        if self.speaking && !self.is_speaking(now, decay) {
            self.speaking = false;
            return true;
        }
        false
    }

    /// Speaking flag as last evaluated
    pub fn speaking(&self) -> bool {
        self.speaking
    }

    pub fn info(&self) -> ParticipantInfo {
        ParticipantInfo {
            id: self.id.clone(),
            display_name: self.display_name.clone(),
            state: self.session.state(),
            role: self.session.role(),
            speaking: self.speaking,
        }
    }

    /// Stop the connection reader/writer tasks.
    pub fn abort_tasks(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }
}

impl Drop for Participant {
    fn drop(&mut self) {
        self.abort_tasks();
    }
}

/// Read-only snapshot for presentation
#[derive(Debug, Clone, PartialEq)]
pub struct ParticipantInfo {
    pub id: PeerId,
    pub display_name: String,
    pub state: SessionState,
    pub role: Role,
    pub speaking: bool,
}
