//! Rendezvous transport
//!
//! A rendezvous maps a shared topic to a set of raw byte-stream connections,
//! one per discovered peer. Ordering holds only within a single connection.

pub mod framing;
pub mod lan;
pub mod memory;

use async_trait::async_trait;
use rand::RngCore;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::task::JoinHandle;

pub use lan::LanRendezvous;
pub use memory::{MemoryHub, MemoryRendezvous};

/// Topic length in bytes
pub const TOPIC_LEN: usize = 32;

#[derive(Debug, thiserror::Error)]
pub enum RendezvousError {
    #[error("failed to bind {0}: {1}")]
    Bind(String, std::io::Error),
    #[error("handshake failed: {0}")]
    Handshake(String),
    #[error("rendezvous I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("rendezvous unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TopicError {
    #[error("topic is empty")]
    Empty,
    #[error("topic must be {expected} hex characters, got {actual}")]
    Length { expected: usize, actual: usize },
    #[error("topic is not valid hex")]
    NotHex,
}

/// 256-bit room identifier shared out-of-band.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Topic([u8; TOPIC_LEN]);

impl Topic {
    pub fn random() -> Self {
        let mut bytes = [0u8; TOPIC_LEN];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self(bytes)
    }

    pub fn from_bytes(bytes: [u8; TOPIC_LEN]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; TOPIC_LEN] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Non-reversible key advertised during discovery instead of the topic.
    pub fn discovery_key(&self) -> u64 {
        xxhash_rust::xxh64::xxh64(&self.0, 0x7761_6c6b_6965)
    }
}

impl FromStr for Topic {
    type Err = TopicError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err(TopicError::Empty);
        }
        if s.len() != TOPIC_LEN * 2 {
            return Err(TopicError::Length { expected: TOPIC_LEN * 2, actual: s.len() });
        }
        let mut bytes = [0u8; TOPIC_LEN];
        hex::decode_to_slice(s, &mut bytes).map_err(|_| TopicError::NotHex)?;
        Ok(Self(bytes))
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Topic({}…)", &self.to_hex()[..8])
    }
}

/// Opaque peer identifier assigned by the rendezvous layer.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerId(String);

impl PeerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Fresh ephemeral identifier (32 random bytes, hex encoded)
    pub fn random() -> Self {
        let mut bytes = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self(hex::encode(bytes))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First six characters, for display and logs
    pub fn short(&self) -> &str {
        let end = self.0.char_indices().nth(6).map(|(i, _)| i).unwrap_or(self.0.len());
        &self.0[..end]
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Which side of discovery a member takes part in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinMode {
    /// Only connects to announced peers
    Client,
    /// Announces itself and accepts, and also connects to announced peers
    ClientAndServer,
}

impl JoinMode {
    pub fn is_server(&self) -> bool {
        matches!(self, JoinMode::ClientAndServer)
    }
}

/// Bidirectional byte stream to one peer
pub trait ByteStream: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> ByteStream for T {}

/// A raw connection to a discovered peer
pub struct PeerConnection {
    pub remote_id: PeerId,
    pub stream: Box<dyn ByteStream>,
}

impl fmt::Debug for PeerConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeerConnection").field("remote_id", &self.remote_id).finish()
    }
}

/// Callback invoked for each new peer connection
pub type ConnectionCallback = Arc<dyn Fn(PeerConnection) + Send + Sync>;

/// Active participation in a topic; leaving stops discovery.
pub struct Membership {
    topic: Topic,
    tasks: Vec<JoinHandle<()>>,
    on_leave: Option<Box<dyn FnOnce() + Send>>,
}

impl Membership {
    pub fn new(topic: Topic) -> Self {
        Self { topic, tasks: Vec::new(), on_leave: None }
    }

    pub fn with_task(mut self, task: JoinHandle<()>) -> Self {
        self.tasks.push(task);
        self
    }

    pub fn with_leave_hook(mut self, hook: impl FnOnce() + Send + 'static) -> Self {
        self.on_leave = Some(Box::new(hook));
        self
    }

    pub fn topic(&self) -> &Topic {
        &self.topic
    }

    pub fn is_active(&self) -> bool {
        self.on_leave.is_some() || self.tasks.iter().any(|t| !t.is_finished())
    }

    /// Stop discovery. Safe to call more than once.
    pub fn leave(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
        if let Some(hook) = self.on_leave.take() {
            hook();
        }
    }
}

impl Drop for Membership {
    fn drop(&mut self) {
        self.leave();
    }
}

/// Discovery capability: topic in, peer connections out.
#[async_trait]
pub trait Rendezvous: Send + Sync {
    /// Identifier other peers see for this node
    fn local_id(&self) -> &PeerId;

    /// Join `topic`; every connection established while the membership is
    /// active is handed to `on_connection`.
    async fn join(
        &self,
        topic: &Topic,
        mode: JoinMode,
        on_connection: ConnectionCallback,
    ) -> Result<Membership, RendezvousError>;
}
