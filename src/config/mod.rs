//! Configuration management for walkie

use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid config: {0}")]
    Invalid(&'static str),
}

/// Where outgoing audio frames travel once a peer is Established
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum AudioRoute {
    /// `audio` messages over the signaling connection
    #[default]
    Signaling,
    /// Binary frames over the negotiated media session
    Media,
}

impl AudioRoute {
    pub fn as_str(&self) -> &'static str {
        match self {
            AudioRoute::Signaling => "signaling",
            AudioRoute::Media => "media",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Room and participant behaviour
    #[serde(default)]
    pub room: RoomConfig,

    /// Audio framing and quantization
    #[serde(default)]
    pub audio: AudioConfig,

    /// Peer discovery
    #[serde(default)]
    pub rendezvous: RendezvousConfig,

    /// Direct media path
    #[serde(default)]
    pub webrtc: WebRTCConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoomConfig {
    /// Display name announced to peers (empty: generated from the peer id)
    #[serde(default)]
    pub display_name: String,

    /// Maximum simultaneous participants
    #[serde(default = "default_max_peers")]
    pub max_peers: usize,

    /// How long a participant stays "speaking" after its last frame
    #[serde(default = "default_speaking_decay_ms")]
    pub speaking_decay_ms: u64,

    /// Interval of the speaking-flag evaluation tick
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,

    /// Re-offer automatically when an established media path degrades
    #[serde(default)]
    pub restart_on_disconnect: bool,

    /// Transport used for audio frames
    #[serde(default)]
    pub audio_route: AudioRoute,
}

impl Default for RoomConfig {
    fn default() -> Self {
        Self {
            display_name: String::new(),
            max_peers: default_max_peers(),
            speaking_decay_ms: default_speaking_decay_ms(),
            tick_interval_ms: default_tick_interval_ms(),
            restart_on_disconnect: false,
            audio_route: AudioRoute::Signaling,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudioConfig {
    /// Sample rate (Hz)
    #[serde(default = "default_sample_rate")]
    pub sample_rate: u32,

    /// Samples per frame
    #[serde(default = "default_frame_size")]
    pub frame_size: usize,

    /// Absolute sample ceiling applied before gain
    #[serde(default = "default_clip_ceiling")]
    pub clip_ceiling: f32,

    /// Fixed gain applied after clipping
    #[serde(default = "default_gain")]
    pub gain: f32,

    /// Mean absolute level at or below which a frame counts as silence
    #[serde(default = "default_silence_threshold")]
    pub silence_threshold: f32,

    /// Minimum spacing between two sent frames
    #[serde(default = "default_min_send_interval_ms")]
    pub min_send_interval_ms: u64,

    /// Open the microphone at startup
    #[serde(default = "default_true")]
    pub enable_capture: bool,

    /// Open the speaker at startup
    #[serde(default = "default_true")]
    pub enable_playback: bool,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            sample_rate: default_sample_rate(),
            frame_size: default_frame_size(),
            clip_ceiling: default_clip_ceiling(),
            gain: default_gain(),
            silence_threshold: default_silence_threshold(),
            min_send_interval_ms: default_min_send_interval_ms(),
            enable_capture: true,
            enable_playback: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RendezvousConfig {
    /// Address the TCP listener and beacon socket bind to
    #[serde(default = "default_bind_host")]
    pub bind_host: String,

    /// UDP port for discovery beacons
    #[serde(default = "default_beacon_port")]
    pub beacon_port: u16,

    /// Beacon destination (broadcast address)
    #[serde(default = "default_beacon_addr")]
    pub beacon_addr: String,

    /// Interval between beacons in server mode
    #[serde(default = "default_announce_interval_ms")]
    pub announce_interval_ms: u64,

    /// Peers dialed directly in client mode ("ip:port")
    #[serde(default)]
    pub static_peers: Vec<String>,

    /// Timeout for the connection hello exchange
    #[serde(default = "default_handshake_timeout_ms")]
    pub handshake_timeout_ms: u64,
}

impl Default for RendezvousConfig {
    fn default() -> Self {
        Self {
            bind_host: default_bind_host(),
            beacon_port: default_beacon_port(),
            beacon_addr: default_beacon_addr(),
            announce_interval_ms: default_announce_interval_ms(),
            static_peers: Vec::new(),
            handshake_timeout_ms: default_handshake_timeout_ms(),
        }
    }
}

/// ICE server entry
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IceServerConfig {
    pub urls: Vec<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub credential: Option<String>,
}

/// WebRTC media configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebRTCConfig {
    /// Negotiate a real peer connection (otherwise negotiation-only relay)
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// STUN/TURN servers handed to the ICE agent
    #[serde(default = "default_ice_servers")]
    pub ice_servers: Vec<IceServerConfig>,

    /// Data channel label for audio frames
    #[serde(default = "default_data_channel_label")]
    pub data_channel_label: String,
}

impl Default for WebRTCConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            ice_servers: default_ice_servers(),
            data_channel_label: default_data_channel_label(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level filter
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self { level: default_log_level() }
    }
}

impl Config {
    /// Load configuration from TOML file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Ok(Config::default());
        }

        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.room.max_peers == 0 {
            return Err(ConfigError::Invalid("room.max_peers must be non-zero"));
        }
        if self.room.speaking_decay_ms == 0 {
            return Err(ConfigError::Invalid("room.speaking_decay_ms must be non-zero"));
        }
        if self.room.tick_interval_ms == 0 {
            return Err(ConfigError::Invalid("room.tick_interval_ms must be non-zero"));
        }

        if self.audio.sample_rate == 0 {
            return Err(ConfigError::Invalid("audio.sample_rate must be non-zero"));
        }
        if self.audio.frame_size == 0 {
            return Err(ConfigError::Invalid("audio.frame_size must be non-zero"));
        }
        if !(self.audio.clip_ceiling > 0.0 && self.audio.clip_ceiling <= 1.0) {
            return Err(ConfigError::Invalid("audio.clip_ceiling must be in (0, 1]"));
        }
        if !(self.audio.gain > 0.0) || self.audio.clip_ceiling * self.audio.gain > 1.0 {
            return Err(ConfigError::Invalid("audio.gain must be positive and keep clip_ceiling * gain <= 1"));
        }
        if self.audio.silence_threshold < 0.0 {
            return Err(ConfigError::Invalid("audio.silence_threshold cannot be negative"));
        }

        for peer in &self.rendezvous.static_peers {
            if peer.parse::<std::net::SocketAddr>().is_err() {
                return Err(ConfigError::Invalid("rendezvous.static_peers must be in ip:port format"));
            }
        }
        if self.rendezvous.announce_interval_ms == 0 {
            return Err(ConfigError::Invalid("rendezvous.announce_interval_ms must be non-zero"));
        }

        if self.room.audio_route == AudioRoute::Media && !self.webrtc.enabled {
            return Err(ConfigError::Invalid("room.audio_route = \"media\" requires webrtc.enabled"));
        }

        Ok(())
    }
}

fn default_true() -> bool {
    true
}

fn default_ice_servers() -> Vec<IceServerConfig> {
    vec![
        IceServerConfig {
            urls: vec!["stun:stun.l.google.com:19302".to_string()],
            username: None,
            credential: None,
        },
        IceServerConfig {
            urls: vec!["stun:global.stun.twilio.com:3478".to_string()],
            username: None,
            credential: None,
        },
    ]
}

fn default_data_channel_label() -> String {
    "audio".to_string()
}

fn default_bind_host() -> String {
    "0.0.0.0".to_string()
}

fn default_beacon_addr() -> String {
    "255.255.255.255".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_max_peers() -> usize { 5 }
fn default_speaking_decay_ms() -> u64 { 1000 }
fn default_tick_interval_ms() -> u64 { 100 }
fn default_sample_rate() -> u32 { 16_000 }
fn default_frame_size() -> usize { 2048 }
fn default_clip_ceiling() -> f32 { 0.9 }
fn default_gain() -> f32 { 1.1 }
fn default_silence_threshold() -> f32 { 0.01 }
fn default_min_send_interval_ms() -> u64 { 50 }
fn default_beacon_port() -> u16 { 49737 }
fn default_announce_interval_ms() -> u64 { 1000 }
fn default_handshake_timeout_ms() -> u64 { 5000 }

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        Config::default().validate().unwrap();
    }

    #[test]
    fn validate_rejects_zero_frame_size() {
        let mut cfg = Config::default();
        cfg.audio.frame_size = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn validate_rejects_overdriven_gain() {
        let mut cfg = Config::default();
        cfg.audio.gain = 1.5;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn validate_media_route_requires_webrtc() {
        let mut cfg = Config::default();
        cfg.room.audio_route = AudioRoute::Media;
        cfg.webrtc.enabled = false;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn validate_rejects_bad_static_peer() {
        let mut cfg = Config::default();
        cfg.rendezvous.static_peers = vec!["not-an-addr".to_string()];
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn partial_toml_fills_defaults() {
        let cfg: Config = toml::from_str(
            r#"
            [room]
            display_name = "base"
            audio_route = "media"

            [audio]
            frame_size = 1024
            "#,
        )
        .unwrap();
        assert_eq!(cfg.room.display_name, "base");
        assert_eq!(cfg.room.audio_route, AudioRoute::Media);
        assert_eq!(cfg.room.max_peers, 5);
        assert_eq!(cfg.audio.frame_size, 1024);
        assert_eq!(cfg.audio.sample_rate, 16_000);
        assert_eq!(cfg.webrtc.ice_servers.len(), 2);
    }

    #[test]
    fn missing_file_yields_defaults() {
        let cfg = Config::load(Path::new("/nonexistent/walkie.toml")).unwrap();
        assert_eq!(cfg.room.speaking_decay_ms, 1000);
    }
}
