//! Audio frame handling: PCM codec, frame assembly and device I/O.

pub mod codec;
pub mod frame;

#[cfg(feature = "audio")]
pub mod device;

pub use codec::{frame_level, CodecError, FrameCodec};
pub use frame::{is_silent, FrameAssembler};

use crate::transport::PeerId;
use log::debug;

/// Microphone or speaker acquisition failure
#[derive(Debug, thiserror::Error)]
pub enum DeviceError {
    #[error("no {0} device available")]
    NoDevice(&'static str),
    #[error("audio device error: {0}")]
    Backend(String),
    #[error("audio support is not compiled in")]
    Unsupported,
}

/// Consumer of decoded audio frames.
pub trait AudioSink: Send {
    fn play(&mut self, from: &PeerId, samples: &[f32]);
}

/// Sink that only records frame arrivals in the log.
#[derive(Debug, Default)]
pub struct LogSink;

impl AudioSink for LogSink {
    fn play(&mut self, from: &PeerId, samples: &[f32]) {
        debug!("Playback of {} samples from {}", samples.len(), from.short());
    }
}
