//! Fixed-size frame assembly for captured audio.

use super::codec::frame_level;

/// Slices an arbitrary stream of captured chunks into fixed-size frames.
#[derive(Debug)]
pub struct FrameAssembler {
    frame_size: usize,
    pending: Vec<f32>,
}

impl FrameAssembler {
    pub fn new(frame_size: usize) -> Self {
        Self {
            frame_size: frame_size.max(1),
            pending: Vec::with_capacity(frame_size.max(1)),
        }
    }

    pub fn frame_size(&self) -> usize {
        self.frame_size
    }

    /// Samples buffered towards the next frame
    pub fn buffered(&self) -> usize {
        self.pending.len()
    }

    /// Append captured samples, returning every frame completed by them.
    pub fn push(&mut self, samples: &[f32]) -> Vec<Vec<f32>> {
        let mut frames = Vec::new();
        let mut rest = samples;
        while !rest.is_empty() {
            let take = (self.frame_size - self.pending.len()).min(rest.len());
            self.pending.extend_from_slice(&rest[..take]);
            rest = &rest[take..];
            if self.pending.len() == self.frame_size {
                frames.push(std::mem::replace(
                    &mut self.pending,
                    Vec::with_capacity(self.frame_size),
                ));
            }
        }
        frames
    }

    /// Drop a partially assembled frame.
    pub fn reset(&mut self) {
        self.pending.clear();
    }
}

/// True when the frame carries no speech worth sending or playing.
pub fn is_silent(samples: &[f32], threshold: f32) -> bool {
    frame_level(samples) <= threshold
}
