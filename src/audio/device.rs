//! cpal-backed microphone capture and speaker playback.
//!
//! cpal streams are not `Send`, so each stream lives on a dedicated thread
//! that keeps it alive until the owning handle is dropped.

use super::{AudioSink, DeviceError};
use crate::transport::PeerId;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use log::{error, info, warn};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tokio::sync::mpsc;

/// Upper bound on queued playback samples (about 4 s at 16 kHz)
const MAX_PLAYBACK_BACKLOG: usize = 65_536;

/// Keeps a device stream thread alive; stops it on drop.
pub struct StreamHandle {
    running: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl Drop for StreamHandle {
    fn drop(&mut self) {
        self.running.store(false, Ordering::Relaxed);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

fn pick_config(
    configs: impl Iterator<Item = cpal::SupportedStreamConfigRange>,
    sample_rate: u32,
) -> Option<cpal::SupportedStreamConfig> {
    for cfg in configs {
        if cfg.channels() == 1
            && cfg.sample_format() == cpal::SampleFormat::F32
            && cfg.min_sample_rate().0 <= sample_rate
            && sample_rate <= cfg.max_sample_rate().0
        {
            return Some(cfg.with_sample_rate(cpal::SampleRate(sample_rate)));
        }
    }
    None
}

/// Start capturing mono f32 samples from the default input device.
///
/// Captured chunks are pushed into `sender` as they arrive; frame slicing
/// happens in the room controller.
pub fn start_capture(
    sample_rate: u32,
    sender: mpsc::UnboundedSender<Vec<f32>>,
) -> Result<StreamHandle, DeviceError> {
    let running = Arc::new(AtomicBool::new(true));
    let (ready_tx, ready_rx) = std::sync::mpsc::channel::<Result<(), DeviceError>>();
    let running_thread = running.clone();

    let thread = std::thread::spawn(move || {
        let host = cpal::default_host();
        let device = match host.default_input_device() {
            Some(device) => device,
            None => {
                let _ = ready_tx.send(Err(DeviceError::NoDevice("input")));
                return;
            }
        };
        let config = device
            .supported_input_configs()
            .ok()
            .and_then(|configs| pick_config(configs, sample_rate));
        let config = match config {
            Some(cfg) => cfg,
            None => {
                let _ = ready_tx.send(Err(DeviceError::Backend(format!(
                    "input device does not support mono f32 at {} Hz",
                    sample_rate
                ))));
                return;
            }
        };

        let stream = device.build_input_stream(
            &config.config(),
            move |data: &[f32], _| {
                let _ = sender.send(data.to_vec());
            },
            |err| error!("Audio capture stream error: {}", err),
            None,
        );
        let stream = match stream.map_err(|e| DeviceError::Backend(e.to_string())) {
            Ok(stream) => stream,
            Err(e) => {
                let _ = ready_tx.send(Err(e));
                return;
            }
        };
        if let Err(e) = stream.play() {
            let _ = ready_tx.send(Err(DeviceError::Backend(e.to_string())));
            return;
        }

        info!("Audio capture started at {} Hz", sample_rate);
        let _ = ready_tx.send(Ok(()));
        while running_thread.load(Ordering::Relaxed) {
            std::thread::sleep(Duration::from_millis(100));
        }
        drop(stream);
        info!("Audio capture stopped");
    });

    match ready_rx.recv() {
        Ok(Ok(())) => Ok(StreamHandle { running, thread: Some(thread) }),
        Ok(Err(e)) => {
            let _ = thread.join();
            Err(e)
        }
        Err(_) => Err(DeviceError::Backend("capture thread exited".to_string())),
    }
}

/// Speaker output fed from a shared sample queue.
pub struct DevicePlayback {
    queue: Arc<Mutex<VecDeque<f32>>>,
    _handle: StreamHandle,
}

impl DevicePlayback {
    pub fn open(sample_rate: u32) -> Result<Self, DeviceError> {
        let queue = Arc::new(Mutex::new(VecDeque::<f32>::new()));
        let running = Arc::new(AtomicBool::new(true));
        let (ready_tx, ready_rx) = std::sync::mpsc::channel::<Result<(), DeviceError>>();
        let running_thread = running.clone();
        let queue_thread = queue.clone();

        let thread = std::thread::spawn(move || {
            let host = cpal::default_host();
            let device = match host.default_output_device() {
                Some(device) => device,
                None => {
                    let _ = ready_tx.send(Err(DeviceError::NoDevice("output")));
                    return;
                }
            };
            let config = device
                .supported_output_configs()
                .ok()
                .and_then(|configs| pick_config(configs, sample_rate));
            let config = match config {
                Some(cfg) => cfg,
                None => {
                    let _ = ready_tx.send(Err(DeviceError::Backend(format!(
                        "output device does not support mono f32 at {} Hz",
                        sample_rate
                    ))));
                    return;
                }
            };

            let stream = device.build_output_stream(
                &config.config(),
                move |data: &mut [f32], _| {
                    let mut queue = queue_thread.lock();
                    for out in data.iter_mut() {
                        *out = queue.pop_front().unwrap_or(0.0);
                    }
                },
                |err| error!("Audio playback stream error: {}", err),
                None,
            );
            let stream = match stream.map_err(|e| DeviceError::Backend(e.to_string())) {
                Ok(stream) => stream,
                Err(e) => {
                    let _ = ready_tx.send(Err(e));
                    return;
                }
            };
            if let Err(e) = stream.play() {
                let _ = ready_tx.send(Err(DeviceError::Backend(e.to_string())));
                return;
            }

            let _ = ready_tx.send(Ok(()));
            while running_thread.load(Ordering::Relaxed) {
                std::thread::sleep(Duration::from_millis(100));
            }
            drop(stream);
        });

        match ready_rx.recv() {
            Ok(Ok(())) => Ok(Self {
                queue,
                _handle: StreamHandle { running, thread: Some(thread) },
            }),
            Ok(Err(e)) => {
                let _ = thread.join();
                Err(e)
            }
            Err(_) => Err(DeviceError::Backend("playback thread exited".to_string())),
        }
    }
}

impl AudioSink for DevicePlayback {
    fn play(&mut self, from: &PeerId, samples: &[f32]) {
        let mut queue = self.queue.lock();
        if queue.len() + samples.len() > MAX_PLAYBACK_BACKLOG {
            warn!("Playback backlog full, dropping frame from {}", from.short());
            return;
        }
        queue.extend(samples.iter().copied());
    }
}
