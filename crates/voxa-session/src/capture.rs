//! Microphone capture pipeline
//!
//! Acquires a raw input stream under fixed constraints (mono, fixed sample
//! rate) and flushes accumulated samples as one frame per cadence interval.
//! Frames feed both the transport (as encoded PCM16) and the speech
//! detector (as raw samples).
//!
//! The cpal stream is built on a dedicated thread because it is not `Send`
//! on every platform; the returned [`CaptureHandle`] keeps it alive.

use crate::error::{SessionError, SessionResult};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::StreamConfig;
use std::any::Any;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Capture constraints. Echo cancellation and noise suppression are
/// requested from the host where the platform honors them; cpal itself has
/// no portable knob for either.
#[derive(Debug, Clone)]
pub struct CaptureConfig {
    /// Sample rate in Hz (default: 16000).
    pub sample_rate: u32,
    /// Number of channels (default: 1 for mono).
    pub channels: u16,
    /// Samples per emitted frame (default: 1600 = 100ms at 16kHz).
    pub frame_samples: usize,
    pub echo_cancellation: bool,
    pub noise_suppression: bool,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            sample_rate: 16000,
            channels: 1,
            frame_samples: 1600, // 100ms at 16kHz
            echo_cancellation: true,
            noise_suppression: true,
        }
    }
}

/// One flushed capture frame.
#[derive(Debug, Clone)]
pub struct CaptureFrame {
    /// Raw samples (f32, -1.0..1.0).
    pub samples: Vec<f32>,
    /// When the frame was flushed.
    pub captured_at: Instant,
}

/// Source of capture frames. The production implementation is
/// [`MicCapture`]; tests use [`ScriptedCapture`].
pub trait CaptureSource: Send {
    /// Begin capturing, delivering frames on `frames`. A permission or
    /// device failure here is fatal to the start attempt.
    fn start(&mut self, frames: mpsc::UnboundedSender<CaptureFrame>) -> SessionResult<CaptureHandle>;
}

/// Keeps a capture stream alive; dropping it stops capture.
pub struct CaptureHandle {
    _guard: Box<dyn Any + Send>,
}

impl CaptureHandle {
    pub fn new(guard: impl Any + Send) -> Self {
        Self {
            _guard: Box::new(guard),
        }
    }
}

/// Production capture source backed by cpal.
#[derive(Debug, Clone)]
pub struct MicCapture {
    config: CaptureConfig,
}

impl MicCapture {
    pub fn new(config: CaptureConfig) -> Self {
        Self { config }
    }

    /// List available input devices.
    pub fn list_input_devices() -> SessionResult<Vec<String>> {
        let host = cpal::default_host();
        let devices = host.input_devices()?;

        let mut names = Vec::new();
        for device in devices {
            if let Ok(name) = device.name() {
                names.push(name);
            }
        }
        Ok(names)
    }
}

impl CaptureSource for MicCapture {
    fn start(&mut self, frames: mpsc::UnboundedSender<CaptureFrame>) -> SessionResult<CaptureHandle> {
        let config = self.config.clone();
        let (ready_tx, ready_rx) = std::sync::mpsc::channel();
        let (stop_tx, stop_rx) = std::sync::mpsc::channel::<()>();

        std::thread::spawn(move || match build_input_stream(&config, frames) {
            Ok(stream) => {
                let started = stream.play().map_err(SessionError::from);
                let ok = started.is_ok();
                let _ = ready_tx.send(started);
                if ok {
                    // Hold the stream until the handle is dropped.
                    let _ = stop_rx.recv();
                }
                drop(stream);
            }
            Err(e) => {
                let _ = ready_tx.send(Err(e));
            }
        });

        ready_rx
            .recv()
            .map_err(|_| SessionError::Setup("capture thread died during init".to_string()))??;

        info!(
            "Capture started ({}Hz, {} channel(s), {} samples/frame)",
            self.config.sample_rate, self.config.channels, self.config.frame_samples
        );
        Ok(CaptureHandle::new(stop_tx))
    }
}

fn build_input_stream(
    config: &CaptureConfig,
    frames: mpsc::UnboundedSender<CaptureFrame>,
) -> SessionResult<cpal::Stream> {
    let device = cpal::default_host()
        .default_input_device()
        .ok_or_else(|| SessionError::Setup("no input device available".to_string()))?;

    debug!(
        "Using input device: {}",
        device.name().unwrap_or_else(|_| "unknown".to_string())
    );
    if config.echo_cancellation || config.noise_suppression {
        // Host-level processing; not controllable through cpal.
        debug!("echo cancellation / noise suppression requested from the host");
    }

    let stream_config = StreamConfig {
        channels: config.channels,
        sample_rate: cpal::SampleRate(config.sample_rate),
        buffer_size: cpal::BufferSize::Default,
    };

    let frame_samples = config.frame_samples;
    let mut sample_buffer: Vec<f32> = Vec::with_capacity(frame_samples);

    let stream = device.build_input_stream(
        &stream_config,
        move |data: &[f32], _: &cpal::InputCallbackInfo| {
            for &sample in data {
                sample_buffer.push(sample);
                if sample_buffer.len() >= frame_samples {
                    let frame = CaptureFrame {
                        samples: sample_buffer.clone(),
                        captured_at: Instant::now(),
                    };
                    if frames.send(frame).is_err() {
                        warn!("capture frame dropped: session loop gone");
                    }
                    sample_buffer.clear();
                }
            }
        },
        move |err| {
            warn!("capture stream error: {}", err);
        },
        None,
    )?;

    Ok(stream)
}

/// Deterministic capture source for tests: plays back a fixed script of
/// frames on an interval, then keeps emitting silence so detectors that
/// need a sustained quiet run still see frames.
#[derive(Debug, Clone)]
pub struct ScriptedCapture {
    frames: Vec<Vec<f32>>,
    interval: Duration,
    silence_samples: usize,
}

impl ScriptedCapture {
    pub fn new(frames: Vec<Vec<f32>>, interval: Duration) -> Self {
        let silence_samples = frames.first().map(|f| f.len()).unwrap_or(1600);
        Self {
            frames,
            interval,
            silence_samples,
        }
    }
}

struct AbortOnDrop(tokio::task::JoinHandle<()>);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

impl CaptureSource for ScriptedCapture {
    fn start(&mut self, frames: mpsc::UnboundedSender<CaptureFrame>) -> SessionResult<CaptureHandle> {
        let script = self.frames.clone();
        let interval = self.interval;
        let silence_samples = self.silence_samples;

        let task = tokio::spawn(async move {
            for samples in script {
                tokio::time::sleep(interval).await;
                if frames
                    .send(CaptureFrame {
                        samples,
                        captured_at: Instant::now(),
                    })
                    .is_err()
                {
                    return;
                }
            }
            loop {
                tokio::time::sleep(interval).await;
                if frames
                    .send(CaptureFrame {
                        samples: vec![0.0; silence_samples],
                        captured_at: Instant::now(),
                    })
                    .is_err()
                {
                    return;
                }
            }
        });

        Ok(CaptureHandle::new(AbortOnDrop(task)))
    }
}
