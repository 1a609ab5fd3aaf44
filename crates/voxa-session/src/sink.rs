//! Audio output engine seam
//!
//! The playback scheduler talks to an `OutputSink`: schedule a decoded PCM
//! buffer at an exact output-clock timestamp, hard-stop everything, read the
//! output clock. "Ended" notifications come back over a channel so the
//! session loop can dequeue the next chunk.
//!
//! `RodioSink` is the production implementation (rodio on a dedicated thread,
//! since the output stream is not `Send` on every platform). `ManualSink` is
//! a deterministic stand-in for tests.

use crate::error::{SessionError, SessionResult};
use rodio::buffer::SamplesBuffer;
use rodio::{OutputStream, Sink, Source};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// A decoded PCM buffer ready for scheduling.
#[derive(Debug, Clone)]
pub struct PcmBuffer {
    /// Mono samples, -1.0..1.0.
    pub samples: Vec<f32>,
    /// Sample rate in Hz.
    pub sample_rate: u32,
}

impl PcmBuffer {
    pub fn duration_secs(&self) -> f64 {
        self.samples.len() as f64 / self.sample_rate as f64
    }
}

/// Notification from the output engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SinkEvent {
    /// The currently scheduled buffer finished playing.
    BufferEnded,
}

/// Output engine capability set: exact-time scheduling, a readable output
/// clock for drift correction, and a hard stop for interruptions.
pub trait OutputSink: Send {
    /// Seconds on the output clock since the sink was created.
    fn output_clock(&self) -> f64;

    /// Schedule `buffer` to begin at `start_at` on the output clock.
    fn schedule(&mut self, buffer: PcmBuffer, start_at: f64);

    /// Immediately halt all scheduled output. Hard stop, not a fade.
    fn hard_stop(&mut self);

    /// Release the underlying audio engine. Called once at teardown.
    fn release(&mut self);
}

/// Creates one sink per session. The session controller owns a factory so
/// tests can substitute `ManualSink` without touching audio hardware.
pub trait OutputSinkFactory: Send + Sync {
    fn create(&self, events: mpsc::UnboundedSender<SinkEvent>) -> SessionResult<Box<dyn OutputSink>>;
}

/// Production output sink backed by rodio.
///
/// The `OutputStream` lives on a dedicated thread (it is not `Send`); the
/// `Sink` handle is shared back. Exact-time starts are approximated by
/// prepending silence up to the requested timestamp, and "ended" is raised
/// by a timer armed for the buffer's end time.
pub struct RodioSink {
    sink: Arc<Sink>,
    events: mpsc::UnboundedSender<SinkEvent>,
    started: Instant,
    /// Bumped on every hard stop so timers armed for superseded buffers
    /// stay silent.
    generation: Arc<AtomicU64>,
    _shutdown: std::sync::mpsc::Sender<()>,
}

impl RodioSink {
    pub fn new(events: mpsc::UnboundedSender<SinkEvent>) -> SessionResult<Self> {
        let (ready_tx, ready_rx) = std::sync::mpsc::channel();
        let (shutdown_tx, shutdown_rx) = std::sync::mpsc::channel::<()>();

        std::thread::spawn(move || {
            let built = OutputStream::try_default()
                .map_err(|e| SessionError::Setup(e.to_string()))
                .and_then(|(stream, handle)| {
                    Sink::try_new(&handle)
                        .map(|sink| (stream, Arc::new(sink)))
                        .map_err(|e| SessionError::Setup(e.to_string()))
                });
            match built {
                Ok((stream, sink)) => {
                    let _ = ready_tx.send(Ok(Arc::clone(&sink)));
                    // Keep the output stream alive until the sink is released.
                    let _ = shutdown_rx.recv();
                    drop(stream);
                }
                Err(e) => {
                    let _ = ready_tx.send(Err(e));
                }
            }
        });

        let sink = ready_rx
            .recv()
            .map_err(|_| SessionError::Setup("output thread died during init".to_string()))??;

        info!("RodioSink: output engine ready");
        Ok(Self {
            sink,
            events,
            started: Instant::now(),
            generation: Arc::new(AtomicU64::new(0)),
            _shutdown: shutdown_tx,
        })
    }
}

impl OutputSink for RodioSink {
    fn output_clock(&self) -> f64 {
        self.started.elapsed().as_secs_f64()
    }

    fn schedule(&mut self, buffer: PcmBuffer, start_at: f64) {
        let now = self.output_clock();
        let duration = buffer.duration_secs();

        // Lead-in silence approximates an exact start when the queue is empty.
        if self.sink.empty() && start_at > now {
            let lead = rodio::source::Zero::<f32>::new(1, buffer.sample_rate)
                .take_duration(Duration::from_secs_f64(start_at - now));
            self.sink.append(lead);
        }
        self.sink
            .append(SamplesBuffer::new(1, buffer.sample_rate, buffer.samples));

        let ends_in = (start_at + duration - now).max(0.0);
        let events = self.events.clone();
        let generation = Arc::clone(&self.generation);
        let armed_for = generation.load(Ordering::SeqCst);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs_f64(ends_in)).await;
            if generation.load(Ordering::SeqCst) == armed_for {
                let _ = events.send(SinkEvent::BufferEnded);
            }
        });
        debug!(start_at, duration, "RodioSink: buffer scheduled");
    }

    fn hard_stop(&mut self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        self.sink.stop();
        debug!("RodioSink: hard stop");
    }

    fn release(&mut self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        self.sink.stop();
        // Dropping the shutdown sender lets the output thread exit.
    }
}

/// Factory for the production sink.
#[derive(Debug, Default)]
pub struct RodioSinkFactory;

impl OutputSinkFactory for RodioSinkFactory {
    fn create(&self, events: mpsc::UnboundedSender<SinkEvent>) -> SessionResult<Box<dyn OutputSink>> {
        Ok(Box::new(RodioSink::new(events)?))
    }
}

/// A buffer recorded by [`ManualSink`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScheduledBuffer {
    pub start_at: f64,
    pub duration: f64,
}

/// Deterministic sink for tests: records every scheduled buffer, exposes a
/// settable output clock, and (optionally) reports each buffer as ended the
/// moment it is scheduled.
pub struct ManualSink {
    shared: Arc<ManualSinkShared>,
    events: mpsc::UnboundedSender<SinkEvent>,
    auto_complete: bool,
}

#[derive(Debug, Default)]
struct ManualSinkShared {
    clock: Mutex<f64>,
    scheduled: Mutex<Vec<ScheduledBuffer>>,
    hard_stops: Mutex<u32>,
    released: Mutex<bool>,
}

/// Inspection/control handle for a [`ManualSink`].
#[derive(Clone)]
pub struct ManualSinkProbe {
    shared: Arc<ManualSinkShared>,
}

impl ManualSinkProbe {
    pub fn set_clock(&self, now: f64) {
        *self.shared.clock.lock().unwrap() = now;
    }

    pub fn scheduled(&self) -> Vec<ScheduledBuffer> {
        self.shared.scheduled.lock().unwrap().clone()
    }

    pub fn hard_stops(&self) -> u32 {
        *self.shared.hard_stops.lock().unwrap()
    }

    pub fn released(&self) -> bool {
        *self.shared.released.lock().unwrap()
    }
}

impl ManualSink {
    pub fn new(
        events: mpsc::UnboundedSender<SinkEvent>,
        auto_complete: bool,
    ) -> (Self, ManualSinkProbe) {
        let shared = Arc::new(ManualSinkShared::default());
        let probe = ManualSinkProbe {
            shared: Arc::clone(&shared),
        };
        (
            Self {
                shared,
                events,
                auto_complete,
            },
            probe,
        )
    }
}

impl OutputSink for ManualSink {
    fn output_clock(&self) -> f64 {
        *self.shared.clock.lock().unwrap()
    }

    fn schedule(&mut self, buffer: PcmBuffer, start_at: f64) {
        self.shared.scheduled.lock().unwrap().push(ScheduledBuffer {
            start_at,
            duration: buffer.duration_secs(),
        });
        if self.auto_complete {
            if self.events.send(SinkEvent::BufferEnded).is_err() {
                warn!("ManualSink: ended event dropped (receiver gone)");
            }
        }
    }

    fn hard_stop(&mut self) {
        *self.shared.hard_stops.lock().unwrap() += 1;
    }

    fn release(&mut self) {
        *self.shared.released.lock().unwrap() = true;
    }
}

/// Factory for [`ManualSink`]; keeps a probe for every sink it creates.
pub struct ManualSinkFactory {
    auto_complete: bool,
    probes: Mutex<Vec<ManualSinkProbe>>,
}

impl ManualSinkFactory {
    pub fn new(auto_complete: bool) -> Self {
        Self {
            auto_complete,
            probes: Mutex::new(Vec::new()),
        }
    }

    /// Probe for the most recently created sink.
    pub fn last_probe(&self) -> Option<ManualSinkProbe> {
        self.probes.lock().unwrap().last().cloned()
    }
}

impl OutputSinkFactory for ManualSinkFactory {
    fn create(&self, events: mpsc::UnboundedSender<SinkEvent>) -> SessionResult<Box<dyn OutputSink>> {
        let (sink, probe) = ManualSink::new(events, self.auto_complete);
        self.probes.lock().unwrap().push(probe);
        Ok(Box::new(sink))
    }
}
