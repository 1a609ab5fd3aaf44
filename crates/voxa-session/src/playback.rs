//! Playback scheduling for the streaming transport
//!
//! Inbound agent audio arrives as discrete chunks under network jitter; the
//! scheduler absorbs that jitter through a bounded queue and schedules each
//! decoded buffer at an exact output-clock time so playback stays gapless.
//! User speech (or an explicit wire marker) interrupts playback with a hard
//! stop, and the scheduler stays suppressed until sustained silence is
//! confirmed.
//!
//! The managed-room transport never uses this module; the provider paces
//! playback itself.

use crate::config::SessionTunables;
use crate::error::{SessionError, SessionResult};
use crate::sink::{OutputSink, PcmBuffer};
use crate::wire::AudioChunk;
use std::collections::VecDeque;
use tracing::{debug, warn};

/// Playback clock state: unset while the stream is idle, monotone while a
/// run of chunks is in progress.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct PlaybackClock {
    /// Output-clock time the next buffer should begin at.
    pub next_play_time: Option<f64>,
    /// Output-clock time the most recently scheduled buffer ends at.
    pub last_chunk_end: Option<f64>,
}

impl PlaybackClock {
    fn reset(&mut self) {
        *self = PlaybackClock::default();
    }
}

/// Whether newly decoded chunks may be scheduled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterruptState {
    /// Normal operation.
    Playing,
    /// Barge-in asserted: nothing schedules until suppression clears.
    Suppressed,
}

/// Decodes an inbound chunk payload into PCM. Decode failures drop the
/// chunk; they are never fatal to the session.
pub trait ChunkDecoder: Send + Sync {
    fn decode(&self, chunk: &AudioChunk) -> SessionResult<PcmBuffer>;
}

/// Production decoder for PCM16-LE payloads (the streaming wire format).
#[derive(Debug, Clone)]
pub struct Pcm16Decoder {
    pub sample_rate: u32,
}

impl Pcm16Decoder {
    pub fn new(sample_rate: u32) -> Self {
        Self { sample_rate }
    }
}

impl ChunkDecoder for Pcm16Decoder {
    fn decode(&self, chunk: &AudioChunk) -> SessionResult<PcmBuffer> {
        if let Some(format) = chunk.format.as_deref() {
            if !format.eq_ignore_ascii_case("pcm16") && !format.eq_ignore_ascii_case("pcm") {
                return Err(SessionError::Decode(format!(
                    "unsupported audio format tag: {}",
                    format
                )));
            }
        }
        if chunk.payload.is_empty() || chunk.payload.len() % 2 != 0 {
            return Err(SessionError::Decode(format!(
                "PCM16 payload must be a non-empty even byte count, got {}",
                chunk.payload.len()
            )));
        }
        let samples = chunk
            .payload
            .chunks_exact(2)
            .map(|pair| i16::from_le_bytes([pair[0], pair[1]]) as f32 / 32768.0)
            .collect();
        Ok(PcmBuffer {
            samples,
            sample_rate: self.sample_rate,
        })
    }
}

/// A decode request handed back to the session loop. The generation tag
/// invalidates results that finish after an interruption or teardown.
#[derive(Debug)]
pub struct DecodeJob {
    pub chunk: AudioChunk,
    pub generation: u64,
}

/// Completed decode, delivered back into the session loop.
#[derive(Debug)]
pub struct DecodeOutcome {
    pub generation: u64,
    pub result: SessionResult<PcmBuffer>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Busy {
    /// Nothing decoding or scheduled.
    Idle,
    /// A decode job is outstanding.
    Decoding,
    /// A buffer is scheduled on the sink.
    Playing,
}

/// The playback scheduler: jitter queue + playback clock + interruption
/// state, mutated only from the session's single-writer loop.
pub struct PlaybackScheduler {
    tunables: SessionTunables,
    queue: VecDeque<AudioChunk>,
    clock: PlaybackClock,
    interrupt: InterruptState,
    busy: Busy,
    generation: u64,
    sink: Box<dyn OutputSink>,
}

impl PlaybackScheduler {
    pub fn new(tunables: SessionTunables, sink: Box<dyn OutputSink>) -> Self {
        Self {
            tunables,
            queue: VecDeque::new(),
            clock: PlaybackClock::default(),
            interrupt: InterruptState::Playing,
            busy: Busy::Idle,
            generation: 0,
            sink,
        }
    }

    /// Admit a chunk from the transport. Returns a decode job when the
    /// scheduler is free to decode it now; otherwise the chunk is queued
    /// (evicting the oldest entry at capacity) or, while suppressed,
    /// discarded.
    pub fn admit(&mut self, chunk: AudioChunk) -> Option<DecodeJob> {
        if self.interrupt == InterruptState::Suppressed {
            debug!("playback suppressed; discarding inbound chunk");
            return None;
        }
        match self.busy {
            Busy::Idle => {
                self.busy = Busy::Decoding;
                Some(DecodeJob {
                    chunk,
                    generation: self.generation,
                })
            }
            Busy::Decoding | Busy::Playing => {
                if self.queue.len() >= self.tunables.jitter_queue_capacity {
                    // Freshness over completeness: drop the oldest entry.
                    self.queue.pop_front();
                    debug!("jitter queue full; evicted oldest chunk");
                }
                self.queue.push_back(chunk);
                None
            }
        }
    }

    /// Handle a finished decode. Schedules the buffer unless the result is
    /// stale (superseded generation) or suppression was asserted while the
    /// decode was in flight.
    pub fn on_decoded(&mut self, outcome: DecodeOutcome) -> Option<DecodeJob> {
        if outcome.generation != self.generation {
            debug!("stale decode result discarded");
            return None;
        }
        let pcm = match outcome.result {
            Ok(pcm) => pcm,
            Err(e) => {
                // A single bad chunk never ends the session.
                warn!("chunk decode failed, dropping: {}", e);
                self.busy = Busy::Idle;
                return self.next_decode_job();
            }
        };
        if self.interrupt == InterruptState::Suppressed {
            debug!("decode finished after interruption; chunk discarded");
            self.busy = Busy::Idle;
            return None;
        }

        let now = self.sink.output_clock();
        let start_at = match self.clock.next_play_time {
            // Stream was idle: small lead so the output engine cannot underrun.
            None => now + self.tunables.startup_buffer.as_secs_f64(),
            // Drift correction: a start time already in the past clamps
            // forward, accepting one small audible gap over unbounded lateness.
            Some(t) if t < now => {
                debug!(late_by = now - t, "drift correction clamp");
                now + self.tunables.drift_epsilon.as_secs_f64()
            }
            Some(t) => t,
        };
        let end = start_at + pcm.duration_secs();
        self.sink.schedule(pcm, start_at);
        self.clock.next_play_time = Some(end);
        self.clock.last_chunk_end = Some(end);
        self.busy = Busy::Playing;
        None
    }

    /// Handle an "ended" notification from the output engine. Returns the
    /// next decode job when a queued chunk is waiting; resets the clock when
    /// the queue has drained.
    pub fn on_buffer_ended(&mut self) -> Option<DecodeJob> {
        if self.busy != Busy::Playing {
            // Stale notification for a buffer superseded by a hard stop.
            return None;
        }
        self.busy = Busy::Idle;
        let job = self.next_decode_job();
        if job.is_none() {
            self.clock.reset();
        }
        job
    }

    /// Barge-in: clear the queue, hard-stop in-flight output, reset the
    /// clock, and suppress until sustained silence is confirmed.
    pub fn execute_immediate_interruption(&mut self) {
        let dropped = self.queue.len();
        self.queue.clear();
        self.sink.hard_stop();
        self.clock.reset();
        self.interrupt = InterruptState::Suppressed;
        self.busy = Busy::Idle;
        self.generation += 1;
        debug!(dropped, "playback interrupted");
    }

    /// Clear suppression once the detector has confirmed sustained silence
    /// (plus the configured cooldown). Also invoked on fresh session start.
    pub fn clear_suppression(&mut self) {
        if self.interrupt == InterruptState::Suppressed {
            self.interrupt = InterruptState::Playing;
            debug!("playback suppression cleared");
        }
    }

    /// Teardown: invalidate outstanding decodes, drop queued chunks, and
    /// hard-stop output, without entering suppression.
    pub fn cancel_pending(&mut self) {
        self.generation += 1;
        self.queue.clear();
        self.sink.hard_stop();
        self.clock.reset();
        self.busy = Busy::Idle;
    }

    /// Release the output engine. Final teardown step.
    pub fn release_sink(&mut self) {
        self.sink.release();
    }

    pub fn is_suppressed(&self) -> bool {
        self.interrupt == InterruptState::Suppressed
    }

    pub fn interrupt_state(&self) -> InterruptState {
        self.interrupt
    }

    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    pub fn clock(&self) -> PlaybackClock {
        self.clock
    }

    fn next_decode_job(&mut self) -> Option<DecodeJob> {
        let chunk = self.queue.pop_front()?;
        self.busy = Busy::Decoding;
        Some(DecodeJob {
            chunk,
            generation: self.generation,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::{ManualSink, ManualSinkProbe};
    use tokio::sync::mpsc;

    fn scheduler() -> (PlaybackScheduler, ManualSinkProbe) {
        // Unit tests drive completions by calling on_buffer_ended directly,
        // so the sink never emits events here.
        let (tx, _rx) = mpsc::unbounded_channel();
        let (sink, probe) = ManualSink::new(tx, false);
        (
            PlaybackScheduler::new(SessionTunables::default(), Box::new(sink)),
            probe,
        )
    }

    fn chunk_of(duration_secs: f64) -> AudioChunk {
        let samples = (duration_secs * 16000.0) as usize;
        AudioChunk {
            payload: vec![0u8; samples * 2],
            format: Some("pcm16".to_string()),
        }
    }

    fn decoded(job: DecodeJob) -> DecodeOutcome {
        let decoder = Pcm16Decoder::new(16000);
        DecodeOutcome {
            generation: job.generation,
            result: decoder.decode(&job.chunk),
        }
    }

    #[test]
    fn back_to_back_scheduling() {
        let (mut s, probe) = scheduler();

        let job = s.admit(chunk_of(0.5)).unwrap();
        assert!(s.admit(chunk_of(0.25)).is_none()); // queued
        s.on_decoded(decoded(job));

        let job = s.on_buffer_ended().unwrap();
        s.on_decoded(decoded(job));

        let scheduled = probe.scheduled();
        assert_eq!(scheduled.len(), 2);
        let startup = SessionTunables::default().startup_buffer.as_secs_f64();
        assert!((scheduled[0].start_at - startup).abs() < 1e-9);
        assert!((scheduled[1].start_at - (scheduled[0].start_at + 0.5)).abs() < 1e-9);
    }

    #[test]
    fn drift_correction_clamps_forward() {
        let (mut s, probe) = scheduler();

        let job = s.admit(chunk_of(0.5)).unwrap();
        assert!(s.admit(chunk_of(0.5)).is_none());
        s.on_decoded(decoded(job));

        // Output clock has run past the planned start of the next buffer.
        probe.set_clock(2.0);
        let job = s.on_buffer_ended().unwrap();
        s.on_decoded(decoded(job));

        let scheduled = probe.scheduled();
        let epsilon = SessionTunables::default().drift_epsilon.as_secs_f64();
        assert!((scheduled[1].start_at - (2.0 + epsilon)).abs() < 1e-9);
    }

    #[test]
    fn clock_resets_when_queue_drains() {
        let (mut s, _probe) = scheduler();
        let job = s.admit(chunk_of(0.5)).unwrap();
        s.on_decoded(decoded(job));
        assert!(s.clock().next_play_time.is_some());

        assert!(s.on_buffer_ended().is_none());
        assert_eq!(s.clock(), PlaybackClock::default());
    }

    #[test]
    fn queue_capacity_evicts_oldest() {
        let (mut s, _probe) = scheduler();
        let _decoding = s.admit(chunk_of(0.1)).unwrap();

        for i in 0..9 {
            let chunk = AudioChunk {
                payload: vec![i as u8; 2],
                format: None,
            };
            assert!(s.admit(chunk).is_none());
        }
        // Ninth push evicted the oldest queued entry.
        assert_eq!(s.queue_len(), 8);
    }

    #[test]
    fn interruption_clears_queue_and_suppresses() {
        let (mut s, probe) = scheduler();
        let job = s.admit(chunk_of(0.5)).unwrap();
        s.on_decoded(decoded(job));
        for _ in 0..3 {
            s.admit(chunk_of(0.5));
        }
        assert_eq!(s.queue_len(), 3);

        s.execute_immediate_interruption();
        assert_eq!(s.queue_len(), 0);
        assert_eq!(probe.hard_stops(), 1);
        assert!(s.is_suppressed());
        assert_eq!(s.clock(), PlaybackClock::default());

        // Nothing plays while suppressed.
        assert!(s.admit(chunk_of(0.5)).is_none());
        assert_eq!(probe.scheduled().len(), 1);

        s.clear_suppression();
        let job = s.admit(chunk_of(0.5)).unwrap();
        s.on_decoded(decoded(job));
        assert_eq!(probe.scheduled().len(), 2);
    }

    #[test]
    fn decode_finishing_after_interruption_is_discarded() {
        let (mut s, probe) = scheduler();
        let job = s.admit(chunk_of(0.5)).unwrap();

        s.execute_immediate_interruption();
        // The in-flight decode completes afterwards; generation is stale.
        assert!(s.on_decoded(decoded(job)).is_none());
        assert!(probe.scheduled().is_empty());
    }

    #[test]
    fn decode_failure_drops_chunk_and_continues() {
        let (mut s, probe) = scheduler();
        let bad = AudioChunk {
            payload: vec![1u8], // odd length
            format: None,
        };
        let job = s.admit(bad).unwrap();
        assert!(s.admit(chunk_of(0.5)).is_none());

        let next = s.on_decoded(decoded(job)).expect("continues with queue");
        s.on_decoded(decoded(next));
        assert_eq!(probe.scheduled().len(), 1);
        assert!(!s.is_suppressed());
    }

    #[test]
    fn stale_ended_notification_is_ignored() {
        let (mut s, _probe) = scheduler();
        let job = s.admit(chunk_of(0.5)).unwrap();
        s.on_decoded(decoded(job));

        s.execute_immediate_interruption();
        // The sink timer for the stopped buffer fires late.
        assert!(s.on_buffer_ended().is_none());
        assert!(s.is_suppressed());
    }

    #[test]
    fn pcm16_decoder_rejects_bad_input() {
        let decoder = Pcm16Decoder::new(16000);
        assert!(decoder
            .decode(&AudioChunk {
                payload: vec![],
                format: None
            })
            .is_err());
        assert!(decoder
            .decode(&AudioChunk {
                payload: vec![0, 0],
                format: Some("opus".to_string())
            })
            .is_err());

        let ok = decoder
            .decode(&AudioChunk {
                payload: vec![0, 0, 0xFF, 0x7F],
                format: Some("pcm16".to_string()),
            })
            .unwrap();
        assert_eq!(ok.samples.len(), 2);
        assert!((ok.samples[1] - (i16::MAX as f32 / 32768.0)).abs() < 1e-6);
    }
}
