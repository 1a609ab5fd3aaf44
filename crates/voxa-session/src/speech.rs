//! Speech activity detection with hysteresis
//!
//! Computes short-window RMS energy per capture frame (~every 100ms) and
//! declares speaking/not-speaking transitions only after a sustained run of
//! frames, so a single transient spike or dropout never toggles the state.
//! Runs against the local capture stream regardless of transport; only
//! streaming sessions wire the speaking edge to playback interruption.

use crate::config::SessionTunables;

/// Current detector state: the speaking flag plus the consecutive-frame
/// counters that drive the hysteresis.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct SpeechState {
    pub is_speaking: bool,
    pub consecutive_above: u32,
    pub consecutive_below: u32,
}

/// Edge emitted when the speaking state flips.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpeechEdge {
    /// Sustained speech confirmed; barge-in point for streaming sessions.
    SpeakingStarted,
    /// Sustained silence confirmed.
    SpeakingStopped,
}

/// Energy-based speech activity detector.
#[derive(Debug, Clone)]
pub struct SpeechDetector {
    upper_rms: f32,
    lower_rms: f32,
    start_frames: u32,
    stop_frames: u32,
    state: SpeechState,
}

impl SpeechDetector {
    pub fn new(tunables: &SessionTunables) -> Self {
        Self {
            upper_rms: tunables.speech_upper_rms,
            lower_rms: tunables.speech_lower_rms,
            start_frames: tunables.speech_start_frames,
            stop_frames: tunables.speech_stop_frames,
            state: SpeechState::default(),
        }
    }

    /// Feed one analysis frame; returns an edge when the speaking state
    /// transitions.
    pub fn observe_frame(&mut self, samples: &[f32]) -> Option<SpeechEdge> {
        let level = rms(samples);

        if level >= self.upper_rms {
            self.state.consecutive_above += 1;
            self.state.consecutive_below = 0;
        } else if level < self.lower_rms {
            self.state.consecutive_below += 1;
            self.state.consecutive_above = 0;
        } else {
            // Between the thresholds: breaks both runs without toggling.
            self.state.consecutive_above = 0;
            self.state.consecutive_below = 0;
        }

        if !self.state.is_speaking && self.state.consecutive_above >= self.start_frames {
            self.state.is_speaking = true;
            return Some(SpeechEdge::SpeakingStarted);
        }
        if self.state.is_speaking && self.state.consecutive_below >= self.stop_frames {
            self.state.is_speaking = false;
            return Some(SpeechEdge::SpeakingStopped);
        }
        None
    }

    pub fn is_speaking(&self) -> bool {
        self.state.is_speaking
    }

    pub fn state(&self) -> SpeechState {
        self.state
    }

    /// Reset to silence. Used on fresh session start.
    pub fn reset(&mut self) {
        self.state = SpeechState::default();
    }
}

/// RMS energy of a frame of f32 samples.
pub fn rms(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum_squares: f32 = samples.iter().map(|s| s * s).sum();
    (sum_squares / samples.len() as f32).sqrt()
}
