//! Named tunables for the session engine
//!
//! Every timing/size constant the engine relies on lives here rather than as
//! an embedded literal, so deployments can tune them independently.

use std::time::Duration;

/// Tunable parameters shared across the session engine.
#[derive(Debug, Clone)]
pub struct SessionTunables {
    /// Maximum number of inbound chunks held while one is scheduled.
    /// Enqueue beyond this evicts the oldest entry (bounded latency, not
    /// bounded completeness).
    pub jitter_queue_capacity: usize,

    /// Consecutive above-threshold frames required to enter "speaking".
    pub speech_start_frames: u32,

    /// Consecutive below-threshold frames required to leave "speaking".
    pub speech_stop_frames: u32,

    /// RMS level a frame must exceed to count toward the speaking run.
    pub speech_upper_rms: f32,

    /// RMS level a frame must stay under to count toward the silence run.
    pub speech_lower_rms: f32,

    /// Lead time added when scheduling the first chunk of an idle stream,
    /// so the output engine does not underrun (default 20ms).
    pub startup_buffer: Duration,

    /// Forward clamp applied when a scheduled start time has already passed
    /// the output clock (default 10ms).
    pub drift_epsilon: Duration,

    /// How long after sustained silence is confirmed before interruption
    /// suppression clears. Untuned default; treat as a knob, not an
    /// invariant.
    pub suppression_cooldown: Duration,
}

impl Default for SessionTunables {
    fn default() -> Self {
        Self {
            jitter_queue_capacity: 8,
            speech_start_frames: 5,
            speech_stop_frames: 8,
            speech_upper_rms: 0.02,
            speech_lower_rms: 0.01,
            startup_buffer: Duration::from_millis(20),
            drift_epsilon: Duration::from_millis(10),
            suppression_cooldown: Duration::from_millis(500),
        }
    }
}
