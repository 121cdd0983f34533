//! Energy-threshold voice activity detection
//!
//! Classifies periodic metering levels (dBFS) into speech and silence and decides
//! when an utterance has ended. The thresholds are empirically tuned against hardware
//! metering rather than raw PCM; they are coarse and can misfire on poor microphones.

use std::time::Duration;

use tokio::time::Instant;

/// Level above which a sample counts as speech
pub const SPEAK_THRESHOLD_DB: f32 = -55.0;

/// Level below which a sample counts as silence once speech was heard
pub const SILENCE_THRESHOLD_DB: f32 = -60.0;

/// Contiguous silence required after speech before the utterance ends
pub const SILENCE_HOLD: Duration = Duration::from_millis(2000);

/// Cadence at which the capture controller samples the meter
pub const METER_INTERVAL: Duration = Duration::from_millis(100);

/// What the detector concluded from one level sample
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VadDecision {
    /// Keep recording
    Continue,
    /// Silence has held long enough after speech; stop and transcribe
    UtteranceEnded,
}

/// Per-session silence detector
#[derive(Debug, Default, Clone)]
pub struct SilenceDetector {
    speech_detected: bool,
    silence_started_at: Option<Instant>,
    ended: bool,
}

impl SilenceDetector {
    /// Create a detector with no speech heard yet
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one level sample taken at `now`
    ///
    /// Returns `UtteranceEnded` at most once per detector; later samples are ignored.
    pub fn observe(&mut self, level_db: f32, now: Instant) -> VadDecision {
        if self.ended {
            return VadDecision::Continue;
        }

        if level_db > SPEAK_THRESHOLD_DB {
            if !self.speech_detected {
                tracing::trace!(level_db, "speech detected");
            }
            self.speech_detected = true;
            self.silence_started_at = None;
            return VadDecision::Continue;
        }

        if !self.speech_detected || level_db >= SILENCE_THRESHOLD_DB {
            return VadDecision::Continue;
        }

        match self.silence_started_at {
            None => {
                tracing::trace!(level_db, "silence started");
                self.silence_started_at = Some(now);
            }
            Some(started) if now.duration_since(started) > SILENCE_HOLD => {
                tracing::debug!(
                    silence = ?now.duration_since(started),
                    "silence hold elapsed"
                );
                self.ended = true;
                return VadDecision::UtteranceEnded;
            }
            Some(_) => {}
        }

        VadDecision::Continue
    }

    /// Whether any sample crossed the speech threshold
    #[must_use]
    pub const fn speech_detected(&self) -> bool {
        self.speech_detected
    }

    /// When the current silence run began, if one is in progress
    #[must_use]
    pub const fn silence_started_at(&self) -> Option<Instant> {
        self.silence_started_at
    }
}

/// Convert f32 samples to a dBFS level, floored at -160 dB
#[allow(clippy::cast_precision_loss)]
#[must_use]
pub fn level_db(samples: &[f32]) -> f32 {
    const FLOOR_DB: f32 = -160.0;

    if samples.is_empty() {
        return FLOOR_DB;
    }

    let sum_squares: f32 = samples.iter().map(|s| s * s).sum();
    let rms = (sum_squares / samples.len() as f32).sqrt();
    if rms <= 0.0 {
        return FLOOR_DB;
    }

    (20.0 * rms.log10()).max(FLOOR_DB)
}
