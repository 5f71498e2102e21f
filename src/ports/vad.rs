//! Energy-based voice activity detection
//!
//! The model (thresholds) is immutable and shared across jobs through the
//! resource cache; each session wraps it in an [`EnergyVad`] that carries the
//! onset and hangover smoothing state.

use std::sync::Arc;
use std::time::Duration;

use super::VoiceActivityDetector;
use crate::audio::AudioFrame;

/// Minimum audio energy threshold to consider speech
const ENERGY_THRESHOLD: f32 = 0.03;

/// Voiced audio required before speech is reported
const MIN_SPEECH: Duration = Duration::from_millis(60);

/// Unvoiced audio tolerated before speech is considered over
const HANGOVER: Duration = Duration::from_millis(160);

/// Resource name under which the shared model is cached
pub const VAD_RESOURCE: &str = "vad";

/// Shared, stateless VAD parameters
#[derive(Debug, Clone, PartialEq)]
pub struct VadModel {
    /// RMS energy above which a frame counts as voiced
    pub threshold: f32,
    /// Voiced run length required for onset
    pub min_speech: Duration,
    /// Unvoiced run length tolerated inside speech
    pub hangover: Duration,
}

impl Default for VadModel {
    fn default() -> Self {
        Self {
            threshold: ENERGY_THRESHOLD,
            min_speech: MIN_SPEECH,
            hangover: HANGOVER,
        }
    }
}

impl VadModel {
    /// Load the default model
    #[must_use]
    pub fn load() -> Self {
        tracing::debug!(threshold = ENERGY_THRESHOLD, "energy vad model initialized");
        Self::default()
    }
}

/// Per-session detector over a shared [`VadModel`]
#[derive(Debug)]
pub struct EnergyVad {
    model: Arc<VadModel>,
    speaking: bool,
    voiced: Duration,
    unvoiced: Duration,
}

impl EnergyVad {
    /// Wrap a shared model
    #[must_use]
    pub const fn new(model: Arc<VadModel>) -> Self {
        Self {
            model,
            speaking: false,
            voiced: Duration::ZERO,
            unvoiced: Duration::ZERO,
        }
    }
}

impl VoiceActivityDetector for EnergyVad {
    fn is_speech(&mut self, frame: &AudioFrame) -> bool {
        let energy = frame.energy();
        let duration = frame.duration();

        if energy > self.model.threshold {
            self.voiced += duration;
            self.unvoiced = Duration::ZERO;
            if !self.speaking && self.voiced >= self.model.min_speech {
                tracing::trace!(energy, "speech onset");
                self.speaking = true;
            }
        } else {
            self.voiced = Duration::ZERO;
            if self.speaking {
                self.unvoiced += duration;
                if self.unvoiced > self.model.hangover {
                    tracing::trace!(energy, "speech offset");
                    self.speaking = false;
                    self.unvoiced = Duration::ZERO;
                }
            }
        }

        self.speaking
    }

    fn reset(&mut self) {
        self.speaking = false;
        self.voiced = Duration::ZERO;
        self.unvoiced = Duration::ZERO;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::SAMPLE_RATE;

    fn loud(ms: u64) -> AudioFrame {
        let n = crate::audio::samples_for(Duration::from_millis(ms), SAMPLE_RATE);
        AudioFrame::new(vec![0.3; n], SAMPLE_RATE)
    }

    fn quiet(ms: u64) -> AudioFrame {
        AudioFrame::silence(Duration::from_millis(ms), SAMPLE_RATE)
    }

    #[test]
    fn short_blip_is_not_speech() {
        let mut vad = EnergyVad::new(Arc::new(VadModel::default()));
        assert!(!vad.is_speech(&loud(20)));
        assert!(!vad.is_speech(&quiet(20)));
        assert!(!vad.is_speech(&loud(20)));
    }

    #[test]
    fn sustained_speech_triggers_onset() {
        let mut vad = EnergyVad::new(Arc::new(VadModel::default()));
        assert!(!vad.is_speech(&loud(20)));
        assert!(!vad.is_speech(&loud(20)));
        assert!(vad.is_speech(&loud(20)));
    }

    #[test]
    fn hangover_bridges_short_pauses() {
        let mut vad = EnergyVad::new(Arc::new(VadModel::default()));
        assert!(vad.is_speech(&loud(100)));

        // 100ms pause stays inside the 160ms hangover
        assert!(vad.is_speech(&quiet(100)));
        // Pause grows past the hangover
        assert!(!vad.is_speech(&quiet(100)));
    }

    #[test]
    fn reset_clears_state() {
        let mut vad = EnergyVad::new(Arc::new(VadModel::default()));
        assert!(vad.is_speech(&loud(100)));
        vad.reset();
        assert!(!vad.is_speech(&quiet(20)));
    }
}
