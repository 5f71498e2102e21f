//! Input noise suppression

use super::NoiseFilter;
use crate::audio::AudioFrame;

/// Default sample magnitude below which input is treated as noise
const NOISE_FLOOR: f32 = 0.005;

/// Zeroes samples whose magnitude falls under a fixed floor
#[derive(Debug, Clone)]
pub struct NoiseGate {
    floor: f32,
}

impl Default for NoiseGate {
    fn default() -> Self {
        Self::new(NOISE_FLOOR)
    }
}

impl NoiseGate {
    /// Create a gate with the given floor
    #[must_use]
    pub const fn new(floor: f32) -> Self {
        Self { floor }
    }
}

impl NoiseFilter for NoiseGate {
    fn process(&self, frame: &AudioFrame) -> AudioFrame {
        let floor = self.floor;
        frame.map_samples(|s| if s.abs() < floor { 0.0 } else { s })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::SAMPLE_RATE;

    #[test]
    fn gate_removes_hiss_and_keeps_speech() {
        let gate = NoiseGate::default();
        let frame = AudioFrame::new(vec![0.001, -0.002, 0.4, -0.3], SAMPLE_RATE);
        let out = gate.process(&frame);

        assert_eq!(out.samples(), &[0.0, 0.0, 0.4, -0.3]);
        assert_eq!(out.sample_rate(), SAMPLE_RATE);
        // Input is untouched
        assert!((frame.samples()[0] - 0.001).abs() < f32::EPSILON);
    }
}
