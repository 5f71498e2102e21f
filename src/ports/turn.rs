//! Heuristic end-of-turn detection
//!
//! Combines trailing silence with a punctuation check on the interim
//! transcript: a sentence that looks finished ends the turn after a short
//! pause, anything else needs twice as long.

use std::time::Duration;

use super::TurnDetector;

/// Default pause after a finished-looking sentence
pub const DEFAULT_MIN_SILENCE: Duration = Duration::from_millis(500);

/// Silence plus transcript heuristic
#[derive(Debug, Clone)]
pub struct HeuristicTurnDetector {
    min_silence: Duration,
}

impl Default for HeuristicTurnDetector {
    fn default() -> Self {
        Self::new(DEFAULT_MIN_SILENCE)
    }
}

impl HeuristicTurnDetector {
    /// Create a detector with the given short-pause threshold
    #[must_use]
    pub const fn new(min_silence: Duration) -> Self {
        Self { min_silence }
    }

    fn looks_finished(transcript: &str) -> bool {
        transcript
            .trim_end()
            .chars()
            .last()
            .is_some_and(|c| matches!(c, '.' | '!' | '?' | '。' | '！' | '？' | '…'))
    }
}

impl TurnDetector for HeuristicTurnDetector {
    fn is_turn_complete(&self, transcript: &str, silence: Duration) -> bool {
        if silence < self.min_silence {
            return false;
        }
        Self::looks_finished(transcript) || silence >= self.min_silence * 2
    }
}
