//! Turn state machine

/// Where the controller is within a conversational turn
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TurnState {
    /// Waiting for the next inbound frame
    Idle,
    /// Feeding frames to VAD until speech starts
    Listening,
    /// Speech in progress; watching for the end of the utterance
    DetectingEndOfTurn,
    /// Waiting for the final transcript
    Transcribing,
    /// Language model is producing the reply
    Generating,
    /// First reply chunk handed to TTS
    Synthesizing,
    /// Reply audio is going out
    Speaking,
    /// Stopped by cancellation
    Cancelled,
    /// Stopped by an unrecoverable port error
    Failed,
}

impl TurnState {
    /// Position within the regular turn cycle
    const fn cycle_index(self) -> Option<u8> {
        match self {
            Self::Idle => Some(0),
            Self::Listening => Some(1),
            Self::DetectingEndOfTurn => Some(2),
            Self::Transcribing => Some(3),
            Self::Generating => Some(4),
            Self::Synthesizing => Some(5),
            Self::Speaking => Some(6),
            Self::Cancelled | Self::Failed => None,
        }
    }

    /// Whether the controller has stopped
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Cancelled | Self::Failed)
    }

    /// Whether `next` is a legal successor
    ///
    /// Within a turn the controller only moves forward through the cycle,
    /// possibly skipping stages (the greeting jumps from `Idle` straight to
    /// `Generating`), and may return to `Idle` from any stage. `Cancelled`
    /// is reachable from every live state, `Idle` included: a shutdown or a
    /// departure between turns stops the controller the same way as one
    /// mid-turn. `Failed` is reachable once a port call is involved, and
    /// leaves only towards `Idle` when the session keeps listening after a
    /// failure.
    #[must_use]
    pub const fn can_transition_to(self, next: Self) -> bool {
        match (self, next) {
            (Self::Cancelled, _) => false,
            (Self::Failed, Self::Idle) => true,
            (Self::Failed, _) => false,
            (_, Self::Cancelled) => true,
            (Self::Idle, Self::Failed) => false,
            (_, Self::Failed) => true,
            (from, Self::Idle) => !matches!(from, Self::Idle),
            (from, to) => match (from.cycle_index(), to.cycle_index()) {
                (Some(a), Some(b)) => b > a,
                _ => false,
            },
        }
    }

    /// Stable lowercase label
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Listening => "listening",
            Self::DetectingEndOfTurn => "detecting_end_of_turn",
            Self::Transcribing => "transcribing",
            Self::Generating => "generating",
            Self::Synthesizing => "synthesizing",
            Self::Speaking => "speaking",
            Self::Cancelled => "cancelled",
            Self::Failed => "failed",
        }
    }
}

impl std::fmt::Display for TurnState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
