//! Conversational turn orchestration
//!
//! A [`TurnController`] owns one conversation. It feeds inbound frames
//! through the noise filter and VAD, asks the turn detector when the user is
//! done (forcing the decision after a maximum silence), transcribes the
//! utterance, then streams the reply through the language model and TTS into
//! the audio output.

mod chunker;
mod controller;
mod pipeline;
mod state;

pub use chunker::SentenceChunker;
pub use controller::{
    ControllerExit, DEFAULT_MAX_SILENCE, DEFAULT_QUEUE_CAPACITY, FailurePolicy, TurnConfig,
    TurnController, TurnEvent, TurnOutcome,
};
pub use state::TurnState;
