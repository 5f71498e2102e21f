//! Cadence - Session orchestration core for real-time voice agents
//!
//! This library drives one voice conversation per room:
//! - Turn taking (VAD, end-of-turn detection, half duplex with no barge-in)
//! - Streaming STT → LLM → TTS pipeline with bounded queues
//! - Per-session usage metrics and shutdown callbacks
//! - Worker-level job dispatch with prewarmed shared resources
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │                   JobDispatcher                      │
//! │      prewarm  │  SharedResourceCache  │  jobs        │
//! └────────────────────┬────────────────────────────────┘
//!                      │ one task per job
//! ┌────────────────────▼────────────────────────────────┐
//! │              SessionLifecycleManager                 │
//! │   connect │ participant │ greeting │ drain │ report │
//! └────────────────────┬────────────────────────────────┘
//!                      │
//! ┌────────────────────▼────────────────────────────────┐
//! │                  TurnController                      │
//! │   VAD  │  end of turn  │  STT  │  LLM  │  TTS        │
//! └─────────────────────────────────────────────────────┘
//! ```

pub mod assistant;
pub mod audio;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod metrics;
pub mod ports;
pub mod resources;
pub mod session;
pub mod transport;
pub mod turn;

pub use assistant::VoiceAssistant;
pub use audio::AudioFrame;
pub use config::AgentConfig;
pub use dispatcher::{Entrypoint, Job, JobContext, JobDispatcher};
pub use error::{Error, Result};
pub use metrics::{MetricEvent, MetricsAggregator, Stage, Usage, UsageSummary};
pub use ports::{
    AudioStream, ConversationContext, LanguageModel, PortEvent, Ports, SpeechToText,
    TextToSpeech, TurnDetector, VoiceActivityDetector,
};
pub use resources::SharedResourceCache;
pub use session::{EndReason, SessionConfig, SessionLifecycleManager, SessionReport, SessionState};
pub use transport::{AudioOutput, LocalRoom, Participant, RoomTransport};
pub use turn::{TurnConfig, TurnController, TurnEvent, TurnState};
