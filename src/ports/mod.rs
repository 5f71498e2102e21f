//! Capability ports consumed by the turn controller
//!
//! Each port is a narrow async interface over one external capability. The
//! core only sequences calls to them; concrete engines live behind these
//! traits. Streaming ports yield [`PortEvent::Data`] items followed by at most
//! one [`PortEvent::Usage`] record once the call completes, which the
//! controller turns into a [`crate::metrics::MetricEvent`].

mod noise;
mod openai;
mod rime;
mod turn;
mod vad;

use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::Serialize;

pub use noise::NoiseGate;
pub use openai::{LlmPricing, OpenAiLlm, OpenAiStt, SseDecoder};
pub use rime::{RIME_SAMPLE_RATE, RimeTts};
pub use turn::{DEFAULT_MIN_SILENCE, HeuristicTurnDetector};
pub use vad::{EnergyVad, VAD_RESOURCE, VadModel};

use crate::Result;
use crate::audio::AudioFrame;
use crate::metrics::Usage;

/// Item produced by a streaming port
#[derive(Debug, Clone, PartialEq)]
pub enum PortEvent<T> {
    /// A unit of output (fragment, token or audio frame)
    Data(T),
    /// Usage for the whole call; sent once, after the last data item
    Usage(Usage),
}

/// Lazy, finite output of a streaming port call
pub type PortStream<T> = BoxStream<'static, Result<PortEvent<T>>>;

/// Inbound audio handed to STT for one turn
pub type AudioStream = BoxStream<'static, AudioFrame>;

/// Partial or final transcript text
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TranscriptFragment {
    /// Transcribed text
    pub text: String,
    /// Whether the text is final for the turn
    pub is_final: bool,
}

impl TranscriptFragment {
    /// An interim fragment
    #[must_use]
    pub fn interim(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            is_final: false,
        }
    }

    /// A final fragment
    #[must_use]
    pub fn final_text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            is_final: true,
        }
    }
}

/// Chat message role
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// System instructions
    System,
    /// The remote participant
    User,
    /// The agent
    Assistant,
}

/// One entry of the conversation history
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChatMessage {
    /// Author role
    pub role: Role,
    /// Message text
    pub content: String,
}

/// Instructions plus the running conversation, as sent to the LLM
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConversationContext {
    messages: Vec<ChatMessage>,
}

impl ConversationContext {
    /// Start a context with system instructions
    #[must_use]
    pub fn new(instructions: &str) -> Self {
        let mut ctx = Self::default();
        if !instructions.trim().is_empty() {
            ctx.messages.push(ChatMessage {
                role: Role::System,
                content: instructions.to_string(),
            });
        }
        ctx
    }

    /// Append a user message
    pub fn push_user(&mut self, text: impl Into<String>) {
        self.push(Role::User, text.into());
    }

    /// Append an assistant message
    pub fn push_assistant(&mut self, text: impl Into<String>) {
        self.push(Role::Assistant, text.into());
    }

    /// All messages, oldest first
    #[must_use]
    pub fn messages(&self) -> &[ChatMessage] {
        &self.messages
    }

    /// Most recent message
    #[must_use]
    pub fn last(&self) -> Option<&ChatMessage> {
        self.messages.last()
    }

    /// Number of messages including instructions
    #[must_use]
    pub fn len(&self) -> usize {
        self.messages.len()
    }

    /// Whether the context holds no messages at all
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    fn push(&mut self, role: Role, content: String) {
        if content.trim().is_empty() {
            return;
        }
        self.messages.push(ChatMessage { role, content });
    }
}

/// Speech-to-text capability
#[async_trait]
pub trait SpeechToText: Send + Sync {
    /// Stable identity used to key metric events
    fn id(&self) -> &str;

    /// Transcribe one turn of audio
    ///
    /// The returned stream is finite: it ends once `audio` is exhausted and
    /// the final transcript has been produced. It is not restartable.
    async fn transcribe(&self, audio: AudioStream) -> Result<PortStream<TranscriptFragment>>;
}

/// Language model capability
#[async_trait]
pub trait LanguageModel: Send + Sync {
    /// Stable identity used to key metric events
    fn id(&self) -> &str;

    /// Generate a response to the conversation so far
    ///
    /// Dropping the returned stream must stop upstream token production.
    async fn generate(&self, context: &ConversationContext) -> Result<PortStream<String>>;
}

/// Text-to-speech capability
#[async_trait]
pub trait TextToSpeech: Send + Sync {
    /// Stable identity used to key metric events
    fn id(&self) -> &str;

    /// Synthesize `text` into a finite stream of audio frames
    async fn synthesize(&self, text: &str) -> Result<PortStream<AudioFrame>>;
}

/// Voice activity detection
///
/// Implementations may keep bounded smoothing state, which is why each
/// session owns its own detector while the underlying model is shared.
pub trait VoiceActivityDetector: Send {
    /// Whether `frame` is part of speech
    fn is_speech(&mut self, frame: &AudioFrame) -> bool;

    /// Clear smoothing state between turns
    fn reset(&mut self) {}
}

/// End-of-turn decision
pub trait TurnDetector: Send + Sync {
    /// Whether the user has finished speaking
    fn is_turn_complete(&self, transcript: &str, silence: std::time::Duration) -> bool;
}

/// Pure audio transform applied before VAD and STT
pub trait NoiseFilter: Send + Sync {
    /// Filter one frame
    fn process(&self, frame: &AudioFrame) -> AudioFrame;
}

/// The capability set wired into one turn controller
pub struct Ports {
    /// Speech-to-text
    pub stt: Arc<dyn SpeechToText>,
    /// Language model
    pub llm: Arc<dyn LanguageModel>,
    /// Text-to-speech
    pub tts: Arc<dyn TextToSpeech>,
    /// Per-session voice activity detector
    pub vad: Box<dyn VoiceActivityDetector>,
    /// End-of-turn detector
    pub turn_detector: Arc<dyn TurnDetector>,
    /// Optional input noise filter
    pub noise_filter: Option<Arc<dyn NoiseFilter>>,
}

impl std::fmt::Debug for Ports {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ports")
            .field("stt", &self.stt.id())
            .field("llm", &self.llm.id())
            .field("tts", &self.tts.id())
            .field("noise_filter", &self.noise_filter.is_some())
            .finish_non_exhaustive()
    }
}
