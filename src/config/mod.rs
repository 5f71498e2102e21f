//! Configuration management for the voice agent
//!
//! Values resolve in order: environment variable, then the TOML file, then
//! the built-in default.

pub mod file;

use std::time::Duration;

use secrecy::SecretString;

use crate::ports::DEFAULT_MIN_SILENCE;
use crate::session::{DEFAULT_PARTICIPANT_TIMEOUT, RetryPolicy, SessionConfig};
use crate::turn::{DEFAULT_MAX_SILENCE, DEFAULT_QUEUE_CAPACITY, FailurePolicy, TurnConfig};
use crate::{Error, Result};

use self::file::ConfigFile;

/// System prompt used when none is configured
pub const DEFAULT_INSTRUCTIONS: &str = "You are a helpful and friendly voice assistant. \
    Keep your responses concise and conversational.";

/// Greeting used when none is configured
pub const DEFAULT_GREETING: &str = "Hello! How can I help you today?";

/// Default STT model
pub const DEFAULT_STT_MODEL: &str = "gpt-4o-transcribe";

/// Default LLM model
pub const DEFAULT_LLM_MODEL: &str = "gpt-4o-mini";

/// Default TTS model
pub const DEFAULT_TTS_MODEL: &str = "arcana";

/// Default TTS voice
pub const DEFAULT_TTS_VOICE: &str = "astra";

/// Voice agent configuration
#[derive(Debug)]
pub struct AgentConfig {
    /// System prompt for the language model
    pub instructions: String,

    /// Spoken once a participant joins
    pub greeting: Option<String>,

    /// Silence after which end-of-turn is forced
    pub max_silence: Duration,

    /// Silence the heuristic turn detector waits for
    pub min_silence: Duration,

    /// Capacity of each inter-stage queue
    pub queue_capacity: usize,

    /// Reaction to unrecoverable port errors
    pub failure_policy: FailurePolicy,

    /// How long to wait for a participant
    pub participant_timeout: Duration,

    /// Retry policy for the room connection
    pub connect_retry: RetryPolicy,

    /// Provider models
    pub models: ModelConfig,

    /// API keys
    pub api_keys: ApiKeys,
}

/// Provider model selection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelConfig {
    /// STT model
    pub stt_model: String,

    /// LLM model
    pub llm_model: String,

    /// TTS model
    pub tts_model: String,

    /// TTS voice
    pub tts_voice: String,

    /// OpenAI-compatible API base URL override
    pub openai_base_url: Option<String>,
}

/// API keys for external services
#[derive(Debug, Default)]
pub struct ApiKeys {
    /// `OpenAI` (STT and LLM)
    pub openai: Option<SecretString>,

    /// Rime (TTS)
    pub rime: Option<SecretString>,
}

impl AgentConfig {
    /// Load configuration from environment and `~/.config/cadence/config.toml`
    ///
    /// # Errors
    ///
    /// Returns error if a value is present but invalid
    pub fn load() -> Result<Self> {
        Self::from_file_config(file::load_config_file())
    }

    /// Resolve configuration from a parsed file plus the environment
    ///
    /// # Errors
    ///
    /// Returns error if a value is present but invalid
    pub fn from_file_config(fc: ConfigFile) -> Result<Self> {
        Self::resolve(fc, |key| std::env::var(key).ok())
    }

    /// Resolve configuration from a parsed file plus an environment lookup
    ///
    /// # Errors
    ///
    /// Returns error if a value is present but invalid
    pub fn resolve(fc: ConfigFile, env: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let instructions = env("CADENCE_INSTRUCTIONS")
            .or(fc.agent.instructions)
            .unwrap_or_else(|| DEFAULT_INSTRUCTIONS.to_string());

        let greeting = env("CADENCE_GREETING")
            .or(fc.agent.greeting)
            .unwrap_or_else(|| DEFAULT_GREETING.to_string());
        let greeting = (!greeting.trim().is_empty()).then_some(greeting);

        let max_silence = parse_env_ms(&env, "CADENCE_MAX_SILENCE_MS")?
            .or(fc.turn.max_silence_ms.map(Duration::from_millis))
            .unwrap_or(DEFAULT_MAX_SILENCE);

        let min_silence = parse_env_ms(&env, "CADENCE_MIN_SILENCE_MS")?
            .or(fc.turn.min_silence_ms.map(Duration::from_millis))
            .unwrap_or(DEFAULT_MIN_SILENCE);

        if max_silence < min_silence {
            return Err(Error::Config(format!(
                "max silence ({}ms) must not be shorter than min silence ({}ms)",
                max_silence.as_millis(),
                min_silence.as_millis()
            )));
        }

        let queue_capacity = parse_env::<usize>(&env, "CADENCE_QUEUE_CAPACITY")?
            .or(fc.turn.queue_capacity)
            .unwrap_or(DEFAULT_QUEUE_CAPACITY);
        if queue_capacity == 0 {
            return Err(Error::Config("queue capacity must be at least 1".to_string()));
        }

        let failure_policy = match env("CADENCE_FAILURE_POLICY") {
            Some(value) => parse_failure_policy(&value)?,
            None => fc.turn.failure_policy.unwrap_or_default(),
        };

        let participant_timeout = parse_env_ms(&env, "CADENCE_PARTICIPANT_TIMEOUT_MS")?
            .or(fc.session.participant_timeout_ms.map(Duration::from_millis))
            .unwrap_or(DEFAULT_PARTICIPANT_TIMEOUT);

        let default_retry = RetryPolicy::default();
        let connect_retry = RetryPolicy {
            max_retries: parse_env::<u32>(&env, "CADENCE_CONNECT_RETRIES")?
                .or(fc.session.connect_retries)
                .unwrap_or(default_retry.max_retries),
            base_delay: fc
                .session
                .connect_retry_base_ms
                .map_or(default_retry.base_delay, Duration::from_millis),
            max_delay: fc
                .session
                .connect_retry_max_ms
                .map_or(default_retry.max_delay, Duration::from_millis),
        };

        let models = ModelConfig {
            stt_model: env("CADENCE_STT_MODEL")
                .or(fc.models.stt_model)
                .unwrap_or_else(|| DEFAULT_STT_MODEL.to_string()),
            llm_model: env("CADENCE_LLM_MODEL")
                .or(fc.models.llm_model)
                .unwrap_or_else(|| DEFAULT_LLM_MODEL.to_string()),
            tts_model: env("CADENCE_TTS_MODEL")
                .or(fc.models.tts_model)
                .unwrap_or_else(|| DEFAULT_TTS_MODEL.to_string()),
            tts_voice: env("CADENCE_TTS_VOICE")
                .or(fc.models.tts_voice)
                .unwrap_or_else(|| DEFAULT_TTS_VOICE.to_string()),
            openai_base_url: env("OPENAI_BASE_URL").or(fc.models.openai_base_url),
        };

        let api_keys = ApiKeys {
            openai: env("OPENAI_API_KEY")
                .or(fc.api_keys.openai)
                .filter(|k| !k.is_empty())
                .map(SecretString::from),
            rime: env("RIME_API_KEY")
                .or(fc.api_keys.rime)
                .filter(|k| !k.is_empty())
                .map(SecretString::from),
        };

        Ok(Self {
            instructions,
            greeting,
            max_silence,
            min_silence,
            queue_capacity,
            failure_policy,
            participant_timeout,
            connect_retry,
            models,
            api_keys,
        })
    }

    /// Turn controller settings
    #[must_use]
    pub fn turn_config(&self) -> TurnConfig {
        TurnConfig {
            max_silence: self.max_silence,
            queue_capacity: self.queue_capacity,
            failure_policy: self.failure_policy,
        }
    }

    /// Session lifecycle settings
    #[must_use]
    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            instructions: self.instructions.clone(),
            greeting: self.greeting.clone(),
            participant_timeout: self.participant_timeout,
            connect_retry: self.connect_retry.clone(),
            turn: self.turn_config(),
        }
    }
}

fn parse_env<T: std::str::FromStr>(
    env: &impl Fn(&str) -> Option<String>,
    key: &str,
) -> Result<Option<T>> {
    env(key)
        .map(|value| {
            value
                .trim()
                .parse()
                .map_err(|_| Error::Config(format!("invalid value for {key}: {value}")))
        })
        .transpose()
}

fn parse_env_ms(env: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<Duration>> {
    Ok(parse_env::<u64>(env, key)?.map(Duration::from_millis))
}

fn parse_failure_policy(value: &str) -> Result<FailurePolicy> {
    match value.trim().to_lowercase().as_str() {
        "continue" | "soft" => Ok(FailurePolicy::Continue),
        "terminate" | "hard" => Ok(FailurePolicy::Terminate),
        other => Err(Error::Config(format!(
            "invalid failure policy '{other}', expected continue or terminate"
        ))),
    }
}
