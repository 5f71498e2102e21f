//! Error types for the voice session core

use thiserror::Error;

/// Result type alias for session core operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while servicing a voice job
///
/// Cancellation is not an error: an intentional stop is reported as an
/// outcome.
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// A shared resource failed to load during prewarm
    #[error("failed to load shared resource {name}: {reason}")]
    ResourceLoad {
        /// Resource key
        name: String,
        /// Loader failure description
        reason: String,
    },

    /// Operation not allowed in the current state
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// Job was dispatched before the worker finished prewarming
    #[error("worker is not prewarmed")]
    NotPrewarmed,

    /// Room connection error
    #[error("connection error: {0}")]
    Connection(String),

    /// Transport error after the room is connected
    #[error("transport error: {0}")]
    Transport(String),

    /// Speech-to-text error
    #[error("STT error: {0}")]
    Stt(String),

    /// Language model error
    #[error("LLM error: {0}")]
    Llm(String),

    /// Text-to-speech error
    #[error("TTS error: {0}")]
    Tts(String),

    /// Shutdown callback failure
    #[error("shutdown callback {name} failed: {reason}")]
    Callback {
        /// Callback label
        name: String,
        /// Failure description
        reason: String,
    },

    /// IO error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// HTTP error
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// TOML parsing error
    #[error("toml error: {0}")]
    Toml(#[from] toml::de::Error),

    /// WAV encoding error
    #[error("wav error: {0}")]
    Wav(#[from] hound::Error),
}

impl Error {
    /// Whether the failure is worth another attempt
    ///
    /// Only connection-level failures qualify; port errors reaching the core
    /// have already exhausted the port's own retry policy.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Connection(_) | Self::Transport(_) => true,
            Self::Http(e) => e.is_timeout() || e.is_connect(),
            Self::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionRefused
                    | std::io::ErrorKind::TimedOut
            ),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connection_errors_are_retryable() {
        assert!(Error::Connection("refused".to_string()).is_retryable());
        assert!(
            Error::Io(std::io::Error::from(std::io::ErrorKind::TimedOut)).is_retryable()
        );
    }

    #[test]
    fn port_errors_are_not_retryable() {
        assert!(!Error::Llm("context length exceeded".to_string()).is_retryable());
        assert!(!Error::Tts("voice not found".to_string()).is_retryable());
        assert!(!Error::Config("missing key".to_string()).is_retryable());
    }

    #[test]
    fn resource_load_message_names_resource() {
        let err = Error::ResourceLoad {
            name: "vad".to_string(),
            reason: "model file missing".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "failed to load shared resource vad: model file missing"
        );
    }
}
