//! TOML configuration file loading
//!
//! Supports `~/.config/cadence/config.toml` as a persistent config source.
//! All fields are optional; the file is a partial overlay on top of defaults.

use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::turn::FailurePolicy;

/// Top-level TOML configuration file schema
#[derive(Debug, Default, Deserialize)]
pub struct ConfigFile {
    /// Agent behaviour
    #[serde(default)]
    pub agent: AgentFileConfig,

    /// Turn taking
    #[serde(default)]
    pub turn: TurnFileConfig,

    /// Session lifecycle
    #[serde(default)]
    pub session: SessionFileConfig,

    /// Provider models
    #[serde(default)]
    pub models: ModelsFileConfig,

    /// API keys for external services
    #[serde(default)]
    pub api_keys: ApiKeysFileConfig,
}

/// Agent behaviour
#[derive(Debug, Default, Deserialize)]
pub struct AgentFileConfig {
    /// System prompt
    pub instructions: Option<String>,

    /// Greeting spoken on join; empty disables it
    pub greeting: Option<String>,
}

/// Turn-taking configuration
#[derive(Debug, Default, Deserialize)]
pub struct TurnFileConfig {
    /// Silence after which end-of-turn is forced
    pub max_silence_ms: Option<u64>,

    /// Silence the heuristic detector waits for after punctuation
    pub min_silence_ms: Option<u64>,

    /// Capacity of the inter-stage queues
    pub queue_capacity: Option<usize>,

    /// `continue` or `terminate` after a port failure
    pub failure_policy: Option<FailurePolicy>,
}

/// Session lifecycle configuration
#[derive(Debug, Default, Deserialize)]
pub struct SessionFileConfig {
    /// How long to wait for a participant
    pub participant_timeout_ms: Option<u64>,

    /// Connection retries after the first attempt
    pub connect_retries: Option<u32>,

    /// Base delay between connection retries
    pub connect_retry_base_ms: Option<u64>,

    /// Maximum delay between connection retries
    pub connect_retry_max_ms: Option<u64>,
}

/// Provider model selection
#[derive(Debug, Default, Deserialize)]
pub struct ModelsFileConfig {
    /// STT model (e.g. "gpt-4o-transcribe")
    pub stt_model: Option<String>,

    /// LLM model (e.g. "gpt-4o-mini")
    pub llm_model: Option<String>,

    /// TTS model (e.g. "arcana")
    pub tts_model: Option<String>,

    /// TTS voice (e.g. "astra")
    pub tts_voice: Option<String>,

    /// OpenAI-compatible API base URL
    pub openai_base_url: Option<String>,
}

/// API keys configuration
#[derive(Debug, Default, Deserialize)]
pub struct ApiKeysFileConfig {
    pub openai: Option<String>,
    pub rime: Option<String>,
}

/// Load the TOML config file from the standard path
///
/// Returns `ConfigFile::default()` if the file doesn't exist or can't be parsed.
#[must_use]
pub fn load_config_file() -> ConfigFile {
    config_file_path().map_or_else(ConfigFile::default, |path| load_config_from(&path))
}

/// Load a TOML config file from `path`
///
/// Returns `ConfigFile::default()` if the file doesn't exist or can't be parsed.
#[must_use]
pub fn load_config_from(path: &Path) -> ConfigFile {
    if !path.exists() {
        return ConfigFile::default();
    }

    match std::fs::read_to_string(path) {
        Ok(content) => match toml::from_str(&content) {
            Ok(config) => {
                tracing::info!(path = %path.display(), "loaded config file");
                config
            }
            Err(e) => {
                tracing::warn!(
                    path = %path.display(),
                    error = %e,
                    "failed to parse config file, using defaults"
                );
                ConfigFile::default()
            }
        },
        Err(e) => {
            tracing::warn!(
                path = %path.display(),
                error = %e,
                "failed to read config file"
            );
            ConfigFile::default()
        }
    }
}

/// Return the config file path: `~/.config/cadence/config.toml`
#[must_use]
pub fn config_file_path() -> Option<PathBuf> {
    directories::BaseDirs::new().map(|d| d.config_dir().join("cadence").join("config.toml"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_partial_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            r#"
[agent]
greeting = "Hi there!"

[turn]
max_silence_ms = 4000
failure_policy = "terminate"

[models]
tts_voice = "luna"
"#,
        )
        .unwrap();

        let config = load_config_from(&path);
        assert_eq!(config.agent.greeting.as_deref(), Some("Hi there!"));
        assert_eq!(config.turn.max_silence_ms, Some(4000));
        assert_eq!(config.turn.failure_policy, Some(FailurePolicy::Terminate));
        assert_eq!(config.models.tts_voice.as_deref(), Some("luna"));
        assert!(config.session.participant_timeout_ms.is_none());
    }

    #[test]
    fn malformed_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[turn\nmax_silence_ms = ").unwrap();

        let config = load_config_from(&path);
        assert!(config.turn.max_silence_ms.is_none());
    }

    #[test]
    fn missing_file_is_default() {
        let config = load_config_from(Path::new("/nonexistent/cadence.toml"));
        assert!(config.agent.instructions.is_none());
    }
}
