//! The stock voice assistant
//!
//! `OpenAI` transcription and chat, Rime speech, energy VAD shared across
//! jobs, the heuristic turn detector and a noise gate on the input.

use std::sync::Arc;

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};

use crate::config::AgentConfig;
use crate::dispatcher::{Entrypoint, JobContext};
use crate::ports::{
    EnergyVad, HeuristicTurnDetector, NoiseGate, OpenAiLlm, OpenAiStt, Ports, RimeTts,
    VAD_RESOURCE, VadModel,
};
use crate::resources::SharedResourceCache;
use crate::session::SessionConfig;
use crate::{Error, Result};

/// Entrypoint wiring the default providers from [`AgentConfig`]
#[derive(Debug)]
pub struct VoiceAssistant {
    config: AgentConfig,
}

impl VoiceAssistant {
    /// Create the assistant
    #[must_use]
    pub const fn new(config: AgentConfig) -> Self {
        Self { config }
    }

    /// Resolved configuration
    #[must_use]
    pub const fn config(&self) -> &AgentConfig {
        &self.config
    }
}

#[async_trait]
impl Entrypoint for VoiceAssistant {
    async fn prewarm(&self, resources: &SharedResourceCache) -> Result<()> {
        resources
            .load_as(VAD_RESOURCE, || async { Ok(VadModel::load()) })
            .await?;
        Ok(())
    }

    async fn ports(&self, ctx: &JobContext) -> Result<Ports> {
        let vad = ctx
            .resources
            .get_as::<VadModel>(VAD_RESOURCE)
            .ok_or(Error::NotPrewarmed)?;

        let keys = &self.config.api_keys;
        let openai_key = keys
            .openai
            .as_ref()
            .ok_or_else(|| Error::Config("OPENAI_API_KEY is not set".to_string()))?;
        let rime_key = keys
            .rime
            .as_ref()
            .ok_or_else(|| Error::Config("RIME_API_KEY is not set".to_string()))?;

        let models = &self.config.models;
        let mut stt = OpenAiStt::new(copy_secret(openai_key), &models.stt_model)?;
        let mut llm = OpenAiLlm::new(copy_secret(openai_key), &models.llm_model)?;
        if let Some(base_url) = &models.openai_base_url {
            stt = stt.with_base_url(base_url);
            llm = llm.with_base_url(base_url);
        }
        let tts = RimeTts::new(copy_secret(rime_key), &models.tts_model, &models.tts_voice)?;

        tracing::debug!(
            job_id = %ctx.job_id,
            stt = %models.stt_model,
            llm = %models.llm_model,
            tts = %models.tts_model,
            voice = %models.tts_voice,
            "ports ready"
        );

        Ok(Ports {
            stt: Arc::new(stt),
            llm: Arc::new(llm),
            tts: Arc::new(tts),
            vad: Box::new(EnergyVad::new(vad)),
            turn_detector: Arc::new(HeuristicTurnDetector::new(self.config.min_silence)),
            noise_filter: Some(Arc::new(NoiseGate::default())),
        })
    }

    fn session_config(&self, _ctx: &JobContext) -> SessionConfig {
        self.config.session_config()
    }
}

/// Each port owns its own copy of a key
fn copy_secret(secret: &SecretString) -> SecretString {
    SecretString::from(secret.expose_secret().to_owned())
}
