//! `OpenAI` speech-to-text and chat completion ports

use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::{self, BoxStream};
use futures::{StreamExt, TryStreamExt};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};

use super::{
    AudioStream, ChatMessage, ConversationContext, LanguageModel, PortEvent, PortStream,
    SpeechToText, TranscriptFragment,
};
use crate::audio::{AudioFrame, concat_frames, samples_to_wav};
use crate::metrics::Usage;
use crate::{Error, Result};

/// Default API base URL
const OPENAI_BASE_URL: &str = "https://api.openai.com/v1";

/// Transcription price in micro-dollars per minute of audio
const STT_MICROS_PER_MINUTE: u64 = 6_000;

/// Response from the transcription endpoint
#[derive(Deserialize)]
struct TranscriptionResponse {
    text: String,
}

/// Transcribes a turn by uploading its audio as WAV
pub struct OpenAiStt {
    client: reqwest::Client,
    api_key: Arc<SecretString>,
    model: String,
    base_url: String,
    id: String,
}

impl OpenAiStt {
    /// Create a new STT port
    ///
    /// # Errors
    ///
    /// Returns error if the API key is empty
    pub fn new(api_key: SecretString, model: impl Into<String>) -> Result<Self> {
        if api_key.expose_secret().is_empty() {
            return Err(Error::Config("OpenAI API key required for STT".to_string()));
        }

        let model = model.into();
        Ok(Self {
            client: reqwest::Client::new(),
            api_key: Arc::new(api_key),
            id: format!("openai-stt/{model}"),
            model,
            base_url: OPENAI_BASE_URL.to_string(),
        })
    }

    /// Point the port at an API-compatible server
    #[must_use]
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }
}

#[async_trait]
impl SpeechToText for OpenAiStt {
    fn id(&self) -> &str {
        &self.id
    }

    async fn transcribe(&self, audio: AudioStream) -> Result<PortStream<TranscriptFragment>> {
        let client = self.client.clone();
        let api_key = Arc::clone(&self.api_key);
        let model = self.model.clone();
        let url = format!("{}/audio/transcriptions", self.base_url);

        let call = async move {
            let frames: Vec<AudioFrame> = audio.collect().await;
            let audio_duration = frames.iter().map(AudioFrame::duration).sum();
            let (samples, sample_rate) = concat_frames(&frames);

            if samples.is_empty() {
                return Ok(vec![PortEvent::Data(TranscriptFragment::final_text(""))]);
            }

            let wav = samples_to_wav(&samples, sample_rate)?;
            tracing::debug!(audio_bytes = wav.len(), model = %model, "starting transcription");

            let form = reqwest::multipart::Form::new()
                .part(
                    "file",
                    reqwest::multipart::Part::bytes(wav)
                        .file_name("audio.wav")
                        .mime_str("audio/wav")?,
                )
                .text("model", model);

            let response = client
                .post(&url)
                .bearer_auth(api_key.expose_secret())
                .multipart(form)
                .send()
                .await
                .map_err(|e| {
                    tracing::error!(error = %e, "transcription request failed");
                    e
                })?;

            let status = response.status();
            if !status.is_success() {
                let body = response.text().await.unwrap_or_default();
                tracing::error!(status = %status, body = %body, "transcription API error");
                return Err(Error::Stt(format!("transcription API error {status}: {body}")));
            }

            let result: TranscriptionResponse = response.json().await?;
            tracing::info!(transcript = %result.text, "transcription complete");

            Ok(vec![
                PortEvent::Data(TranscriptFragment::final_text(result.text)),
                PortEvent::Usage(Usage {
                    audio_duration,
                    cost_micros: stt_cost_micros(audio_duration),
                    ..Usage::default()
                }),
            ])
        };

        Ok(stream::once(call)
            .map_ok(|events| stream::iter(events.into_iter().map(Ok)))
            .try_flatten()
            .boxed())
    }
}

fn stt_cost_micros(audio: std::time::Duration) -> u64 {
    let millis = u64::try_from(audio.as_millis()).unwrap_or(u64::MAX);
    millis.saturating_mul(STT_MICROS_PER_MINUTE) / 60_000
}

/// Token prices in micro-dollars per million tokens
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LlmPricing {
    /// Uncached prompt tokens
    pub input: u64,
    /// Cached prompt tokens
    pub cached_input: u64,
    /// Completion tokens
    pub output: u64,
}

impl Default for LlmPricing {
    fn default() -> Self {
        // gpt-4o-mini list prices
        Self {
            input: 150_000,
            cached_input: 75_000,
            output: 600_000,
        }
    }
}

impl LlmPricing {
    fn cost_micros(self, usage: &Usage) -> u64 {
        let uncached = usage.prompt_tokens.saturating_sub(usage.cached_prompt_tokens);
        (uncached * self.input
            + usage.cached_prompt_tokens * self.cached_input
            + usage.completion_tokens * self.output)
            / 1_000_000
    }
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    stream: bool,
    stream_options: StreamOptions,
}

#[derive(Serialize)]
struct StreamOptions {
    include_usage: bool,
}

#[derive(Deserialize)]
struct ChatChunk {
    #[serde(default)]
    choices: Vec<ChunkChoice>,
    #[serde(default)]
    usage: Option<ChunkUsage>,
}

#[derive(Deserialize)]
struct ChunkChoice {
    #[serde(default)]
    delta: Delta,
}

#[derive(Deserialize, Default)]
struct Delta {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Deserialize)]
struct ChunkUsage {
    prompt_tokens: u64,
    completion_tokens: u64,
    #[serde(default)]
    prompt_tokens_details: Option<PromptTokensDetails>,
}

#[derive(Deserialize)]
struct PromptTokensDetails {
    #[serde(default)]
    cached_tokens: u64,
}

/// Streams chat completions token by token
pub struct OpenAiLlm {
    client: reqwest::Client,
    api_key: SecretString,
    model: String,
    base_url: String,
    pricing: LlmPricing,
    id: String,
}

impl OpenAiLlm {
    /// Create a new LLM port
    ///
    /// # Errors
    ///
    /// Returns error if the API key is empty
    pub fn new(api_key: SecretString, model: impl Into<String>) -> Result<Self> {
        if api_key.expose_secret().is_empty() {
            return Err(Error::Config("OpenAI API key required for LLM".to_string()));
        }

        let model = model.into();
        Ok(Self {
            client: reqwest::Client::new(),
            api_key,
            id: format!("openai-llm/{model}"),
            model,
            base_url: OPENAI_BASE_URL.to_string(),
            pricing: LlmPricing::default(),
        })
    }

    /// Point the port at an API-compatible server
    #[must_use]
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    /// Override token pricing
    #[must_use]
    pub const fn with_pricing(mut self, pricing: LlmPricing) -> Self {
        self.pricing = pricing;
        self
    }
}

#[async_trait]
impl LanguageModel for OpenAiLlm {
    fn id(&self) -> &str {
        &self.id
    }

    async fn generate(&self, context: &ConversationContext) -> Result<PortStream<String>> {
        let request = ChatRequest {
            model: &self.model,
            messages: context.messages(),
            stream: true,
            stream_options: StreamOptions {
                include_usage: true,
            },
        };

        tracing::debug!(model = %self.model, messages = context.len(), "starting chat completion");

        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(self.api_key.expose_secret())
            .json(&request)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            tracing::error!(status = %status, body = %body, "chat completion API error");
            return Err(Error::Llm(format!("chat completion API error {status}: {body}")));
        }

        let body = response
            .bytes_stream()
            .map(|chunk| chunk.map(|b| b.to_vec()))
            .boxed();

        let state = CompletionStream {
            body,
            decoder: SseDecoder::default(),
            pending: VecDeque::new(),
            pricing: self.pricing,
            done: false,
        };

        Ok(stream::unfold(state, CompletionStream::next_event).boxed())
    }
}

/// Unfold state turning an SSE body into port events
struct CompletionStream {
    body: BoxStream<'static, reqwest::Result<Vec<u8>>>,
    decoder: SseDecoder,
    pending: VecDeque<PortEvent<String>>,
    pricing: LlmPricing,
    done: bool,
}

impl CompletionStream {
    async fn next_event(mut self) -> Option<(Result<PortEvent<String>>, Self)> {
        loop {
            if let Some(event) = self.pending.pop_front() {
                return Some((Ok(event), self));
            }
            if self.done {
                return None;
            }

            match self.body.next().await {
                Some(Ok(bytes)) => {
                    for data in self.decoder.feed(&bytes) {
                        if data == "[DONE]" {
                            self.done = true;
                            break;
                        }
                        match parse_chunk(&data, self.pricing) {
                            Ok(events) => self.pending.extend(events),
                            Err(e) => {
                                self.done = true;
                                return Some((Err(e), self));
                            }
                        }
                    }
                }
                Some(Err(e)) => {
                    self.done = true;
                    return Some((Err(Error::Llm(e.to_string())), self));
                }
                None => self.done = true,
            }
        }
    }
}

/// Parse one `data:` payload of a streamed completion
fn parse_chunk(data: &str, pricing: LlmPricing) -> Result<Vec<PortEvent<String>>> {
    let chunk: ChatChunk = serde_json::from_str(data)?;
    let mut events = Vec::new();

    for choice in chunk.choices {
        if let Some(content) = choice.delta.content.filter(|c| !c.is_empty()) {
            events.push(PortEvent::Data(content));
        }
    }

    if let Some(usage) = chunk.usage {
        let mut reported = Usage {
            prompt_tokens: usage.prompt_tokens,
            cached_prompt_tokens: usage
                .prompt_tokens_details
                .map_or(0, |d| d.cached_tokens),
            completion_tokens: usage.completion_tokens,
            ..Usage::default()
        };
        reported.cost_micros = pricing.cost_micros(&reported);
        events.push(PortEvent::Usage(reported));
    }

    Ok(events)
}

/// Incremental server-sent-events decoder
///
/// Buffers partial lines across body chunks and yields the payload of every
/// complete `data:` line.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: Vec<u8>,
}

impl SseDecoder {
    /// Feed a body chunk and return completed `data:` payloads
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(chunk);

        let mut payloads = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&line);
            let line = line.trim_end_matches(['\n', '\r']);

            if let Some(data) = line.strip_prefix("data:") {
                payloads.push(data.trim_start().to_string());
            }
        }
        payloads
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn sse_decoder_handles_split_lines() {
        let mut decoder = SseDecoder::default();
        assert!(decoder.feed(b"data: {\"a\"").is_empty());
        assert_eq!(decoder.feed(b":1}\r\n\r\ndata: [DONE]\n"), vec![
            "{\"a\":1}".to_string(),
            "[DONE]".to_string()
        ]);
    }

    #[test]
    fn sse_decoder_ignores_comments_and_events() {
        let mut decoder = SseDecoder::default();
        let payloads = decoder.feed(b": keep-alive\nevent: message\ndata: x\n");
        assert_eq!(payloads, vec!["x".to_string()]);
    }

    #[test]
    fn parse_chunk_extracts_tokens() {
        let data = r#"{"choices":[{"index":0,"delta":{"content":"Hel"}}]}"#;
        let events = parse_chunk(data, LlmPricing::default()).unwrap();
        assert_eq!(events, vec![PortEvent::Data("Hel".to_string())]);
    }

    #[test]
    fn parse_chunk_extracts_usage_and_cost() {
        let data = r#"{"choices":[],"usage":{"prompt_tokens":1000,"completion_tokens":100,"prompt_tokens_details":{"cached_tokens":200}}}"#;
        let events = parse_chunk(data, LlmPricing::default()).unwrap();

        let PortEvent::Usage(usage) = &events[0] else {
            panic!("expected usage event");
        };
        assert_eq!(usage.prompt_tokens, 1000);
        assert_eq!(usage.cached_prompt_tokens, 200);
        assert_eq!(usage.completion_tokens, 100);
        // 800 * 0.15 + 200 * 0.075 + 100 * 0.6 micro-dollars
        assert_eq!(usage.cost_micros, 120 + 15 + 60);
    }

    #[test]
    fn parse_chunk_rejects_garbage() {
        assert!(parse_chunk("not json", LlmPricing::default()).is_err());
    }

    #[test]
    fn stt_cost_scales_with_audio() {
        assert_eq!(stt_cost_micros(Duration::from_secs(60)), 6_000);
        assert_eq!(stt_cost_micros(Duration::from_millis(1500)), 150);
    }

    #[test]
    fn empty_api_key_is_rejected() {
        let err = OpenAiLlm::new(SecretString::from(String::new()), "gpt-4o-mini").err();
        assert!(matches!(err, Some(Error::Config(_))));
        assert!(OpenAiStt::new(SecretString::from("sk-test".to_string()), "gpt-4o-transcribe").is_ok());
    }

    #[tokio::test]
    async fn silent_turn_skips_upload() {
        let stt = OpenAiStt::new(SecretString::from("sk-test".to_string()), "gpt-4o-transcribe")
            .unwrap()
            .with_base_url("http://127.0.0.1:9");
        let events: Vec<_> = stt
            .transcribe(stream::empty().boxed())
            .await
            .unwrap()
            .collect()
            .await;

        assert_eq!(events.len(), 1);
        assert!(matches!(
            &events[0],
            Ok(PortEvent::Data(TranscriptFragment { text, is_final: true })) if text.is_empty()
        ));
    }
}
