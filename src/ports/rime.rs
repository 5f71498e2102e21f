//! Rime text-to-speech port
//!
//! Requests raw 16-bit PCM so audio can be framed and played while the body
//! is still streaming.

use std::collections::VecDeque;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use futures::stream::{self, BoxStream};
use secrecy::{ExposeSecret, SecretString};
use serde::Serialize;

use super::{PortEvent, PortStream, TextToSpeech};
use crate::audio::{AudioFrame, FRAME_DURATION, PcmDecoder, samples_for};
use crate::metrics::Usage;
use crate::{Error, Result};

/// Rime synthesis endpoint
const RIME_URL: &str = "https://users.rime.ai/v1/rime-tts";

/// Output sample rate requested from Rime
pub const RIME_SAMPLE_RATE: u32 = 24000;

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct RimeRequest<'a> {
    speaker: &'a str,
    text: &'a str,
    model_id: &'a str,
    sampling_rate: u32,
}

/// Streams synthesized speech from Rime
pub struct RimeTts {
    client: reqwest::Client,
    api_key: SecretString,
    model: String,
    speaker: String,
    url: String,
    sample_rate: u32,
    micros_per_thousand_chars: u64,
    id: String,
}

impl RimeTts {
    /// Create a new TTS port
    ///
    /// # Errors
    ///
    /// Returns error if the API key is empty
    pub fn new(
        api_key: SecretString,
        model: impl Into<String>,
        speaker: impl Into<String>,
    ) -> Result<Self> {
        if api_key.expose_secret().is_empty() {
            return Err(Error::Config("Rime API key required for TTS".to_string()));
        }

        let model = model.into();
        let speaker = speaker.into();
        Ok(Self {
            client: reqwest::Client::new(),
            api_key,
            id: format!("rime-tts/{model}/{speaker}"),
            model,
            speaker,
            url: RIME_URL.to_string(),
            sample_rate: RIME_SAMPLE_RATE,
            micros_per_thousand_chars: 0,
        })
    }

    /// Point the port at a different endpoint
    #[must_use]
    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = url.into();
        self
    }

    /// Character price used for cost estimates
    #[must_use]
    pub const fn with_price(mut self, micros_per_thousand_chars: u64) -> Self {
        self.micros_per_thousand_chars = micros_per_thousand_chars;
        self
    }
}

#[async_trait]
impl TextToSpeech for RimeTts {
    fn id(&self) -> &str {
        &self.id
    }

    async fn synthesize(&self, text: &str) -> Result<PortStream<AudioFrame>> {
        let request = RimeRequest {
            speaker: &self.speaker,
            text,
            model_id: &self.model,
            sampling_rate: self.sample_rate,
        };

        tracing::debug!(chars = text.chars().count(), speaker = %self.speaker, "starting synthesis");

        let response = self
            .client
            .post(&self.url)
            .bearer_auth(self.api_key.expose_secret())
            .header("Accept", "audio/pcm")
            .json(&request)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            tracing::error!(status = %status, body = %body, "rime TTS error");
            return Err(Error::Tts(format!("Rime TTS error {status}: {body}")));
        }

        let characters = text.chars().count() as u64;
        let state = SynthesisStream {
            body: response
                .bytes_stream()
                .map(|chunk| chunk.map(|b| b.to_vec()))
                .boxed(),
            framer: Framer::new(self.sample_rate),
            pending: VecDeque::new(),
            characters,
            cost_micros: characters * self.micros_per_thousand_chars / 1000,
            finished: false,
        };

        Ok(stream::unfold(state, SynthesisStream::next_event).boxed())
    }
}

/// Unfold state turning a PCM body into frames plus a trailing usage record
struct SynthesisStream {
    body: BoxStream<'static, reqwest::Result<Vec<u8>>>,
    framer: Framer,
    pending: VecDeque<PortEvent<AudioFrame>>,
    characters: u64,
    cost_micros: u64,
    finished: bool,
}

impl SynthesisStream {
    async fn next_event(mut self) -> Option<(Result<PortEvent<AudioFrame>>, Self)> {
        loop {
            if let Some(event) = self.pending.pop_front() {
                return Some((Ok(event), self));
            }
            if self.finished {
                return None;
            }

            match self.body.next().await {
                Some(Ok(bytes)) => {
                    let frames = self.framer.push(&bytes);
                    self.pending.extend(frames.into_iter().map(PortEvent::Data));
                }
                Some(Err(e)) => {
                    self.finished = true;
                    return Some((Err(Error::Tts(e.to_string())), self));
                }
                None => {
                    self.finished = true;
                    if let Some(tail) = self.framer.flush() {
                        self.pending.push_back(PortEvent::Data(tail));
                    }
                    self.pending.push_back(PortEvent::Usage(Usage {
                        characters: self.characters,
                        audio_duration: self.framer.produced(),
                        cost_micros: self.cost_micros,
                        ..Usage::default()
                    }));
                }
            }
        }
    }
}

/// Regroups streamed PCM into fixed-length frames
#[derive(Debug)]
struct Framer {
    decoder: PcmDecoder,
    buffer: Vec<f32>,
    frame_len: usize,
    sample_rate: u32,
    produced: Duration,
}

impl Framer {
    fn new(sample_rate: u32) -> Self {
        Self {
            decoder: PcmDecoder::default(),
            buffer: Vec::new(),
            frame_len: samples_for(FRAME_DURATION, sample_rate).max(1),
            sample_rate,
            produced: Duration::ZERO,
        }
    }

    fn push(&mut self, bytes: &[u8]) -> Vec<AudioFrame> {
        self.buffer.extend(self.decoder.feed(bytes));

        let mut frames = Vec::new();
        while self.buffer.len() >= self.frame_len {
            let rest = self.buffer.split_off(self.frame_len);
            let samples = std::mem::replace(&mut self.buffer, rest);
            frames.push(self.emit(samples));
        }
        frames
    }

    fn flush(&mut self) -> Option<AudioFrame> {
        if self.buffer.is_empty() {
            return None;
        }
        let samples = std::mem::take(&mut self.buffer);
        Some(self.emit(samples))
    }

    fn emit(&mut self, samples: Vec<f32>) -> AudioFrame {
        let frame = AudioFrame::new(samples, self.sample_rate);
        self.produced += frame.duration();
        frame
    }

    const fn produced(&self) -> Duration {
        self.produced
    }
}
