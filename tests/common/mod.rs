//! Shared test utilities
//!
//! Scripted ports that never touch the network, plus frame helpers.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::{StreamExt, stream};

use cadence_voice::audio::{AudioFrame, FRAME_DURATION, SAMPLE_RATE};
use cadence_voice::ports::{
    AudioStream, ConversationContext, LanguageModel, PortEvent, PortStream, Ports, SpeechToText,
    TextToSpeech, TranscriptFragment, TurnDetector, VoiceActivityDetector,
};
use cadence_voice::{Error, Result, Usage};

/// `ms` of loud audio, split into 20ms frames
#[must_use]
pub fn speech(ms: u64) -> Vec<AudioFrame> {
    frames(ms, 0.5)
}

/// `ms` of digital silence, split into 20ms frames
#[must_use]
pub fn silence(ms: u64) -> Vec<AudioFrame> {
    frames(ms, 0.0)
}

fn frames(ms: u64, level: f32) -> Vec<AudioFrame> {
    let count = ms / u64::try_from(FRAME_DURATION.as_millis()).unwrap();
    let per_frame = (SAMPLE_RATE / 50) as usize;
    (0..count)
        .map(|_| AudioFrame::new(vec![level; per_frame], SAMPLE_RATE))
        .collect()
}

/// STT that drains the turn's audio, then returns the next scripted transcript
#[derive(Default)]
pub struct ScriptedStt {
    transcripts: Mutex<VecDeque<String>>,
    calls: AtomicUsize,
    frames: Arc<AtomicUsize>,
    fail: bool,
}

impl ScriptedStt {
    pub fn new(transcripts: &[&str]) -> Self {
        Self {
            transcripts: Mutex::new(transcripts.iter().map(ToString::to_string).collect()),
            ..Self::default()
        }
    }

    /// Every call fails after reading the audio
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Frames received across all calls
    pub fn frames(&self) -> usize {
        self.frames.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SpeechToText for ScriptedStt {
    fn id(&self) -> &str {
        "scripted-stt"
    }

    async fn transcribe(&self, audio: AudioStream) -> Result<PortStream<TranscriptFragment>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let text = self
            .transcripts
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_default();
        let fail = self.fail;
        let counter = Arc::clone(&self.frames);

        let events = stream::once(async move {
            let heard: Vec<AudioFrame> = audio.collect().await;
            counter.fetch_add(heard.len(), Ordering::SeqCst);
            if fail {
                return vec![Err(Error::Stt("provider unavailable".to_string()))];
            }
            let audio_duration = heard.iter().map(AudioFrame::duration).sum();
            vec![
                Ok(PortEvent::Data(TranscriptFragment::final_text(text))),
                Ok(PortEvent::Usage(Usage {
                    audio_duration,
                    cost_micros: 10,
                    ..Usage::default()
                })),
            ]
        });
        Ok(events.flat_map(stream::iter).boxed())
    }
}

/// LLM that streams a fixed reply word by word
pub struct ScriptedLlm {
    reply: String,
    stall: bool,
    calls: AtomicUsize,
    contexts: Mutex<Vec<ConversationContext>>,
}

impl ScriptedLlm {
    pub fn new(reply: &str) -> Self {
        Self {
            reply: reply.to_string(),
            stall: false,
            calls: AtomicUsize::new(0),
            contexts: Mutex::new(Vec::new()),
        }
    }

    /// Never produces a token; the call only ends by being dropped
    pub fn stalled() -> Self {
        Self {
            stall: true,
            ..Self::new("")
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Contexts the model was asked to continue
    pub fn contexts(&self) -> Vec<ConversationContext> {
        self.contexts.lock().unwrap().clone()
    }
}

#[async_trait]
impl LanguageModel for ScriptedLlm {
    fn id(&self) -> &str {
        "scripted-llm"
    }

    async fn generate(&self, context: &ConversationContext) -> Result<PortStream<String>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.contexts.lock().unwrap().push(context.clone());
        if self.stall {
            return Ok(stream::pending().boxed());
        }

        let words: Vec<String> = self
            .reply
            .split_inclusive(' ')
            .map(ToString::to_string)
            .collect();
        let usage = Usage {
            prompt_tokens: 20,
            completion_tokens: words.len() as u64,
            cost_micros: 5,
            ..Usage::default()
        };
        let events = words
            .into_iter()
            .map(|w| Ok(PortEvent::Data(w)))
            .chain(std::iter::once(Ok(PortEvent::Usage(usage))));
        Ok(stream::iter(events.collect::<Vec<_>>()).boxed())
    }
}

/// TTS producing one 20ms frame per sentence, tagged with the sentence length
#[derive(Default)]
pub struct ScriptedTts {
    sentences: Mutex<Vec<String>>,
    fail: bool,
    stall: bool,
}

impl ScriptedTts {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every call is rejected
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    /// Emits the first frame of each sentence, then hangs
    pub fn stalling() -> Self {
        Self {
            stall: true,
            ..Self::default()
        }
    }

    /// Sentences synthesized so far, in order
    pub fn sentences(&self) -> Vec<String> {
        self.sentences.lock().unwrap().clone()
    }
}

#[async_trait]
impl TextToSpeech for ScriptedTts {
    fn id(&self) -> &str {
        "scripted-tts"
    }

    #[allow(clippy::cast_precision_loss)]
    async fn synthesize(&self, text: &str) -> Result<PortStream<AudioFrame>> {
        if self.fail {
            return Err(Error::Tts("voice not found".to_string()));
        }
        self.sentences.lock().unwrap().push(text.to_string());
        let per_frame = (SAMPLE_RATE / 50) as usize;
        let frame = AudioFrame::new(vec![text.len() as f32; per_frame], SAMPLE_RATE);
        if self.stall {
            return Ok(stream::iter(vec![Ok(PortEvent::Data(frame))])
                .chain(stream::pending())
                .boxed());
        }
        let usage = Usage {
            characters: text.chars().count() as u64,
            audio_duration: FRAME_DURATION,
            cost_micros: 1,
            ..Usage::default()
        };
        Ok(stream::iter(vec![Ok(PortEvent::Data(frame)), Ok(PortEvent::Usage(usage))]).boxed())
    }
}

/// Any frame with energy counts as speech; clones share the call count
#[derive(Clone, Default)]
pub struct LevelVad {
    calls: Arc<AtomicUsize>,
}

impl LevelVad {
    /// Frames classified so far
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl VoiceActivityDetector for LevelVad {
    fn is_speech(&mut self, frame: &AudioFrame) -> bool {
        self.calls.fetch_add(1, Ordering::SeqCst);
        frame.energy() > 0.1
    }
}

/// Never ends a turn on its own; only the silence cap does
pub struct NeverDone;

impl TurnDetector for NeverDone {
    fn is_turn_complete(&self, _transcript: &str, _silence: Duration) -> bool {
        false
    }
}

/// Ends the turn after `after` of silence
pub struct AfterSilence(pub Duration);

impl TurnDetector for AfterSilence {
    fn is_turn_complete(&self, _transcript: &str, silence: Duration) -> bool {
        silence >= self.0
    }
}

/// Assemble ports around the scripted fakes
pub fn ports(
    stt: &Arc<ScriptedStt>,
    llm: &Arc<ScriptedLlm>,
    tts: &Arc<ScriptedTts>,
    detector: impl TurnDetector + 'static,
) -> Ports {
    Ports {
        stt: Arc::clone(stt) as Arc<dyn SpeechToText>,
        llm: Arc::clone(llm) as Arc<dyn LanguageModel>,
        tts: Arc::clone(tts) as Arc<dyn TextToSpeech>,
        vad: Box::new(LevelVad::default()),
        turn_detector: Arc::new(detector),
        noise_filter: None,
    }
}
