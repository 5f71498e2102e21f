//! Streaming reply pipeline
//!
//! Reply text flows producer → sentence queue → synthesizer → event queue.
//! Both queues are bounded FIFO channels, so synthesis of the first sentence
//! overlaps generation of the rest while audio still leaves in text order.

use std::sync::Arc;
use std::time::Instant;

use futures::StreamExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::chunker::SentenceChunker;
use crate::audio::AudioFrame;
use crate::metrics::{MetricEvent, Stage};
use crate::ports::{ConversationContext, LanguageModel, PortEvent, TextToSpeech};
use crate::Error;

/// Where the reply text comes from
pub(crate) enum ReplySource {
    /// Ask the language model
    Generate(ConversationContext),
    /// Speak fixed text (the greeting)
    Fixed(String),
}

/// Progress reported to the controller
pub(crate) enum PipelineEvent {
    /// A sentence was handed to TTS
    Synthesizing,
    /// Synthesized audio, in playback order
    Audio(AudioFrame),
    /// A completed port call
    Metric(MetricEvent),
    /// Full reply text once generation ends
    Reply(String),
    /// A port failed; the reply is abandoned
    Failed(Error),
    /// Every sentence has been synthesized
    Finished,
}

/// Spawned tasks of one reply, aborted when dropped
pub(crate) struct ReplyTasks(Vec<JoinHandle<()>>);

impl Drop for ReplyTasks {
    fn drop(&mut self) {
        for handle in &self.0 {
            handle.abort();
        }
    }
}

/// Start producing and synthesizing a reply
pub(crate) fn spawn_reply(
    source: ReplySource,
    llm: Arc<dyn LanguageModel>,
    tts: Arc<dyn TextToSpeech>,
    turn: u64,
    capacity: usize,
) -> (mpsc::Receiver<PipelineEvent>, ReplyTasks) {
    let capacity = capacity.max(1);
    let (event_tx, event_rx) = mpsc::channel(capacity);
    let (sentence_tx, sentence_rx) = mpsc::channel(capacity);

    let producer = match source {
        ReplySource::Generate(context) => tokio::spawn(generate(
            llm,
            context,
            turn,
            sentence_tx,
            event_tx.clone(),
        )),
        ReplySource::Fixed(text) => tokio::spawn(speak_fixed(text, sentence_tx, event_tx.clone())),
    };
    let synthesizer = tokio::spawn(synthesize(tts, turn, sentence_rx, event_tx));

    (event_rx, ReplyTasks(vec![producer, synthesizer]))
}

async fn speak_fixed(
    text: String,
    sentences: mpsc::Sender<String>,
    events: mpsc::Sender<PipelineEvent>,
) {
    let mut chunker = SentenceChunker::new();
    let mut chunks = chunker.push(&text);
    chunks.extend(chunker.finish());

    for chunk in chunks {
        if sentences.send(chunk).await.is_err() {
            return;
        }
    }
    let _ = events.send(PipelineEvent::Reply(text)).await;
}

async fn generate(
    llm: Arc<dyn LanguageModel>,
    context: ConversationContext,
    turn: u64,
    sentences: mpsc::Sender<String>,
    events: mpsc::Sender<PipelineEvent>,
) {
    let started = Instant::now();

    let mut stream = match llm.generate(&context).await {
        Ok(stream) => stream,
        Err(e) => {
            let _ = events.send(PipelineEvent::Failed(e)).await;
            return;
        }
    };

    let mut chunker = SentenceChunker::new();
    let mut reply = String::new();
    let mut usage = None;

    while let Some(item) = stream.next().await {
        match item {
            Ok(PortEvent::Data(token)) => {
                reply.push_str(&token);
                for sentence in chunker.push(&token) {
                    if sentences.send(sentence).await.is_err() {
                        return;
                    }
                }
            }
            Ok(PortEvent::Usage(reported)) => usage = Some(reported),
            Err(e) => {
                let _ = events.send(PipelineEvent::Failed(e)).await;
                return;
            }
        }
    }

    if let Some(rest) = chunker.finish() {
        if sentences.send(rest).await.is_err() {
            return;
        }
    }

    tracing::debug!(turn, chars = reply.len(), "generation complete");

    if let Some(usage) = usage {
        let event = MetricEvent::new(Stage::Llm, llm.id(), turn, usage, started.elapsed());
        if events.send(PipelineEvent::Metric(event)).await.is_err() {
            return;
        }
    }
    let _ = events.send(PipelineEvent::Reply(reply)).await;
}

async fn synthesize(
    tts: Arc<dyn TextToSpeech>,
    turn: u64,
    mut sentences: mpsc::Receiver<String>,
    events: mpsc::Sender<PipelineEvent>,
) {
    while let Some(sentence) = sentences.recv().await {
        if events.send(PipelineEvent::Synthesizing).await.is_err() {
            return;
        }

        let started = Instant::now();
        let mut stream = match tts.synthesize(&sentence).await {
            Ok(stream) => stream,
            Err(e) => {
                let _ = events.send(PipelineEvent::Failed(e)).await;
                return;
            }
        };

        let mut usage = None;
        while let Some(item) = stream.next().await {
            match item {
                Ok(PortEvent::Data(frame)) => {
                    if events.send(PipelineEvent::Audio(frame)).await.is_err() {
                        return;
                    }
                }
                Ok(PortEvent::Usage(reported)) => usage = Some(reported),
                Err(e) => {
                    let _ = events.send(PipelineEvent::Failed(e)).await;
                    return;
                }
            }
        }

        if let Some(usage) = usage {
            let event = MetricEvent::new(Stage::Tts, tts.id(), turn, usage, started.elapsed());
            if events.send(PipelineEvent::Metric(event)).await.is_err() {
                return;
            }
        }
    }

    let _ = events.send(PipelineEvent::Finished).await;
}
