//! The per-session turn controller

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::StreamExt;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;

use super::pipeline::{PipelineEvent, ReplySource, spawn_reply};
use super::state::TurnState;
use crate::audio::AudioFrame;
use crate::metrics::{MetricEvent, MetricsAggregator, Stage};
use crate::ports::{AudioStream, ConversationContext, PortEvent, Ports, TranscriptFragment};
use crate::transport::AudioOutput;
use crate::Error;

/// Default forced end-of-turn silence
pub const DEFAULT_MAX_SILENCE: Duration = Duration::from_millis(2500);

/// Default capacity of the inter-stage queues
pub const DEFAULT_QUEUE_CAPACITY: usize = 32;

/// Audio kept from before speech onset so STT hears the first syllable
const PRE_ROLL: Duration = Duration::from_millis(300);

/// Buffered turn events per subscriber
const EVENT_CAPACITY: usize = 256;

/// What happens after an unrecoverable port error
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailurePolicy {
    /// Abandon the turn and keep listening
    #[default]
    Continue,
    /// Stop the controller and end the session
    Terminate,
}

/// Controller tuning
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TurnConfig {
    /// Silence after which end-of-turn is forced
    pub max_silence: Duration,
    /// Capacity of each bounded inter-stage queue
    pub queue_capacity: usize,
    /// Reaction to unrecoverable port errors
    pub failure_policy: FailurePolicy,
}

impl Default for TurnConfig {
    fn default() -> Self {
        Self {
            max_silence: DEFAULT_MAX_SILENCE,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            failure_policy: FailurePolicy::default(),
        }
    }
}

/// Observable controller activity
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TurnEvent {
    /// State transition
    StateChanged {
        /// Turn number
        turn: u64,
        /// Previous state
        from: TurnState,
        /// New state
        to: TurnState,
    },
    /// Final transcript of a user turn
    Transcript {
        /// Turn number
        turn: u64,
        /// Transcribed text
        text: String,
    },
    /// Text the agent spoke
    Reply {
        /// Turn number
        turn: u64,
        /// Reply text
        text: String,
    },
    /// A turn was abandoned after a port error
    Failed {
        /// Turn number
        turn: u64,
        /// Error description
        error: String,
    },
}

/// Result of a single turn
#[derive(Debug)]
pub enum TurnOutcome {
    /// Reply fully played out (or nothing to reply to)
    Completed,
    /// Cancellation stopped the turn
    Cancelled,
    /// A port failed; the turn was abandoned
    Failed(Error),
}

/// Why [`TurnController::run`] returned
#[derive(Debug)]
pub enum ControllerExit {
    /// Inbound audio ended between turns
    InputClosed,
    /// Cancellation stopped the controller, or the input ended mid-turn
    Cancelled,
    /// A port failed under [`FailurePolicy::Terminate`]
    Failed(Error),
}

/// Messages from the transcription task
enum SttEvent {
    Fragment(TranscriptFragment),
    Failed(Error),
    Finished(Option<MetricEvent>),
}

/// How listening ended
enum Capture {
    /// User finished a non-empty utterance
    Transcript(String),
    /// Nothing to answer
    Nothing,
    /// Turn ended early
    Stopped(TurnOutcome),
}

/// An in-flight transcription call
struct Transcription {
    audio: Option<mpsc::Sender<AudioFrame>>,
    events: mpsc::Receiver<SttEvent>,
    task: JoinHandle<()>,
    finals: Vec<String>,
    interim: String,
    finished: bool,
}

impl Transcription {
    fn transcript_so_far(&self) -> String {
        let mut text = self.finals.join(" ");
        if !self.interim.is_empty() {
            if !text.is_empty() {
                text.push(' ');
            }
            text.push_str(&self.interim);
        }
        text
    }

    fn final_transcript(&self) -> String {
        let text = if self.finals.is_empty() {
            self.interim.clone()
        } else {
            self.finals.join(" ")
        };
        text.trim().to_string()
    }

    fn apply(&mut self, fragment: TranscriptFragment) {
        if fragment.is_final {
            self.interim.clear();
            let text = fragment.text.trim();
            if !text.is_empty() {
                self.finals.push(text.to_string());
            }
        } else {
            self.interim = fragment.text.trim().to_string();
        }
    }
}

impl Drop for Transcription {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Sequences ports through listen, transcribe, generate, synthesize and speak
///
/// One controller serves one session. Audio is fed through [`Self::run`];
/// cancellation arrives through the token from [`Self::cancel_token`] and
/// reaches every port call of the current turn.
pub struct TurnController {
    ports: Ports,
    output: Arc<dyn AudioOutput>,
    metrics: MetricsAggregator,
    config: TurnConfig,
    context: ConversationContext,
    state: TurnState,
    turn: u64,
    cancel: CancellationToken,
    events: broadcast::Sender<TurnEvent>,
    input_closed: bool,
}

impl TurnController {
    /// Create a controller in `Idle`
    #[must_use]
    pub fn new(
        ports: Ports,
        output: Arc<dyn AudioOutput>,
        metrics: MetricsAggregator,
        context: ConversationContext,
        config: TurnConfig,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            ports,
            output,
            metrics,
            config,
            context,
            state: TurnState::Idle,
            turn: 0,
            cancel: CancellationToken::new(),
            events,
            input_closed: false,
        }
    }

    /// Use `token` for cancellation (typically a child of the session token)
    #[must_use]
    pub fn with_cancel_token(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// Current state
    #[must_use]
    pub const fn state(&self) -> TurnState {
        self.state
    }

    /// Number of user turns started so far
    #[must_use]
    pub const fn turn(&self) -> u64 {
        self.turn
    }

    /// Conversation history including instructions
    #[must_use]
    pub const fn context(&self) -> &ConversationContext {
        &self.context
    }

    /// Receive state transitions and turn results
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<TurnEvent> {
        self.events.subscribe()
    }

    /// Token that cancels this controller
    #[must_use]
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Cancel in-flight work; cancelling twice is a no-op
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Speak `text` without listening first (the greeting)
    ///
    /// Uses the same streaming and ordering path as a generated reply.
    pub async fn say(&mut self, text: &str) -> TurnOutcome {
        match self.state {
            TurnState::Idle => {}
            TurnState::Cancelled => return TurnOutcome::Cancelled,
            state => {
                return TurnOutcome::Failed(Error::InvalidState(format!(
                    "cannot speak while {state}"
                )));
            }
        }
        if self.cancel.is_cancelled() {
            return self.cancelled();
        }

        tracing::info!(text, "speaking fixed reply");
        self.respond(ReplySource::Fixed(text.to_string()), None).await
    }

    /// Serve turns until input ends, cancellation or a terminating failure
    pub async fn run(&mut self, mut input: AudioStream) -> ControllerExit {
        loop {
            match self.state {
                TurnState::Cancelled => return ControllerExit::Cancelled,
                TurnState::Failed => {
                    return ControllerExit::Failed(Error::InvalidState(
                        "turn controller has failed".to_string(),
                    ));
                }
                _ => {}
            }
            if self.input_closed {
                tracing::debug!(turn = self.turn, "input closed");
                return ControllerExit::InputClosed;
            }

            let outcome = match self.capture(&mut input).await {
                Capture::Transcript(text) => {
                    let mut context = self.context.clone();
                    context.push_user(text.clone());
                    self.respond(ReplySource::Generate(context), Some(text)).await
                }
                Capture::Nothing => continue,
                Capture::Stopped(outcome) => outcome,
            };

            match outcome {
                TurnOutcome::Completed => {}
                TurnOutcome::Cancelled => return ControllerExit::Cancelled,
                TurnOutcome::Failed(e) => {
                    if self.config.failure_policy == FailurePolicy::Terminate {
                        return ControllerExit::Failed(e);
                    }
                }
            }
        }
    }

    /// Listen for one utterance and transcribe it
    async fn capture(&mut self, input: &mut AudioStream) -> Capture {
        // Idle: wait for the first frame
        let first = tokio::select! {
            biased;
            () = self.cancel.cancelled() => return Capture::Stopped(self.cancelled()),
            frame = input.next() => frame,
        };
        let Some(first) = first else {
            self.input_closed = true;
            return Capture::Nothing;
        };

        self.transition(TurnState::Listening);
        let mut pre_roll = PreRoll::default();
        let mut pending = Some(first);

        // Listening: wait for speech onset
        let onset = loop {
            let frame = match pending.take() {
                Some(frame) => frame,
                None => {
                    let next = tokio::select! {
                        biased;
                        () = self.cancel.cancelled() => return Capture::Stopped(self.cancelled()),
                        frame = input.next() => frame,
                    };
                    let Some(frame) = next else {
                        self.input_closed = true;
                        self.transition(TurnState::Idle);
                        return Capture::Nothing;
                    };
                    frame
                }
            };

            let frame = self.filter(&frame);
            if self.ports.vad.is_speech(&frame) {
                break frame;
            }
            pre_roll.push(frame);
        };

        self.turn += 1;
        self.transition(TurnState::DetectingEndOfTurn);
        tracing::debug!(turn = self.turn, "speech started");

        let mut stt = self.start_transcription();
        for frame in pre_roll.drain().chain(std::iter::once(onset)) {
            forward(&stt, frame, &self.cancel).await;
        }

        // DetectingEndOfTurn: track silence until the detector or the cap fires
        let mut silence = Duration::ZERO;
        loop {
            tokio::select! {
                biased;
                () = self.cancel.cancelled() => return Capture::Stopped(self.cancelled()),
                event = stt.events.recv(), if !stt.finished => {
                    match event {
                        Some(SttEvent::Fragment(fragment)) => stt.apply(fragment),
                        Some(SttEvent::Failed(e)) => return Capture::Stopped(self.fail(e)),
                        Some(SttEvent::Finished(metric)) => {
                            stt.finished = true;
                            if let Some(metric) = metric {
                                self.metrics.collect(&metric);
                            }
                            break;
                        }
                        None => return Capture::Stopped(self.fail(transcription_lost())),
                    }
                }
                frame = input.next() => {
                    // the participant left; nobody is waiting for an answer
                    let Some(frame) = frame else {
                        tracing::info!(turn = self.turn, "input ended mid-utterance");
                        self.input_closed = true;
                        return Capture::Stopped(self.cancelled());
                    };

                    let frame = self.filter(&frame);
                    let speaking = self.ports.vad.is_speech(&frame);
                    let frame_duration = frame.duration();
                    forward(&stt, frame, &self.cancel).await;

                    if speaking {
                        silence = Duration::ZERO;
                        continue;
                    }

                    silence += frame_duration;
                    if silence >= self.config.max_silence {
                        tracing::debug!(
                            turn = self.turn,
                            silence_ms = duration_ms(silence),
                            "forcing end of turn"
                        );
                        break;
                    }
                    if self.ports.turn_detector.is_turn_complete(&stt.transcript_so_far(), silence) {
                        tracing::debug!(
                            turn = self.turn,
                            silence_ms = duration_ms(silence),
                            "end of turn detected"
                        );
                        break;
                    }
                }
            }
        }

        // Transcribing: close the audio and wait for the final transcript
        self.transition(TurnState::Transcribing);
        stt.audio = None;

        while !stt.finished {
            let event = tokio::select! {
                biased;
                () = self.cancel.cancelled() => return Capture::Stopped(self.cancelled()),
                event = stt.events.recv() => event,
            };
            match event {
                Some(SttEvent::Fragment(fragment)) => stt.apply(fragment),
                Some(SttEvent::Failed(e)) => return Capture::Stopped(self.fail(e)),
                Some(SttEvent::Finished(metric)) => {
                    stt.finished = true;
                    if let Some(metric) = metric {
                        self.metrics.collect(&metric);
                    }
                }
                None => return Capture::Stopped(self.fail(transcription_lost())),
            }
        }

        self.ports.vad.reset();
        let transcript = stt.final_transcript();
        if transcript.is_empty() {
            tracing::debug!(turn = self.turn, "empty transcript, nothing to answer");
            self.transition(TurnState::Idle);
            return Capture::Nothing;
        }

        tracing::info!(turn = self.turn, transcript = %transcript, "user turn transcribed");
        let _ = self.events.send(TurnEvent::Transcript {
            turn: self.turn,
            text: transcript.clone(),
        });
        Capture::Transcript(transcript)
    }

    /// Produce, synthesize and play a reply
    async fn respond(&mut self, source: ReplySource, user_text: Option<String>) -> TurnOutcome {
        self.transition(TurnState::Generating);

        let (mut events, _tasks) = spawn_reply(
            source,
            Arc::clone(&self.ports.llm),
            Arc::clone(&self.ports.tts),
            self.turn,
            self.config.queue_capacity,
        );
        let output = Arc::clone(&self.output);
        let mut reply = String::new();

        loop {
            let event = tokio::select! {
                biased;
                () = self.cancel.cancelled() => {
                    output.clear();
                    return self.cancelled();
                }
                event = events.recv() => event,
            };

            match event {
                Some(PipelineEvent::Synthesizing) => {
                    if self.state == TurnState::Generating {
                        self.transition(TurnState::Synthesizing);
                    }
                }
                Some(PipelineEvent::Audio(frame)) => {
                    if self.state != TurnState::Speaking {
                        self.transition(TurnState::Speaking);
                    }
                    let captured = tokio::select! {
                        biased;
                        () = self.cancel.cancelled() => {
                            output.clear();
                            return self.cancelled();
                        }
                        captured = output.capture_frame(frame) => captured,
                    };
                    if let Err(e) = captured {
                        return self.fail(e);
                    }
                }
                Some(PipelineEvent::Metric(metric)) => self.metrics.collect(&metric),
                Some(PipelineEvent::Reply(text)) => reply = text,
                Some(PipelineEvent::Failed(e)) => {
                    output.clear();
                    return self.fail(e);
                }
                Some(PipelineEvent::Finished) => break,
                None => return self.fail(Error::Tts("reply pipeline stopped unexpectedly".to_string())),
            }
        }

        if self.state == TurnState::Speaking {
            let played = tokio::select! {
                biased;
                () = self.cancel.cancelled() => {
                    output.clear();
                    return self.cancelled();
                }
                played = output.wait_for_playout() => played,
            };
            if let Err(e) = played {
                return self.fail(e);
            }
        }

        if let Some(text) = user_text {
            self.context.push_user(text);
        }
        self.context.push_assistant(reply.clone());

        tracing::info!(turn = self.turn, reply = %reply, "turn complete");
        let _ = self.events.send(TurnEvent::Reply {
            turn: self.turn,
            text: reply,
        });
        self.transition(TurnState::Idle);
        TurnOutcome::Completed
    }

    fn start_transcription(&self) -> Transcription {
        let capacity = self.config.queue_capacity.max(1);
        let (audio_tx, audio_rx) = mpsc::channel(capacity);
        let (event_tx, event_rx) = mpsc::channel(capacity);

        let stt = Arc::clone(&self.ports.stt);
        let turn = self.turn;
        let task = tokio::spawn(async move {
            let started = Instant::now();
            let audio = ReceiverStream::new(audio_rx).boxed();

            let mut stream = match stt.transcribe(audio).await {
                Ok(stream) => stream,
                Err(e) => {
                    let _ = event_tx.send(SttEvent::Failed(e)).await;
                    return;
                }
            };

            let mut usage = None;
            while let Some(item) = stream.next().await {
                match item {
                    Ok(PortEvent::Data(fragment)) => {
                        if event_tx.send(SttEvent::Fragment(fragment)).await.is_err() {
                            return;
                        }
                    }
                    Ok(PortEvent::Usage(reported)) => usage = Some(reported),
                    Err(e) => {
                        let _ = event_tx.send(SttEvent::Failed(e)).await;
                        return;
                    }
                }
            }

            let metric = usage
                .map(|usage| MetricEvent::new(Stage::Stt, stt.id(), turn, usage, started.elapsed()));
            let _ = event_tx.send(SttEvent::Finished(metric)).await;
        });

        Transcription {
            audio: Some(audio_tx),
            events: event_rx,
            task,
            finals: Vec::new(),
            interim: String::new(),
            finished: false,
        }
    }

    fn filter(&self, frame: &AudioFrame) -> AudioFrame {
        match &self.ports.noise_filter {
            Some(filter) => filter.process(frame),
            None => frame.clone(),
        }
    }

    fn transition(&mut self, to: TurnState) {
        let from = self.state;
        if from == to {
            return;
        }
        let legal = from.can_transition_to(to);
        if !legal {
            tracing::warn!(turn = self.turn, from = %from, to = %to, "illegal turn transition");
        }
        debug_assert!(legal, "illegal transition {from} -> {to}");

        tracing::debug!(turn = self.turn, from = %from, to = %to, "turn state changed");
        self.state = to;
        let _ = self.events.send(TurnEvent::StateChanged {
            turn: self.turn,
            from,
            to,
        });
    }

    fn cancelled(&mut self) -> TurnOutcome {
        tracing::info!(turn = self.turn, state = %self.state, "turn cancelled");
        self.transition(TurnState::Cancelled);
        TurnOutcome::Cancelled
    }

    fn fail(&mut self, error: Error) -> TurnOutcome {
        tracing::error!(turn = self.turn, state = %self.state, error = %error, "turn failed");
        self.transition(TurnState::Failed);
        let _ = self.events.send(TurnEvent::Failed {
            turn: self.turn,
            error: error.to_string(),
        });

        if self.config.failure_policy == FailurePolicy::Continue {
            self.ports.vad.reset();
            self.transition(TurnState::Idle);
        }
        TurnOutcome::Failed(error)
    }
}

impl std::fmt::Debug for TurnController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TurnController")
            .field("state", &self.state)
            .field("turn", &self.turn)
            .field("ports", &self.ports)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// Bounded window of audio preceding speech onset
#[derive(Default)]
struct PreRoll {
    frames: VecDeque<AudioFrame>,
    duration: Duration,
}

impl PreRoll {
    fn push(&mut self, frame: AudioFrame) {
        self.duration += frame.duration();
        self.frames.push_back(frame);
        while self.duration > PRE_ROLL {
            match self.frames.pop_front() {
                Some(old) => self.duration = self.duration.saturating_sub(old.duration()),
                None => break,
            }
        }
    }

    fn drain(&mut self) -> impl Iterator<Item = AudioFrame> + '_ {
        self.duration = Duration::ZERO;
        self.frames.drain(..)
    }
}

/// Hand a frame to STT; a port that stopped reading early just loses audio
async fn forward(stt: &Transcription, frame: AudioFrame, cancel: &CancellationToken) {
    if let Some(audio) = &stt.audio {
        tokio::select! {
            biased;
            () = cancel.cancelled() => {}
            _ = audio.send(frame) => {}
        }
    }
}

fn transcription_lost() -> Error {
    Error::Stt("transcription task stopped unexpectedly".to_string())
}

fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
