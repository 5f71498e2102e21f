//! Session lifecycle
//!
//! A [`SessionLifecycleManager`] takes one job from connection to teardown:
//! connect (with bounded retry), wait for a participant, greet, hand the
//! participant's audio to the [`TurnController`], then drain. Draining always
//! runs, whatever ended the session, and always reaches `Closed`.

mod retry;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use futures::future::BoxFuture;
use tokio::sync::{broadcast, watch};
use tokio_util::sync::CancellationToken;

pub use retry::{RetryPolicy, delay_for_attempt, with_retry};

use crate::metrics::{MetricsAggregator, UsageSummary};
use crate::ports::{AudioStream, ConversationContext, Ports};
use crate::transport::RoomTransport;
use crate::turn::{
    ControllerExit, FailurePolicy, TurnConfig, TurnController, TurnEvent, TurnOutcome,
};
use crate::{Error, Result};

/// Default participant wait
pub const DEFAULT_PARTICIPANT_TIMEOUT: Duration = Duration::from_secs(30);

/// Session lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    /// Constructed, not started
    Created,
    /// Establishing the room connection
    Connecting,
    /// Connected, waiting for someone to join
    AwaitingParticipant,
    /// Conversation in progress
    Active,
    /// Tearing down
    Draining,
    /// Finished; accepts nothing further
    Closed,
}

impl SessionState {
    /// Whether `next` is a legal successor
    #[must_use]
    pub const fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Created, Self::Connecting | Self::Draining)
                | (Self::Connecting, Self::AwaitingParticipant | Self::Draining)
                | (Self::AwaitingParticipant, Self::Active | Self::Draining)
                | (Self::Active, Self::Draining)
                | (Self::Draining, Self::Closed)
        )
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            Self::Created => "created",
            Self::Connecting => "connecting",
            Self::AwaitingParticipant => "awaiting_participant",
            Self::Active => "active",
            Self::Draining => "draining",
            Self::Closed => "closed",
        };
        f.write_str(label)
    }
}

/// Why a session ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EndReason {
    /// The participant left the room
    ParticipantLeft,
    /// Nobody joined within the participant timeout
    ParticipantTimeout,
    /// External shutdown request
    Cancelled,
    /// Unrecoverable port or transport failure
    Failed(String),
    /// The room could not be reached
    ConnectFailed(String),
}

/// What a finished session reports to its dispatcher
#[derive(Debug, Clone)]
pub struct SessionReport {
    /// Job identifier
    pub job_id: String,
    /// What ended the session
    pub end_reason: EndReason,
    /// Final usage, as handed to the shutdown callbacks
    pub summary: UsageSummary,
    /// Every state the session visited, in order
    pub transitions: Vec<SessionState>,
    /// Names of shutdown callbacks that failed or panicked
    pub failed_callbacks: Vec<String>,
}

/// Session tuning
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// System prompt for the language model
    pub instructions: String,
    /// Spoken once the participant has joined
    pub greeting: Option<String>,
    /// How long to wait for a participant
    pub participant_timeout: Duration,
    /// Retry policy for the room connection
    pub connect_retry: RetryPolicy,
    /// Turn controller tuning
    pub turn: TurnConfig,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            instructions: String::new(),
            greeting: None,
            participant_timeout: DEFAULT_PARTICIPANT_TIMEOUT,
            connect_retry: RetryPolicy::default(),
            turn: TurnConfig::default(),
        }
    }
}

type ShutdownFn = Box<dyn FnOnce(UsageSummary) -> BoxFuture<'static, Result<()>> + Send>;

/// A deferred teardown action
struct ShutdownCallback {
    name: String,
    run: ShutdownFn,
}

/// Drives one job from connection to `Closed`
pub struct SessionLifecycleManager {
    job_id: String,
    room: Arc<dyn RoomTransport>,
    config: SessionConfig,
    controller: TurnController,
    metrics: MetricsAggregator,
    callbacks: Vec<ShutdownCallback>,
    cancel: CancellationToken,
    state: watch::Sender<SessionState>,
    transitions: Vec<SessionState>,
    connected: bool,
}

impl SessionLifecycleManager {
    /// Create a session in `Created`
    #[must_use]
    pub fn new(
        job_id: impl Into<String>,
        room: Arc<dyn RoomTransport>,
        ports: Ports,
        config: SessionConfig,
    ) -> Self {
        let cancel = CancellationToken::new();
        let metrics = MetricsAggregator::new();
        let controller = TurnController::new(
            ports,
            room.audio_output(),
            metrics.clone(),
            ConversationContext::new(&config.instructions),
            config.turn.clone(),
        )
        .with_cancel_token(cancel.child_token());
        let (state, _) = watch::channel(SessionState::Created);

        Self {
            job_id: job_id.into(),
            room,
            config,
            controller,
            metrics,
            callbacks: Vec::new(),
            cancel,
            state,
            transitions: vec![SessionState::Created],
            connected: false,
        }
    }

    /// Use `token` as the shutdown signal (typically a child of the worker token)
    #[must_use]
    pub fn with_cancel_token(mut self, token: CancellationToken) -> Self {
        self.controller = self.controller.with_cancel_token(token.child_token());
        self.cancel = token;
        self
    }

    /// Job identifier
    #[must_use]
    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    /// Register a teardown action
    ///
    /// Callbacks run exactly once, in registration order, with the final
    /// usage summary. A failing or panicking callback is logged and does not
    /// stop the ones after it.
    pub fn add_shutdown_callback<F, Fut>(&mut self, name: impl Into<String>, callback: F)
    where
        F: FnOnce(UsageSummary) -> Fut + Send + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.callbacks.push(ShutdownCallback {
            name: name.into(),
            run: Box::new(move |summary| callback(summary).boxed()),
        });
    }

    /// Token that requests shutdown; cancelling it drains the session
    #[must_use]
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Session-wide usage aggregator
    #[must_use]
    pub fn metrics(&self) -> MetricsAggregator {
        self.metrics.clone()
    }

    /// Watch lifecycle state changes
    #[must_use]
    pub fn subscribe_state(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    /// Watch the turn controller
    #[must_use]
    pub fn subscribe_turns(&self) -> broadcast::Receiver<TurnEvent> {
        self.controller.subscribe()
    }

    /// Run the session to completion
    ///
    /// Consumes the manager: once this returns the session is `Closed`.
    ///
    /// # Errors
    ///
    /// Returns the connection error if the room could not be reached. The
    /// session is still drained and every shutdown callback has run.
    pub async fn run(mut self) -> Result<SessionReport> {
        tracing::info!(job_id = %self.job_id, room = self.room.name(), "session starting");

        let served = self.serve().await;
        let end_reason = match &served {
            Ok(reason) => reason.clone(),
            Err(e) => EndReason::ConnectFailed(e.to_string()),
        };

        let (summary, failed_callbacks) = self.drain(&end_reason).await;

        let report = SessionReport {
            job_id: self.job_id,
            end_reason,
            summary,
            transitions: self.transitions,
            failed_callbacks,
        };
        served.map(|_| report)
    }

    async fn serve(&mut self) -> Result<EndReason> {
        let cancel = self.cancel.clone();

        // Connecting
        self.transition(SessionState::Connecting);
        let room = Arc::clone(&self.room);
        let connect = with_retry(&self.config.connect_retry, "room connect", || room.connect());
        tokio::select! {
            biased;
            () = cancel.cancelled() => return Ok(EndReason::Cancelled),
            connected = connect => {
                if let Err(e) = connected {
                    tracing::error!(job_id = %self.job_id, error = %e, "room connection failed");
                    return Err(e);
                }
            }
        }
        self.connected = true;

        // AwaitingParticipant
        self.transition(SessionState::AwaitingParticipant);
        let waited = tokio::select! {
            biased;
            () = cancel.cancelled() => return Ok(EndReason::Cancelled),
            waited = tokio::time::timeout(
                self.config.participant_timeout,
                self.room.wait_for_participant(),
            ) => waited,
        };
        let participant = match waited {
            Ok(Ok(participant)) => participant,
            Ok(Err(e)) => return Ok(EndReason::Failed(e.to_string())),
            Err(_) => {
                tracing::info!(
                    job_id = %self.job_id,
                    timeout_ms = u64::try_from(self.config.participant_timeout.as_millis())
                        .unwrap_or(u64::MAX),
                    "no participant joined"
                );
                return Ok(EndReason::ParticipantTimeout);
            }
        };
        tracing::info!(job_id = %self.job_id, participant = %participant.identity, "participant joined");

        let input = match self.room.subscribe_audio(&participant).await {
            Ok(input) => input,
            Err(e) => return Ok(EndReason::Failed(e.to_string())),
        };

        // Active
        self.transition(SessionState::Active);

        // A departure cancels whatever the controller is doing
        let departure = {
            let room = Arc::clone(&self.room);
            let turns = self.controller.cancel_token();
            let job_id = self.job_id.clone();
            tokio::spawn(async move {
                room.wait_for_departure(&participant).await;
                tracing::info!(job_id = %job_id, participant = %participant.identity, "participant left");
                turns.cancel();
            })
        };

        let reason = self.converse(input).await;
        departure.abort();
        Ok(reason)
    }

    /// Greet, then serve turns until the controller stops
    async fn converse(&mut self, input: AudioStream) -> EndReason {
        if let Some(greeting) = self.config.greeting.clone() {
            match self.controller.say(&greeting).await {
                TurnOutcome::Completed => {}
                TurnOutcome::Cancelled => return self.stop_reason(),
                TurnOutcome::Failed(e) => {
                    if self.config.turn.failure_policy == FailurePolicy::Terminate {
                        return EndReason::Failed(e.to_string());
                    }
                }
            }
        }

        match self.controller.run(input).await {
            ControllerExit::InputClosed => EndReason::ParticipantLeft,
            ControllerExit::Cancelled => self.stop_reason(),
            ControllerExit::Failed(e) => EndReason::Failed(e.to_string()),
        }
    }

    /// Why a cancelled controller stopped
    ///
    /// Only the session token and the participant's departure reach the
    /// controller's token.
    fn stop_reason(&self) -> EndReason {
        if self.cancel.is_cancelled() {
            EndReason::Cancelled
        } else {
            EndReason::ParticipantLeft
        }
    }

    async fn drain(&mut self, reason: &EndReason) -> (UsageSummary, Vec<String>) {
        self.transition(SessionState::Draining);
        tracing::info!(job_id = %self.job_id, reason = ?reason, "session draining");

        // 1. Stop in-flight turn work
        self.controller.cancel();

        // 2. Final usage
        let summary = self.metrics.summary();

        // 3. Shutdown callbacks, in order, isolated from each other
        let mut failed = Vec::new();
        for callback in self.callbacks.drain(..) {
            let ShutdownCallback { name, run } = callback;
            let snapshot = summary.clone();
            let result = tokio::spawn(async move { run(snapshot).await }).await;

            let error = match result {
                Ok(Ok(())) => {
                    tracing::debug!(job_id = %self.job_id, callback = %name, "shutdown callback complete");
                    continue;
                }
                Ok(Err(e)) => e,
                Err(join) => Error::Callback {
                    name: name.clone(),
                    reason: if join.is_panic() {
                        "panicked".to_string()
                    } else {
                        join.to_string()
                    },
                },
            };
            tracing::error!(job_id = %self.job_id, callback = %name, error = %error, "shutdown callback failed");
            failed.push(name);
        }

        // 4. Release per-job resources
        if self.connected {
            if let Err(e) = self.room.disconnect().await {
                tracing::warn!(job_id = %self.job_id, error = %e, "room disconnect failed");
            }
            self.connected = false;
        }

        self.transition(SessionState::Closed);
        tracing::info!(job_id = %self.job_id, "session closed");
        (summary, failed)
    }

    fn transition(&mut self, to: SessionState) {
        let from = *self.state.borrow();
        let legal = from.can_transition_to(to);
        if !legal {
            tracing::warn!(job_id = %self.job_id, from = %from, to = %to, "illegal session transition");
        }
        debug_assert!(legal, "illegal session transition {from} -> {to}");

        tracing::debug!(job_id = %self.job_id, from = %from, to = %to, "session state changed");
        self.transitions.push(to);
        self.state.send_replace(to);
    }
}

impl std::fmt::Debug for SessionLifecycleManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionLifecycleManager")
            .field("job_id", &self.job_id)
            .field("state", &*self.state.borrow())
            .field("callbacks", &self.callbacks.len())
            .finish_non_exhaustive()
    }
}
