//! Room transport boundary
//!
//! The core never speaks a media protocol itself. A [`RoomTransport`] hands it
//! a connected room, the remote participant's audio and an [`AudioOutput`]
//! sink; [`LocalRoom`] is the in-memory implementation used by the CLI
//! simulator and the tests.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::stream::{self, Stream};
use futures::{StreamExt, future};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::audio::AudioFrame;
use crate::ports::AudioStream;
use crate::{Error, Result};

/// A remote participant in the room
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Participant {
    /// Transport-assigned identity
    pub identity: String,
}

/// Outbound audio sink
#[async_trait]
pub trait AudioOutput: Send + Sync {
    /// Queue one frame for playback
    ///
    /// # Errors
    ///
    /// Returns [`Error::Transport`] if the sink is closed
    async fn capture_frame(&self, frame: AudioFrame) -> Result<()>;

    /// Wait until every queued frame has been played
    ///
    /// Sinks without a playout signal return immediately.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Transport`] if the sink is closed
    async fn wait_for_playout(&self) -> Result<()>;

    /// Drop queued, unplayed audio after an interruption
    fn clear(&self) {}
}

/// Connection to one room
#[async_trait]
pub trait RoomTransport: Send + Sync {
    /// Room name, for logging
    fn name(&self) -> &str;

    /// Connect, auto-subscribing to audio tracks only
    ///
    /// # Errors
    ///
    /// Returns [`Error::Connection`] if the room is unreachable
    async fn connect(&self) -> Result<()>;

    /// Block until a remote participant is present
    ///
    /// # Errors
    ///
    /// Returns [`Error::Transport`] if the room closes first
    async fn wait_for_participant(&self) -> Result<Participant>;

    /// The participant's inbound audio; ends when they leave
    ///
    /// # Errors
    ///
    /// Returns [`Error::Transport`] if the participant has no audio track
    async fn subscribe_audio(&self, participant: &Participant) -> Result<AudioStream>;

    /// Resolve once `participant` has left the room
    async fn wait_for_departure(&self, participant: &Participant);

    /// The agent's outbound audio sink
    fn audio_output(&self) -> Arc<dyn AudioOutput>;

    /// Leave the room
    ///
    /// # Errors
    ///
    /// Returns [`Error::Transport`] if the disconnect could not be sent
    async fn disconnect(&self) -> Result<()>;
}

/// Audio sink that records everything it is given
#[derive(Debug, Default)]
pub struct LocalOutput {
    frames: Mutex<Vec<AudioFrame>>,
    playouts: AtomicUsize,
    clears: AtomicUsize,
    closed: AtomicBool,
}

impl LocalOutput {
    /// Frames captured so far
    #[must_use]
    pub fn frames(&self) -> Vec<AudioFrame> {
        self.frames.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// All captured samples, concatenated
    #[must_use]
    pub fn samples(&self) -> Vec<f32> {
        self.frames
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .flat_map(|f| f.samples().iter().copied())
            .collect()
    }

    /// Number of completed playout waits
    #[must_use]
    pub fn playouts(&self) -> usize {
        self.playouts.load(Ordering::SeqCst)
    }

    /// Number of interruptions
    #[must_use]
    pub fn clears(&self) -> usize {
        self.clears.load(Ordering::SeqCst)
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::Transport("audio output closed".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl AudioOutput for LocalOutput {
    async fn capture_frame(&self, frame: AudioFrame) -> Result<()> {
        self.ensure_open()?;
        self.frames
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(frame);
        Ok(())
    }

    async fn wait_for_playout(&self) -> Result<()> {
        self.ensure_open()?;
        self.playouts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn clear(&self) {
        self.clears.fetch_add(1, Ordering::SeqCst);
    }
}

/// In-memory room
///
/// A participant joins with [`LocalRoom::join`], supplying their audio as a
/// stream; the agent's speech collects in [`LocalRoom::output`]. The
/// participant leaves when that stream ends or on [`LocalRoom::leave`].
pub struct LocalRoom {
    name: String,
    participant: watch::Sender<Option<Participant>>,
    departed: CancellationToken,
    input: Mutex<Option<AudioStream>>,
    output: Arc<LocalOutput>,
    connected: AtomicBool,
    failing_connects: AtomicU32,
    connect_attempts: AtomicU32,
    disconnects: AtomicU32,
}

impl LocalRoom {
    /// Create an empty room
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        let (participant, _) = watch::channel(None);
        Self {
            name: name.into(),
            participant,
            departed: CancellationToken::new(),
            input: Mutex::new(None),
            output: Arc::new(LocalOutput::default()),
            connected: AtomicBool::new(false),
            failing_connects: AtomicU32::new(0),
            connect_attempts: AtomicU32::new(0),
            disconnects: AtomicU32::new(0),
        }
    }

    /// Make the next `count` connection attempts fail
    #[must_use]
    pub fn with_failing_connects(self, count: u32) -> Self {
        self.failing_connects.store(count, Ordering::SeqCst);
        self
    }

    /// A participant joins, publishing `audio`
    pub fn join<S>(&self, identity: impl Into<String>, audio: S)
    where
        S: Stream<Item = AudioFrame> + Send + 'static,
    {
        let identity = identity.into();
        tracing::debug!(room = %self.name, participant = %identity, "participant joined");

        let left = self.departed.clone();
        let on_end = self.departed.clone();
        let audio = audio
            .take_until(async move { left.cancelled().await })
            .chain(
                stream::once(async move {
                    on_end.cancel();
                    None::<AudioFrame>
                })
                .filter_map(future::ready),
            );

        *self.input.lock().unwrap_or_else(|e| e.into_inner()) = Some(audio.boxed());
        self.participant.send_replace(Some(Participant { identity }));
    }

    /// The participant leaves; their audio ends
    pub fn leave(&self) {
        tracing::debug!(room = %self.name, "participant left");
        self.departed.cancel();
    }

    /// Whether the participant has left
    #[must_use]
    pub fn has_departed(&self) -> bool {
        self.departed.is_cancelled()
    }

    /// The agent's captured output
    #[must_use]
    pub fn output(&self) -> Arc<LocalOutput> {
        Arc::clone(&self.output)
    }

    /// Whether the agent is currently connected
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Number of connection attempts made
    #[must_use]
    pub fn connect_attempts(&self) -> u32 {
        self.connect_attempts.load(Ordering::SeqCst)
    }

    /// Number of disconnects performed
    #[must_use]
    pub fn disconnects(&self) -> u32 {
        self.disconnects.load(Ordering::SeqCst)
    }
}

impl std::fmt::Debug for LocalRoom {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalRoom")
            .field("name", &self.name)
            .field("connected", &self.is_connected())
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl RoomTransport for LocalRoom {
    fn name(&self) -> &str {
        &self.name
    }

    async fn connect(&self) -> Result<()> {
        self.connect_attempts.fetch_add(1, Ordering::SeqCst);

        let remaining = self.failing_connects.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failing_connects.store(remaining - 1, Ordering::SeqCst);
            return Err(Error::Connection(format!("room {} unreachable", self.name)));
        }

        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn wait_for_participant(&self) -> Result<Participant> {
        let mut rx = self.participant.subscribe();
        let participant = rx
            .wait_for(Option::is_some)
            .await
            .map_err(|_| Error::Transport("room closed".to_string()))?;

        (*participant)
            .clone()
            .ok_or_else(|| Error::Transport("participant vanished".to_string()))
    }

    async fn subscribe_audio(&self, participant: &Participant) -> Result<AudioStream> {
        self.input
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
            .ok_or_else(|| {
                Error::Transport(format!("no audio track for {}", participant.identity))
            })
    }

    async fn wait_for_departure(&self, _participant: &Participant) {
        self.departed.cancelled().await;
    }

    fn audio_output(&self) -> Arc<dyn AudioOutput> {
        Arc::clone(&self.output) as Arc<dyn AudioOutput>
    }

    async fn disconnect(&self) -> Result<()> {
        self.connected.store(false, Ordering::SeqCst);
        self.disconnects.fetch_add(1, Ordering::SeqCst);
        self.output.close();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::SAMPLE_RATE;
    use std::time::Duration;

    #[tokio::test]
    async fn participant_wait_resolves_on_join() {
        let room = Arc::new(LocalRoom::new("test"));
        room.connect().await.unwrap();

        let waiter = {
            let room = Arc::clone(&room);
            tokio::spawn(async move { room.wait_for_participant().await })
        };
        tokio::task::yield_now().await;

        let frame = AudioFrame::silence(Duration::from_millis(20), SAMPLE_RATE);
        room.join("caller", futures::stream::iter(vec![frame.clone()]));

        let participant = waiter.await.unwrap().unwrap();
        assert_eq!(participant.identity, "caller");

        let audio: Vec<_> = room.subscribe_audio(&participant).await.unwrap().collect().await;
        assert_eq!(audio, vec![frame]);
        assert!(room.subscribe_audio(&participant).await.is_err());
    }

    #[tokio::test]
    async fn audio_ending_means_departure() {
        let room = LocalRoom::new("test");
        let frame = AudioFrame::silence(Duration::from_millis(20), SAMPLE_RATE);
        room.join("caller", futures::stream::iter(vec![frame.clone(); 3]));
        let participant = room.wait_for_participant().await.unwrap();

        let mut audio = room.subscribe_audio(&participant).await.unwrap();
        assert_eq!(audio.next().await, Some(frame));
        assert!(!room.has_departed());

        while audio.next().await.is_some() {}
        assert!(room.has_departed());
        room.wait_for_departure(&participant).await;
    }

    #[tokio::test]
    async fn leaving_ends_audio() {
        let room = LocalRoom::new("test");
        let frame = AudioFrame::silence(Duration::from_millis(20), SAMPLE_RATE);
        room.join(
            "caller",
            futures::stream::iter(vec![frame.clone()]).chain(futures::stream::pending()),
        );
        let participant = room.wait_for_participant().await.unwrap();
        let mut audio = room.subscribe_audio(&participant).await.unwrap();
        assert_eq!(audio.next().await, Some(frame));

        room.leave();
        assert_eq!(audio.next().await, None);
        room.wait_for_departure(&participant).await;
    }

    #[tokio::test]
    async fn failing_connects_are_counted() {
        let room = LocalRoom::new("flaky").with_failing_connects(1);
        assert!(matches!(room.connect().await, Err(Error::Connection(_))));
        room.connect().await.unwrap();
        assert!(room.is_connected());
        assert_eq!(room.connect_attempts(), 2);
    }

    #[tokio::test]
    async fn output_closes_on_disconnect() {
        let room = LocalRoom::new("test");
        room.connect().await.unwrap();
        let output = room.audio_output();

        output
            .capture_frame(AudioFrame::new(vec![0.1; 4], SAMPLE_RATE))
            .await
            .unwrap();
        room.disconnect().await.unwrap();

        assert!(output.capture_frame(AudioFrame::new(vec![0.1], SAMPLE_RATE)).await.is_err());
        assert_eq!(room.output().samples().len(), 4);
        assert_eq!(room.disconnects(), 1);
    }
}
