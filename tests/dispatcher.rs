//! Job dispatcher integration tests

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::{StreamExt, stream};
use tokio::sync::{mpsc, watch};

use cadence_voice::metrics::log_usage;
use cadence_voice::{
    EndReason, Entrypoint, Error, Job, JobContext, JobDispatcher, LocalRoom, Result, RoomTransport,
    SessionConfig, SessionLifecycleManager, SessionState, SharedResourceCache, Stage,
};

mod common;

use common::{AfterSilence, ScriptedLlm, ScriptedStt, ScriptedTts, ports, silence, speech};

const MODEL: &str = "acoustic-model";

struct TestAgent {
    loads: AtomicUsize,
    fail_prewarm: bool,
    sessions: Mutex<Vec<watch::Receiver<SessionState>>>,
}

impl TestAgent {
    fn new() -> Self {
        Self {
            loads: AtomicUsize::new(0),
            fail_prewarm: false,
            sessions: Mutex::new(Vec::new()),
        }
    }

    fn broken() -> Self {
        Self {
            fail_prewarm: true,
            ..Self::new()
        }
    }

    fn session_states(&self) -> Vec<watch::Receiver<SessionState>> {
        self.sessions.lock().unwrap().clone()
    }
}

#[async_trait]
impl Entrypoint for TestAgent {
    async fn prewarm(&self, resources: &SharedResourceCache) -> Result<()> {
        resources
            .load_as(MODEL, || async {
                self.loads.fetch_add(1, Ordering::SeqCst);
                if self.fail_prewarm {
                    return Err(Error::Config("weights missing".to_string()));
                }
                Ok(String::from("weights"))
            })
            .await?;
        Ok(())
    }

    async fn ports(&self, ctx: &JobContext) -> Result<cadence_voice::Ports> {
        ctx.resources
            .get_as::<String>(MODEL)
            .ok_or(Error::NotPrewarmed)?;
        let stt = Arc::new(ScriptedStt::new(&[ctx.job_id.as_str()]));
        let llm = Arc::new(ScriptedLlm::new("Got it."));
        let tts = Arc::new(ScriptedTts::new());
        Ok(ports(&stt, &llm, &tts, AfterSilence(Duration::from_millis(200))))
    }

    fn session_config(&self, _ctx: &JobContext) -> SessionConfig {
        SessionConfig::default()
    }

    fn on_session(&self, session: &mut SessionLifecycleManager) {
        session.add_shutdown_callback("log_usage", log_usage);
        self.sessions.lock().unwrap().push(session.subscribe_state());
    }
}

fn talking_room(name: &str) -> Arc<LocalRoom> {
    let room = Arc::new(LocalRoom::new(name));
    room.join("caller", stream::iter([speech(200), silence(200)].concat()));
    room
}

#[tokio::test]
async fn dispatch_before_prewarm_is_rejected() {
    let dispatcher = JobDispatcher::new(Arc::new(TestAgent::new()));
    let room = talking_room("early");

    let result = dispatcher.dispatch(Job::new(room as Arc<dyn RoomTransport>)).await;
    assert!(matches!(result, Err(Error::NotPrewarmed)));
    assert!(!dispatcher.is_prewarmed());
}

#[tokio::test]
async fn prewarm_loads_resources_once() {
    let agent = Arc::new(TestAgent::new());
    let dispatcher = JobDispatcher::new(Arc::clone(&agent) as Arc<dyn Entrypoint>);

    dispatcher.prewarm().await.unwrap();
    dispatcher.prewarm().await.unwrap();

    assert!(dispatcher.is_prewarmed());
    assert_eq!(agent.loads.load(Ordering::SeqCst), 1);
    assert_eq!(dispatcher.resources().names(), vec![MODEL.to_string()]);
}

#[tokio::test]
async fn failed_prewarm_keeps_worker_closed() {
    let dispatcher = JobDispatcher::new(Arc::new(TestAgent::broken()));

    let err = dispatcher.prewarm().await.unwrap_err();
    assert!(matches!(err, Error::ResourceLoad { ref name, .. } if name == MODEL));
    assert!(!dispatcher.is_prewarmed());

    let room = talking_room("refused");
    let result = dispatcher.dispatch(Job::new(room as Arc<dyn RoomTransport>)).await;
    assert!(matches!(result, Err(Error::NotPrewarmed)));
}

#[tokio::test]
async fn dispatched_job_runs_to_completion() {
    let dispatcher = JobDispatcher::new(Arc::new(TestAgent::new()));
    dispatcher.prewarm().await.unwrap();

    let room = talking_room("solo");
    let handle = dispatcher
        .dispatch(Job::with_id("solo-job", Arc::clone(&room) as Arc<dyn RoomTransport>))
        .await
        .unwrap();
    let report = handle.await.unwrap().unwrap();

    assert_eq!(report.job_id, "solo-job");
    assert_eq!(report.end_reason, EndReason::ParticipantLeft);
    assert!(report.failed_callbacks.is_empty());
    assert_eq!(room.output().frames().len(), 1);
}

#[tokio::test]
async fn concurrent_jobs_are_isolated() {
    let dispatcher = JobDispatcher::new(Arc::new(TestAgent::new()));
    let (tx, rx) = mpsc::channel(4);

    let rooms: Vec<_> = (0..3).map(|i| talking_room(&format!("room-{i}"))).collect();
    for (i, room) in rooms.iter().enumerate() {
        let job = Job::with_id(format!("job-{i}"), Arc::clone(room) as Arc<dyn RoomTransport>);
        tx.send(job).await.unwrap();
    }
    drop(tx);

    let mut reports = dispatcher.run(rx).await.unwrap();
    reports.sort_by(|a, b| a.job_id.cmp(&b.job_id));

    assert_eq!(reports.len(), 3);
    for (i, report) in reports.iter().enumerate() {
        assert_eq!(report.job_id, format!("job-{i}"));
        assert_eq!(report.end_reason, EndReason::ParticipantLeft);
        // each session only ever saw its own turn
        assert_eq!(report.summary.stage(Stage::Stt).events, 1);
        assert_eq!(report.summary.stage(Stage::Llm).events, 1);
    }
    for room in &rooms {
        assert_eq!(room.output().frames().len(), 1);
        assert!(!room.is_connected());
    }
}

#[tokio::test]
async fn shutdown_drains_running_sessions() {
    let agent = Arc::new(TestAgent::new());
    let dispatcher = Arc::new(JobDispatcher::new(Arc::clone(&agent) as Arc<dyn Entrypoint>));
    let (tx, rx) = mpsc::channel(1);

    let room = Arc::new(LocalRoom::new("endless"));
    room.join("caller", stream::iter(speech(200)).chain(stream::pending()));
    tx.send(Job::new(Arc::clone(&room) as Arc<dyn RoomTransport>))
        .await
        .unwrap();

    let worker = {
        let dispatcher = Arc::clone(&dispatcher);
        tokio::spawn(async move { dispatcher.run(rx).await })
    };

    let mut state = loop {
        if let Some(state) = agent.session_states().pop() {
            break state;
        }
        tokio::task::yield_now().await;
    };
    state
        .wait_for(|s| *s == SessionState::Active)
        .await
        .unwrap();

    dispatcher.shutdown();
    let reports = worker.await.unwrap().unwrap();

    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].end_reason, EndReason::Cancelled);
    assert_eq!(*state.borrow(), SessionState::Closed);
    assert!(!room.is_connected());
    drop(tx);
}
