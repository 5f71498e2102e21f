//! Worker-level job dispatch
//!
//! A [`JobDispatcher`] prewarms the process-wide [`SharedResourceCache`] once,
//! then turns every incoming [`Job`] into its own session task. Sessions share
//! nothing mutable except the read-only cache.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;

use crate::metrics::log_usage;
use crate::ports::Ports;
use crate::resources::SharedResourceCache;
use crate::session::{SessionConfig, SessionLifecycleManager, SessionReport};
use crate::transport::RoomTransport;
use crate::{Error, Result};

/// One room to service
pub struct Job {
    /// Job identifier
    pub id: String,
    /// Room connection
    pub room: Arc<dyn RoomTransport>,
}

impl Job {
    /// Create a job with a fresh identifier
    #[must_use]
    pub fn new(room: Arc<dyn RoomTransport>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            room,
        }
    }

    /// Create a job with a caller-supplied identifier
    #[must_use]
    pub fn with_id(id: impl Into<String>, room: Arc<dyn RoomTransport>) -> Self {
        Self {
            id: id.into(),
            room,
        }
    }
}

impl std::fmt::Debug for Job {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Job")
            .field("id", &self.id)
            .field("room", &self.room.name())
            .finish()
    }
}

/// What a session sees of its worker
#[derive(Debug, Clone)]
pub struct JobContext {
    /// Job identifier
    pub job_id: String,
    /// Process-wide shared resources
    pub resources: Arc<SharedResourceCache>,
}

/// The agent-specific part of a worker
#[async_trait]
pub trait Entrypoint: Send + Sync {
    /// Load shared resources; runs once, before any job is accepted
    ///
    /// # Errors
    ///
    /// Returns error if a resource fails to load; the worker must not start
    async fn prewarm(&self, resources: &SharedResourceCache) -> Result<()>;

    /// Build the ports for one job
    ///
    /// # Errors
    ///
    /// Returns error if a port cannot be constructed
    async fn ports(&self, ctx: &JobContext) -> Result<Ports>;

    /// Session settings for one job
    fn session_config(&self, ctx: &JobContext) -> SessionConfig;

    /// Customize a session before it starts
    ///
    /// The default registers usage logging as a shutdown callback.
    fn on_session(&self, session: &mut SessionLifecycleManager) {
        session.add_shutdown_callback("log_usage", log_usage);
    }
}

/// Accepts jobs and runs each as an independent session
pub struct JobDispatcher {
    entrypoint: Arc<dyn Entrypoint>,
    resources: Arc<SharedResourceCache>,
    prewarmed: AtomicBool,
    shutdown: CancellationToken,
}

impl JobDispatcher {
    /// Create a dispatcher with an empty resource cache
    #[must_use]
    pub fn new(entrypoint: Arc<dyn Entrypoint>) -> Self {
        Self {
            entrypoint,
            resources: Arc::new(SharedResourceCache::new()),
            prewarmed: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
        }
    }

    /// Process-wide shared resources
    #[must_use]
    pub fn resources(&self) -> Arc<SharedResourceCache> {
        Arc::clone(&self.resources)
    }

    /// Whether prewarm has completed
    #[must_use]
    pub fn is_prewarmed(&self) -> bool {
        self.prewarmed.load(Ordering::SeqCst)
    }

    /// Load shared resources before accepting jobs
    ///
    /// Calling it again after success is a no-op.
    ///
    /// # Errors
    ///
    /// Returns the loader error; the worker should exit
    pub async fn prewarm(&self) -> Result<()> {
        if self.is_prewarmed() {
            return Ok(());
        }

        tracing::info!("prewarming worker");
        self.entrypoint.prewarm(&self.resources).await.map_err(|e| {
            tracing::error!(error = %e, "prewarm failed");
            e
        })?;

        self.prewarmed.store(true, Ordering::SeqCst);
        tracing::info!(resources = ?self.resources.names(), "worker prewarmed");
        Ok(())
    }

    /// Start a session for `job` on its own task
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotPrewarmed`] before [`Self::prewarm`] has
    /// succeeded, or the entrypoint's error if the ports cannot be built
    pub async fn dispatch(&self, job: Job) -> Result<JoinHandle<Result<SessionReport>>> {
        let session = self.prepare(job).await?;
        Ok(tokio::spawn(session.run()))
    }

    /// Serve jobs from `jobs` until the channel closes or shutdown
    ///
    /// Prewarms first if needed, then waits for running sessions to drain
    /// before returning their reports.
    ///
    /// # Errors
    ///
    /// Returns error only if prewarm fails
    pub async fn run(&self, mut jobs: mpsc::Receiver<Job>) -> Result<Vec<SessionReport>> {
        self.prewarm().await?;

        let mut sessions = JoinSet::new();
        let mut reports = Vec::new();

        loop {
            tokio::select! {
                () = self.shutdown.cancelled() => {
                    tracing::info!(active = sessions.len(), "dispatcher shutting down");
                    break;
                }
                Some(done) = sessions.join_next(), if !sessions.is_empty() => {
                    collect_report(done, &mut reports);
                }
                job = jobs.recv() => {
                    let Some(job) = job else {
                        tracing::debug!("job channel closed");
                        break;
                    };
                    let job_id = job.id.clone();
                    match self.prepare(job).await {
                        Ok(session) => {
                            sessions.spawn(session.run());
                        }
                        Err(e) => tracing::error!(job_id = %job_id, error = %e, "job rejected"),
                    }
                }
            }
        }

        while let Some(done) = sessions.join_next().await {
            collect_report(done, &mut reports);
        }
        Ok(reports)
    }

    /// Ask every running session to drain and stop accepting jobs
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    async fn prepare(&self, job: Job) -> Result<SessionLifecycleManager> {
        if !self.is_prewarmed() {
            return Err(Error::NotPrewarmed);
        }

        let ctx = JobContext {
            job_id: job.id.clone(),
            resources: Arc::clone(&self.resources),
        };
        let ports = self.entrypoint.ports(&ctx).await?;
        let config = self.entrypoint.session_config(&ctx);

        let mut session = SessionLifecycleManager::new(job.id, job.room, ports, config)
            .with_cancel_token(self.shutdown.child_token());
        self.entrypoint.on_session(&mut session);

        tracing::info!(job_id = %ctx.job_id, "job accepted");
        Ok(session)
    }
}

impl std::fmt::Debug for JobDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobDispatcher")
            .field("resources", &self.resources)
            .field("prewarmed", &self.is_prewarmed())
            .finish_non_exhaustive()
    }
}

fn collect_report(
    done: std::result::Result<Result<SessionReport>, tokio::task::JoinError>,
    reports: &mut Vec<SessionReport>,
) {
    match done {
        Ok(Ok(report)) => {
            tracing::info!(job_id = %report.job_id, reason = ?report.end_reason, "job finished");
            reports.push(report);
        }
        Ok(Err(e)) => tracing::error!(error = %e, "job failed"),
        Err(e) => tracing::error!(error = %e, "session task aborted"),
    }
}
