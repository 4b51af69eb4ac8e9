//! Turns uploaded meeting recordings into a verbatim transcript and an
//! executive summary. Long recordings are split into audio chunks that are
//! transcribed in parallel and reassembled in order before summarization.

pub mod config;
pub mod jobs;
pub mod media;
pub mod pipeline;
pub mod remote;

pub use config::AppConfig;
pub use jobs::{JobLedger, JobRecord, JobStatus};
pub use pipeline::{Pipeline, PipelineConfig};

use jobs::JobStore;
use media::{DurationProbe, FfmpegSegmenter, FfprobeProbe, Segmenter};
use remote::{GeminiClient, RemoteCapability, RemoteConfig, RemoteError};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Semaphore;

/// Entry point for callers: accepts uploads, runs them through the
/// pipeline on a bounded worker pool, and answers status polls from the
/// shared ledger.
pub struct JobService {
    pipeline: Arc<Pipeline>,
    ledger: Arc<JobLedger>,
    store: Arc<dyn JobStore>,
    workers: Arc<Semaphore>,
}

impl JobService {
    /// Wire the production collaborators: ffprobe, ffmpeg, and the Gemini
    /// client. Fails when no API key is configured.
    pub fn from_config(
        config: &AppConfig,
        work_dir: impl Into<PathBuf>,
        store: Arc<dyn JobStore>,
    ) -> Result<Self, RemoteError> {
        let remote = GeminiClient::new(RemoteConfig::from_app_config(config)?);
        Ok(Self::new(
            Arc::new(FfprobeProbe::new()),
            Arc::new(FfmpegSegmenter::new()),
            Arc::new(remote),
            store,
            PipelineConfig::from_app_config(config, work_dir),
            config.worker_count,
        ))
    }

    pub fn new(
        probe: Arc<dyn DurationProbe>,
        segmenter: Arc<dyn Segmenter>,
        remote: Arc<dyn RemoteCapability>,
        store: Arc<dyn JobStore>,
        config: PipelineConfig,
        worker_count: usize,
    ) -> Self {
        let ledger = Arc::new(JobLedger::new());
        let pipeline = Pipeline::new(
            probe,
            segmenter,
            remote,
            Arc::clone(&ledger),
            Arc::clone(&store),
            config,
        );
        Self {
            pipeline: Arc::new(pipeline),
            ledger,
            store,
            workers: Arc::new(Semaphore::new(worker_count.max(1))),
        }
    }

    /// Queue a job and return immediately. The record is registered as
    /// PENDING before this returns, so a status poll issued right after
    /// submission always finds it.
    pub fn submit(&self, job_id: impl Into<String>, file_path: PathBuf, filename: &str) {
        let job_id = job_id.into();
        let record = JobRecord::new(&job_id, filename);
        self.ledger.create(record.clone());
        if let Err(e) = self.store.save(&record) {
            tracing::warn!("Job {}: failed to persist queued state: {}", job_id, e);
        }

        tracing::info!("Job {}: queued {}", job_id, filename);
        let pipeline = Arc::clone(&self.pipeline);
        let workers = Arc::clone(&self.workers);
        tokio::spawn(async move {
            let _permit = match workers.acquire_owned().await {
                Ok(permit) => permit,
                // Closed semaphore means the service is shutting down.
                Err(_) => return,
            };
            pipeline.run(&job_id, &file_path).await;
        });
    }

    /// Queue a job under a fresh id and hand the id back for polling.
    pub fn submit_new(&self, file_path: PathBuf, filename: &str) -> String {
        let job_id = uuid::Uuid::new_v4().to_string();
        self.submit(job_id.clone(), file_path, filename);
        job_id
    }

    /// Snapshot of a job's current state, or `None` for an unknown id.
    pub fn status(&self, job_id: &str) -> Option<JobRecord> {
        self.ledger.get(job_id)
    }

    pub fn ledger(&self) -> Arc<JobLedger> {
        Arc::clone(&self.ledger)
    }
}
