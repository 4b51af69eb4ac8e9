use crate::config::AppConfig;
use crate::jobs::{JobLedger, JobStatus, JobStore, LedgerProgress, ProgressSink};
use crate::media::{DurationProbe, MediaReference, ProbeError, SegmentationError, Segmenter};
use crate::remote::{RemoteCapability, RemoteError};
use chrono::Utc;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Probe(#[from] ProbeError),

    #[error(transparent)]
    Segmentation(#[from] SegmentationError),

    #[error(transparent)]
    Remote(#[from] RemoteError),

    #[error("splitting produced no chunks")]
    NoChunks,

    #[error("transcription returned an empty result")]
    EmptyTranscript,

    #[error("summary generation returned an empty result")]
    EmptySummary,

    #[error("chunk worker failed: {0}")]
    Worker(String),
}

/// Transcribed text for one chunk. Reassembly orders fragments by ascending
/// index regardless of completion order.
#[derive(Debug, Clone)]
pub struct TranscriptFragment {
    pub index: usize,
    pub text: String,
}

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Recordings at or under this length take the direct path.
    pub max_duration_seconds: u64,
    pub segment_duration_seconds: u64,
    pub chunk_concurrency: usize,
    /// Per-job chunk directories are created under here.
    pub work_dir: PathBuf,
}

impl PipelineConfig {
    pub fn from_app_config(config: &AppConfig, work_dir: impl Into<PathBuf>) -> Self {
        Self {
            max_duration_seconds: config.max_duration_seconds,
            segment_duration_seconds: config.segment_duration_seconds,
            chunk_concurrency: config.chunk_concurrency,
            work_dir: work_dir.into(),
        }
    }
}

struct JobOutput {
    transcript: String,
    summary: String,
}

/// Drives one job end to end: probe, choose strategy, transcribe,
/// reassemble, summarize, and transition the job record to a terminal
/// state exactly once.
pub struct Pipeline {
    probe: Arc<dyn DurationProbe>,
    segmenter: Arc<dyn Segmenter>,
    remote: Arc<dyn RemoteCapability>,
    ledger: Arc<JobLedger>,
    store: Arc<dyn JobStore>,
    config: PipelineConfig,
}

impl Pipeline {
    pub fn new(
        probe: Arc<dyn DurationProbe>,
        segmenter: Arc<dyn Segmenter>,
        remote: Arc<dyn RemoteCapability>,
        ledger: Arc<JobLedger>,
        store: Arc<dyn JobStore>,
        config: PipelineConfig,
    ) -> Self {
        Self {
            probe,
            segmenter,
            remote,
            ledger,
            store,
            config,
        }
    }

    pub fn ledger(&self) -> Arc<JobLedger> {
        Arc::clone(&self.ledger)
    }

    /// Execute the job and drive its record to COMPLETED or FAILED.
    ///
    /// The temporary source file and the job's chunk directory are removed
    /// unconditionally once the job reaches a terminal state.
    pub async fn run(&self, job_id: &str, source: &Path) {
        tracing::info!("Job {}: processing {}", job_id, source.display());
        self.ledger.update(job_id, |record| {
            record.status = JobStatus::Processing;
        });
        self.ledger.set_progress(job_id, 5, "Starting");

        let outcome = self.execute(job_id, source).await;

        let snapshot = match outcome {
            Ok(output) => {
                tracing::info!("Job {}: completed", job_id);
                self.ledger.update(job_id, |record| {
                    record.status = JobStatus::Completed;
                    record.progress = 100;
                    record.status_message = "Completed".to_string();
                    record.transcript = Some(output.transcript);
                    record.summary = Some(output.summary);
                    record.completed_at = Some(Utc::now());
                })
            }
            Err(e) => {
                tracing::error!("Job {}: failed: {}", job_id, e);
                self.ledger.update(job_id, |record| {
                    record.status = JobStatus::Failed;
                    record.status_message = "Failed".to_string();
                    record.error = Some(e.to_string());
                    record.completed_at = Some(Utc::now());
                })
            }
        };

        // Best-effort persistence: a store failure is logged, never re-raised.
        if let Some(record) = snapshot {
            if let Err(e) = self.store.save(&record) {
                tracing::error!("Job {}: failed to persist terminal state: {}", job_id, e);
            }
        }

        self.cleanup(job_id, source).await;
    }

    async fn execute(&self, job_id: &str, source: &Path) -> Result<JobOutput, PipelineError> {
        let progress = LedgerProgress::new(self.ledger(), job_id);

        let duration = self.probe.duration_seconds(source).await?;
        let media = MediaReference::new(source, duration);
        progress.update(10, &format!("Probed duration: {:.0}s", media.duration_seconds));

        let transcript = if media.duration_seconds <= self.config.max_duration_seconds as f64 {
            self.transcribe_direct(&media, &progress).await?
        } else {
            self.transcribe_chunked(job_id, &media, &progress).await?
        };

        progress.update(90, "Generating summary");
        let summary = self.remote.summarize(&transcript, &progress).await?;
        if summary.trim().is_empty() {
            return Err(PipelineError::EmptySummary);
        }
        progress.update(95, "Summary complete");

        Ok(JobOutput {
            transcript,
            summary,
        })
    }

    async fn transcribe_direct(
        &self,
        media: &MediaReference,
        progress: &LedgerProgress,
    ) -> Result<String, PipelineError> {
        progress.update(30, "Transcribing recording");
        let text = self.remote.transcribe(&media.path, progress).await?;
        if text.trim().is_empty() {
            return Err(PipelineError::EmptyTranscript);
        }
        progress.update(70, "Transcription complete");
        Ok(text)
    }

    async fn transcribe_chunked(
        &self,
        job_id: &str,
        media: &MediaReference,
        progress: &LedgerProgress,
    ) -> Result<String, PipelineError> {
        progress.update(25, "Splitting recording into audio chunks");

        let chunk_dir = self.chunk_dir(job_id);
        let chunks = self
            .segmenter
            .split(
                &media.path,
                media.duration_seconds,
                self.config.segment_duration_seconds as f64,
                &chunk_dir,
            )
            .await?;

        if chunks.is_empty() {
            return Err(PipelineError::NoChunks);
        }

        let total = chunks.len();
        progress.update(35, &format!("Transcribing {} chunks", total));

        let semaphore = Arc::new(Semaphore::new(self.config.chunk_concurrency.max(1)));
        let completed = Arc::new(AtomicUsize::new(0));
        let mut tasks: JoinSet<Result<TranscriptFragment, PipelineError>> = JoinSet::new();

        for chunk in chunks {
            let remote = Arc::clone(&self.remote);
            let semaphore = Arc::clone(&semaphore);
            let completed = Arc::clone(&completed);
            let sink = LedgerProgress::new(self.ledger(), job_id);

            tasks.spawn(async move {
                let _permit = semaphore
                    .acquire_owned()
                    .await
                    .map_err(|e| PipelineError::Worker(e.to_string()))?;

                tracing::info!("Transcribing chunk {}/{}", chunk.index + 1, total);
                let text = remote.transcribe(&chunk.output_path, &sink).await?;

                let done = completed.fetch_add(1, Ordering::SeqCst) + 1;
                let percent = (35 + done * 50 / total) as u8;
                sink.update(percent, &format!("Transcribed chunk {}/{}", done, total));

                Ok(TranscriptFragment {
                    index: chunk.index,
                    text,
                })
            });
        }

        // Join every worker even after a failure so each in-flight call
        // finishes its guaranteed remote-handle cleanup.
        let mut fragments: Vec<Option<String>> = vec![None; total];
        let mut first_error: Option<PipelineError> = None;
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Ok(fragment)) => fragments[fragment.index] = Some(fragment.text),
                Ok(Err(e)) => {
                    first_error.get_or_insert(e);
                }
                Err(e) => {
                    first_error.get_or_insert(PipelineError::Worker(e.to_string()));
                }
            }
        }
        if let Some(e) = first_error {
            return Err(e);
        }

        let transcript = fragments
            .into_iter()
            .flatten()
            .collect::<Vec<_>>()
            .join("\n");
        if transcript.trim().is_empty() {
            return Err(PipelineError::EmptyTranscript);
        }

        progress.update(85, "Transcript reassembled");
        Ok(transcript)
    }

    fn chunk_dir(&self, job_id: &str) -> PathBuf {
        // Derived from the job id so two jobs never share a chunk directory.
        self.config.work_dir.join(format!("chunks_{}", job_id))
    }

    async fn cleanup(&self, job_id: &str, source: &Path) {
        let chunk_dir = self.chunk_dir(job_id);
        if let Err(e) = tokio::fs::remove_dir_all(&chunk_dir).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(
                    "Job {}: failed to remove chunk directory {}: {}",
                    job_id,
                    chunk_dir.display(),
                    e
                );
            }
        }

        match tokio::fs::remove_file(source).await {
            Ok(()) => tracing::info!("Job {}: removed temporary file {}", job_id, source.display()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => tracing::warn!(
                "Job {}: failed to remove temporary file {}: {}",
                job_id,
                source.display(),
                e
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::{JobRecord, NullStore};
    use crate::media::{plan_chunks, ChunkSpec};
    use async_trait::async_trait;
    use std::time::Duration;

    struct FakeProbe {
        duration: f64,
    }

    #[async_trait]
    impl DurationProbe for FakeProbe {
        async fn duration_seconds(&self, _path: &Path) -> Result<f64, ProbeError> {
            Ok(self.duration)
        }
    }

    /// Plans real chunk specs and writes placeholder chunk files so cleanup
    /// has something to remove.
    struct FakeSegmenter;

    #[async_trait]
    impl Segmenter for FakeSegmenter {
        async fn split(
            &self,
            source: &Path,
            duration: f64,
            segment_duration: f64,
            output_dir: &Path,
        ) -> Result<Vec<ChunkSpec>, SegmentationError> {
            let chunks = plan_chunks(duration, segment_duration, source, output_dir);
            tokio::fs::create_dir_all(output_dir)
                .await
                .map_err(SegmentationError::OutputDir)?;
            for chunk in &chunks {
                tokio::fs::write(&chunk.output_path, b"audio")
                    .await
                    .map_err(SegmentationError::OutputDir)?;
            }
            Ok(chunks)
        }
    }

    /// Segmenter that reports an empty chunk list (corrupt zero duration).
    struct EmptySegmenter;

    #[async_trait]
    impl Segmenter for EmptySegmenter {
        async fn split(
            &self,
            _source: &Path,
            _duration: f64,
            _segment_duration: f64,
            _output_dir: &Path,
        ) -> Result<Vec<ChunkSpec>, SegmentationError> {
            Ok(Vec::new())
        }
    }

    struct FakeRemote {
        transcribe_calls: AtomicUsize,
        summarize_calls: AtomicUsize,
        empty_transcript: bool,
    }

    impl FakeRemote {
        fn new() -> Self {
            Self {
                transcribe_calls: AtomicUsize::new(0),
                summarize_calls: AtomicUsize::new(0),
                empty_transcript: false,
            }
        }

        fn with_empty_transcript() -> Self {
            Self {
                empty_transcript: true,
                ..Self::new()
            }
        }
    }

    #[async_trait]
    impl RemoteCapability for FakeRemote {
        async fn transcribe(
            &self,
            audio_path: &Path,
            _progress: &dyn ProgressSink,
        ) -> Result<String, RemoteError> {
            self.transcribe_calls.fetch_add(1, Ordering::SeqCst);
            if self.empty_transcript {
                return Ok(String::new());
            }

            let name = audio_path.file_stem().unwrap().to_string_lossy();
            match name.rsplit_once("_chunk_") {
                Some((_, n)) => {
                    // Later chunks finish first, so reassembly must reorder.
                    let index: u64 = n.parse().unwrap();
                    tokio::time::sleep(Duration::from_millis(50 / index)).await;
                    Ok(format!("chunk {} text", n))
                }
                None => Ok("full transcript".to_string()),
            }
        }

        async fn summarize(
            &self,
            transcript: &str,
            _progress: &dyn ProgressSink,
        ) -> Result<String, RemoteError> {
            self.summarize_calls.fetch_add(1, Ordering::SeqCst);
            Ok(format!("summary of {} chars", transcript.len()))
        }
    }

    struct Harness {
        pipeline: Pipeline,
        remote: Arc<FakeRemote>,
        ledger: Arc<JobLedger>,
        work_dir: tempfile::TempDir,
    }

    fn harness(duration: f64, segmenter: Arc<dyn Segmenter>, remote: Arc<FakeRemote>) -> Harness {
        let work_dir = tempfile::tempdir().unwrap();
        let ledger = Arc::new(JobLedger::new());
        let pipeline = Pipeline::new(
            Arc::new(FakeProbe { duration }),
            segmenter,
            remote.clone(),
            ledger.clone(),
            Arc::new(NullStore),
            PipelineConfig {
                max_duration_seconds: 1800,
                segment_duration_seconds: 1800,
                chunk_concurrency: 4,
                work_dir: work_dir.path().to_path_buf(),
            },
        );
        Harness {
            pipeline,
            remote,
            ledger,
            work_dir,
        }
    }

    async fn submit_and_run(h: &Harness, job_id: &str) -> (JobRecord, PathBuf) {
        let source = h.work_dir.path().join(format!("{}.mp4", job_id));
        tokio::fs::write(&source, b"media").await.unwrap();
        h.ledger.create(JobRecord::new(job_id, "meeting.mp4"));
        h.pipeline.run(job_id, &source).await;
        (h.ledger.get(job_id).unwrap(), source)
    }

    #[tokio::test]
    async fn test_short_recording_takes_direct_path() {
        let h = harness(600.0, Arc::new(FakeSegmenter), Arc::new(FakeRemote::new()));
        let (record, source) = submit_and_run(&h, "job-a").await;

        assert_eq!(record.status, JobStatus::Completed);
        assert_eq!(record.progress, 100);
        assert_eq!(record.transcript.as_deref(), Some("full transcript"));
        assert!(record.summary.unwrap().starts_with("summary of"));
        assert!(record.completed_at.is_some());
        assert_eq!(h.remote.transcribe_calls.load(Ordering::SeqCst), 1);
        assert_eq!(h.remote.summarize_calls.load(Ordering::SeqCst), 1);
        assert!(!source.exists(), "temp upload should be deleted");
    }

    #[tokio::test]
    async fn test_long_recording_is_chunked_and_reassembled_in_order() {
        // 65 minutes at 30-minute segments: 3 chunks, completing out of order.
        let h = harness(3900.0, Arc::new(FakeSegmenter), Arc::new(FakeRemote::new()));
        let (record, source) = submit_and_run(&h, "job-b").await;

        assert_eq!(record.status, JobStatus::Completed);
        assert_eq!(
            record.transcript.as_deref(),
            Some("chunk 1 text\nchunk 2 text\nchunk 3 text")
        );
        assert_eq!(h.remote.transcribe_calls.load(Ordering::SeqCst), 3);
        assert_eq!(h.remote.summarize_calls.load(Ordering::SeqCst), 1);
        assert!(!source.exists());
        assert!(
            !h.work_dir.path().join("chunks_job-b").exists(),
            "chunk directory should be removed"
        );
    }

    #[tokio::test]
    async fn test_zero_chunks_fails_the_job() {
        let h = harness(3900.0, Arc::new(EmptySegmenter), Arc::new(FakeRemote::new()));
        let (record, source) = submit_and_run(&h, "job-c").await;

        assert_eq!(record.status, JobStatus::Failed);
        assert!(record.error.unwrap().contains("no chunks"));
        assert!(record.summary.is_none());
        assert!(record.completed_at.is_some());
        assert!(!source.exists(), "temp upload deleted even on failure");
    }

    #[tokio::test]
    async fn test_empty_transcription_fails_the_job() {
        let h = harness(
            600.0,
            Arc::new(FakeSegmenter),
            Arc::new(FakeRemote::with_empty_transcript()),
        );
        let (record, _source) = submit_and_run(&h, "job-d").await;

        assert_eq!(record.status, JobStatus::Failed);
        assert!(record.error.unwrap().contains("empty"));
        assert_eq!(h.remote.summarize_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_progress_reaches_100_only_on_success() {
        let h = harness(3900.0, Arc::new(FakeSegmenter), Arc::new(FakeRemote::new()));
        let (record, _) = submit_and_run(&h, "job-e").await;
        assert_eq!(record.progress, 100);

        let h = harness(3900.0, Arc::new(EmptySegmenter), Arc::new(FakeRemote::new()));
        let (record, _) = submit_and_run(&h, "job-f").await;
        assert!(record.progress < 100);
    }

    #[tokio::test]
    async fn test_chunk_failure_still_cleans_up() {
        struct FailingRemote;

        #[async_trait]
        impl RemoteCapability for FailingRemote {
            async fn transcribe(
                &self,
                _audio_path: &Path,
                _progress: &dyn ProgressSink,
            ) -> Result<String, RemoteError> {
                Err(RemoteError::Generation {
                    attempts: 5,
                    message: "remote down".to_string(),
                })
            }

            async fn summarize(
                &self,
                _transcript: &str,
                _progress: &dyn ProgressSink,
            ) -> Result<String, RemoteError> {
                Ok("unused".to_string())
            }
        }

        let work_dir = tempfile::tempdir().unwrap();
        let ledger = Arc::new(JobLedger::new());
        let pipeline = Pipeline::new(
            Arc::new(FakeProbe { duration: 3900.0 }),
            Arc::new(FakeSegmenter),
            Arc::new(FailingRemote),
            ledger.clone(),
            Arc::new(NullStore),
            PipelineConfig {
                max_duration_seconds: 1800,
                segment_duration_seconds: 1800,
                chunk_concurrency: 4,
                work_dir: work_dir.path().to_path_buf(),
            },
        );

        let source = work_dir.path().join("job-g.mp4");
        tokio::fs::write(&source, b"media").await.unwrap();
        ledger.create(JobRecord::new("job-g", "meeting.mp4"));
        pipeline.run("job-g", &source).await;

        let record = ledger.get("job-g").unwrap();
        assert_eq!(record.status, JobStatus::Failed);
        assert!(record.error.unwrap().contains("remote down"));
        assert!(!source.exists());
        assert!(!work_dir.path().join("chunks_job-g").exists());
    }
}
