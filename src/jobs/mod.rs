use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::sync::Mutex;
use thiserror::Error;

pub mod progress;

pub use progress::{LedgerProgress, NullProgress, ProgressEvent, ProgressSink};

/// Lifecycle of a job. `Completed` and `Failed` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

/// Snapshot of one job as seen by pollers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: String,
    pub filename: String,
    pub status: JobStatus,
    pub progress: u8,
    pub status_message: String,
    pub summary: Option<String>,
    pub transcript: Option<String>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl JobRecord {
    pub fn new(id: impl Into<String>, filename: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            filename: filename.into(),
            status: JobStatus::Pending,
            progress: 0,
            status_message: "Queued".to_string(),
            summary: None,
            transcript: None,
            error: None,
            created_at: Utc::now(),
            completed_at: None,
        }
    }

    /// The progress view pollers render: percent plus the latest message.
    pub fn progress_event(&self) -> ProgressEvent {
        ProgressEvent {
            percent: self.progress,
            message: self.status_message.clone(),
        }
    }
}

/// Concurrency-safe in-memory map of job id to record.
///
/// All mutation goes through `update` under a single mutex so progress
/// callbacks from parallel chunk workers never interleave a partial write.
/// Readers always get a cloned snapshot, never a live reference.
pub struct JobLedger {
    jobs: Mutex<HashMap<String, JobRecord>>,
}

impl JobLedger {
    pub fn new() -> Self {
        Self {
            jobs: Mutex::new(HashMap::new()),
        }
    }

    pub fn create(&self, record: JobRecord) {
        let mut jobs = self.jobs.lock().expect("job ledger poisoned");
        jobs.insert(record.id.clone(), record);
    }

    pub fn get(&self, id: &str) -> Option<JobRecord> {
        let jobs = self.jobs.lock().expect("job ledger poisoned");
        jobs.get(id).cloned()
    }

    pub fn update<F>(&self, id: &str, mutator: F) -> Option<JobRecord>
    where
        F: FnOnce(&mut JobRecord),
    {
        let mut jobs = self.jobs.lock().expect("job ledger poisoned");
        let record = jobs.get_mut(id)?;
        mutator(record);
        Some(record.clone())
    }

    /// Set progress for a job, clamped so percent never regresses.
    pub fn set_progress(&self, id: &str, percent: u8, message: &str) {
        self.update(id, |record| {
            record.progress = record.progress.max(percent.min(100));
            record.status_message = message.to_string();
        });
    }
}

impl Default for JobLedger {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("failed to read history: {0}")]
    Read(#[source] std::io::Error),

    #[error("failed to write history: {0}")]
    Write(#[source] std::io::Error),

    #[error("failed to encode history: {0}")]
    Encode(#[source] serde_json::Error),
}

/// Persistence collaborator. Called best-effort at job creation and at the
/// terminal transition; callers tolerate failure.
pub trait JobStore: Send + Sync {
    fn save(&self, record: &JobRecord) -> Result<(), StoreError>;
}

/// Appends job records into a single JSON file keyed by job id.
///
/// A missing or corrupt file is treated as an empty history rather than an
/// error, so one bad write never wedges future persistence.
pub struct JsonHistoryStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl JsonHistoryStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }
}

impl JobStore for JsonHistoryStore {
    fn save(&self, record: &JobRecord) -> Result<(), StoreError> {
        let _guard = self.lock.lock().expect("history lock poisoned");

        let mut history: HashMap<String, JobRecord> = match fs::read_to_string(&self.path) {
            Ok(raw) => serde_json::from_str(&raw).unwrap_or_else(|e| {
                tracing::warn!("History file unreadable, starting fresh: {}", e);
                HashMap::new()
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
            Err(e) => return Err(StoreError::Read(e)),
        };

        history.insert(record.id.clone(), record.clone());

        let json = serde_json::to_string_pretty(&history).map_err(StoreError::Encode)?;
        fs::write(&self.path, json).map_err(StoreError::Write)?;

        tracing::info!("Persisted job {} ({:?})", record.id, record.status);
        Ok(())
    }
}

/// No-op store for callers that do not persist history.
pub struct NullStore;

impl JobStore for NullStore {
    fn save(&self, _record: &JobRecord) -> Result<(), StoreError> {
        Ok(())
    }
}
