use super::JobLedger;
use serde::Serialize;
use std::sync::Arc;

/// One progress observation for a job. Percent is monotonically
/// non-decreasing for a given job; the ledger enforces that.
#[derive(Debug, Clone, Serialize)]
pub struct ProgressEvent {
    pub percent: u8,
    pub message: String,
}

/// Capability object passed down the pipeline so deep call sites (retry
/// loops, chunk workers) can surface progress without touching shared state
/// directly. Implementations must be non-blocking and must not panic back
/// into the pipeline.
pub trait ProgressSink: Send + Sync {
    /// Report a new percent and message.
    fn update(&self, percent: u8, message: &str);

    /// Report a message only, leaving percent where it is. Used for
    /// transient notices like retry attempts.
    fn status(&self, message: &str);
}

/// Binds a progress sink to one job entry in the shared ledger.
pub struct LedgerProgress {
    ledger: Arc<JobLedger>,
    job_id: String,
}

impl LedgerProgress {
    pub fn new(ledger: Arc<JobLedger>, job_id: impl Into<String>) -> Self {
        Self {
            ledger,
            job_id: job_id.into(),
        }
    }
}

impl ProgressSink for LedgerProgress {
    fn update(&self, percent: u8, message: &str) {
        tracing::info!("Job {}: {}% - {}", self.job_id, percent, message);
        self.ledger.set_progress(&self.job_id, percent, message);
    }

    fn status(&self, message: &str) {
        tracing::info!("Job {}: {}", self.job_id, message);
        self.ledger.update(&self.job_id, |record| {
            record.status_message = message.to_string();
        });
    }
}

/// Sink for callers without a job entry (one-off client use, tests).
pub struct NullProgress;

impl ProgressSink for NullProgress {
    fn update(&self, _percent: u8, _message: &str) {}
    fn status(&self, _message: &str) {}
}
