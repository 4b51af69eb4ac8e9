mod gemini;
mod retry;

pub use gemini::{GeminiClient, RemoteConfig};
pub use retry::RetryPolicy;

use crate::jobs::ProgressSink;
use async_trait::async_trait;
use std::path::Path;
use thiserror::Error;

/// Remote capability failures. All are non-recoverable at this layer and
/// propagate to the orchestrator.
#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("upload failed: {0}")]
    Upload(String),

    #[error("remote processing failed for {0}")]
    ProcessingFailed(String),

    #[error("generation failed after {attempts} attempts: {message}")]
    Generation { attempts: u32, message: String },

    #[error("remote request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("unexpected response from remote service: {0}")]
    Api(String),

    #[error("remote capability is not configured: {0}")]
    NotConfigured(String),
}

/// The external transcribe/summarize service, treated as a black box with
/// its own asynchronous processing states.
#[async_trait]
pub trait RemoteCapability: Send + Sync {
    /// Transcribe one audio unit (a whole short recording or one chunk).
    async fn transcribe(
        &self,
        audio_path: &Path,
        progress: &dyn ProgressSink,
    ) -> Result<String, RemoteError>;

    /// Summarize a full transcript.
    async fn summarize(
        &self,
        transcript: &str,
        progress: &dyn ProgressSink,
    ) -> Result<String, RemoteError>;
}
