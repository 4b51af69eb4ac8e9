use super::RemoteError;
use crate::jobs::ProgressSink;
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;

const DEFAULT_MAX_ATTEMPTS: u32 = 5;
const DEFAULT_BASE_DELAY: Duration = Duration::from_secs(2);
const JITTER_CEILING_MS: u64 = 250;

/// Exponential backoff for remote generation calls.
pub struct RetryPolicy {
    max_attempts: u32,
    base_delay: Duration,
}

impl RetryPolicy {
    pub fn new() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            base_delay: DEFAULT_BASE_DELAY,
        }
    }

    pub fn with_limits(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Run `call` until it succeeds or the attempt ceiling is hit. Every
    /// failure is treated as potentially retryable; after the final attempt
    /// the last error is surfaced as `RemoteError::Generation`. Each retry
    /// notifies the progress sink so pollers see "retrying (n/5)".
    pub async fn run<T, F, Fut>(
        &self,
        operation: &str,
        progress: &dyn ProgressSink,
        mut call: F,
    ) -> Result<T, RemoteError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, RemoteError>>,
    {
        let mut attempt = 0u32;
        loop {
            match call().await {
                Ok(value) => return Ok(value),
                Err(e) => {
                    attempt += 1;
                    if attempt >= self.max_attempts {
                        tracing::error!(
                            "{} failed after {} attempts: {}",
                            operation,
                            attempt,
                            e
                        );
                        return Err(RemoteError::Generation {
                            attempts: attempt,
                            message: e.to_string(),
                        });
                    }

                    tracing::warn!(
                        "{} attempt {}/{} failed: {}",
                        operation,
                        attempt,
                        self.max_attempts,
                        e
                    );
                    progress.status(&format!(
                        "{} retrying ({}/{})",
                        operation,
                        attempt + 1,
                        self.max_attempts
                    ));
                    self.wait_before_retry(attempt - 1).await;
                }
            }
        }
    }

    async fn wait_before_retry(&self, attempt: u32) {
        let multiplier = 2u64.saturating_pow(attempt);
        let delay = self
            .base_delay
            .saturating_mul(multiplier.min(u32::MAX as u64) as u32)
            + jitter();

        tracing::info!("Retrying in {:.1}s (attempt {})", delay.as_secs_f32(), attempt + 2);
        sleep(delay).await;
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new()
    }
}

fn jitter() -> Duration {
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.subsec_nanos())
        .unwrap_or(0) as u64;
    Duration::from_millis(nanos % JITTER_CEILING_MS)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::NullProgress;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    struct RecordingSink {
        messages: Mutex<Vec<String>>,
    }

    impl RecordingSink {
        fn new() -> Self {
            Self {
                messages: Mutex::new(Vec::new()),
            }
        }
    }

    impl ProgressSink for RecordingSink {
        fn update(&self, _percent: u8, _message: &str) {}
        fn status(&self, message: &str) {
            self.messages.lock().unwrap().push(message.to_string());
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_succeeds_on_fifth_attempt() {
        let policy = RetryPolicy::new();
        let calls = AtomicU32::new(0);

        let result = policy
            .run("generation", &NullProgress, || {
                let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                async move {
                    if n < 5 {
                        Err(RemoteError::Api(format!("transient {}", n)))
                    } else {
                        Ok("summary text".to_string())
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), "summary text");
        assert_eq!(calls.load(Ordering::SeqCst), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhaustion_surfaces_last_error() {
        let policy = RetryPolicy::new();
        let calls = AtomicU32::new(0);

        let result: Result<String, _> = policy
            .run("generation", &NullProgress, || {
                let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                async move { Err(RemoteError::Api(format!("boom {}", n))) }
            })
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 5);
        match result {
            Err(RemoteError::Generation { attempts, message }) => {
                assert_eq!(attempts, 5);
                assert!(message.contains("boom 5"));
            }
            other => panic!("expected Generation error, got {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_each_retry_notifies_sink() {
        let policy = RetryPolicy::new();
        let sink = RecordingSink::new();
        let calls = AtomicU32::new(0);

        let _: Result<String, _> = policy
            .run("Transcription", &sink, || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(RemoteError::Api("down".to_string())) }
            })
            .await;

        let messages = sink.messages.lock().unwrap();
        assert_eq!(messages.len(), 4);
        assert_eq!(messages[0], "Transcription retrying (2/5)");
        assert_eq!(messages[3], "Transcription retrying (5/5)");
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_success_needs_no_retry() {
        let policy = RetryPolicy::new();
        let result = policy
            .run("generation", &NullProgress, || async { Ok(42u32) })
            .await;
        assert_eq!(result.unwrap(), 42);
    }
}
