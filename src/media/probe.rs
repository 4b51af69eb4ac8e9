use async_trait::async_trait;
use serde::Deserialize;
use std::path::Path;
use thiserror::Error;
use tokio::process::Command;

#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("failed to run ffprobe: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("media file is unreadable or has no decodable stream: {0}")]
    Unreadable(String),

    #[error("no duration in container metadata")]
    NoDuration,
}

/// Determines a media file's duration from container metadata only.
#[async_trait]
pub trait DurationProbe: Send + Sync {
    async fn duration_seconds(&self, path: &Path) -> Result<f64, ProbeError>;
}

/// Shells out to ffprobe. Read-only; never buffers media payload.
pub struct FfprobeProbe {
    binary: String,
}

impl FfprobeProbe {
    pub fn new() -> Self {
        Self {
            binary: "ffprobe".to_string(),
        }
    }

    pub fn with_binary(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }
}

impl Default for FfprobeProbe {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Deserialize)]
struct FfprobeOutput {
    format: Option<FfprobeFormat>,
}

#[derive(Debug, Deserialize)]
struct FfprobeFormat {
    duration: Option<String>,
}

#[async_trait]
impl DurationProbe for FfprobeProbe {
    async fn duration_seconds(&self, path: &Path) -> Result<f64, ProbeError> {
        let output = Command::new(&self.binary)
            .arg("-v")
            .arg("error")
            .arg("-show_entries")
            .arg("format=duration")
            .arg("-print_format")
            .arg("json")
            .arg(path)
            .output()
            .await
            .map_err(ProbeError::Spawn)?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            return Err(ProbeError::Unreadable(stderr));
        }

        let parsed: FfprobeOutput =
            serde_json::from_slice(&output.stdout).map_err(|_| ProbeError::NoDuration)?;

        let duration = parsed
            .format
            .and_then(|f| f.duration)
            .and_then(|d| d.parse::<f64>().ok())
            .ok_or(ProbeError::NoDuration)?;

        tracing::info!("Probed {}: {:.1}s", path.display(), duration);
        Ok(duration)
    }
}
