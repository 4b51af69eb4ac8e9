use super::retry::RetryPolicy;
use super::{RemoteCapability, RemoteError};
use crate::config::AppConfig;
use crate::jobs::ProgressSink;
use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::OnceLock;
use std::time::Duration;
use tokio::time::sleep;

const BASE_URL: &str = "https://generativelanguage.googleapis.com";
const HTTP_TIMEOUT_SECS: u64 = 600;

#[derive(Debug, Clone)]
pub struct RemoteConfig {
    pub api_key: String,
    pub model: String,
    pub transcription_prompt: String,
    pub summary_prompt: String,
    pub poll_interval: Duration,
}

impl RemoteConfig {
    pub fn from_app_config(config: &AppConfig) -> Result<Self, RemoteError> {
        let api_key = config
            .api_key()
            .ok_or_else(|| RemoteError::NotConfigured("no API key available".to_string()))?;

        Ok(Self {
            api_key,
            model: config.model.clone(),
            transcription_prompt: config.transcription_prompt.clone(),
            summary_prompt: config.summary_prompt.clone(),
            poll_interval: Duration::from_secs(config.poll_interval_seconds),
        })
    }
}

/// Remote file lifecycle as reported by the service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
enum RemoteFileState {
    Processing,
    Active,
    Failed,
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RemoteFile {
    name: String,
    uri: String,
    state: RemoteFileState,
    mime_type: Option<String>,
}

#[derive(Debug, Deserialize)]
struct UploadResponse {
    file: RemoteFile,
}

#[derive(Serialize)]
struct GenerateRequest<'a> {
    contents: Vec<Content<'a>>,
}

#[derive(Serialize)]
struct Content<'a> {
    parts: Vec<Part<'a>>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct Part<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    text: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    file_data: Option<FileData<'a>>,
}

impl<'a> Part<'a> {
    fn text(text: &'a str) -> Self {
        Self {
            text: Some(text),
            file_data: None,
        }
    }

    fn file(mime_type: &'a str, file_uri: &'a str) -> Self {
        Self {
            text: None,
            file_data: Some(FileData {
                mime_type,
                file_uri,
            }),
        }
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct FileData<'a> {
    mime_type: &'a str,
    file_uri: &'a str,
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    content: Option<CandidateContent>,
}

#[derive(Debug, Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<CandidatePart>,
}

#[derive(Debug, Deserialize)]
struct CandidatePart {
    text: Option<String>,
}

/// Gemini Files API adapter: upload, poll until ready, generate, delete.
pub struct GeminiClient {
    config: RemoteConfig,
    client: reqwest::Client,
    retry: RetryPolicy,
    base_url: String,
}

impl GeminiClient {
    pub fn new(config: RemoteConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(HTTP_TIMEOUT_SECS))
            .build()
            .expect("Failed to create HTTP client");

        tracing::info!("Gemini client initialized (model: {})", config.model);

        Self {
            config,
            client,
            retry: RetryPolicy::new(),
            base_url: BASE_URL.to_string(),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Point the client at a different endpoint, e.g. a local stand-in
    /// during tests or a regional proxy.
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    async fn upload(&self, path: &Path) -> Result<RemoteFile, RemoteError> {
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "upload".to_string());
        let mime = mime_for_path(path);

        tracing::info!("Uploading {} to Gemini...", path.display());

        let bytes = tokio::fs::read(path)
            .await
            .map_err(|e| RemoteError::Upload(format!("failed to read {}: {}", path.display(), e)))?;

        let metadata = serde_json::json!({ "file": { "display_name": file_name } });
        let metadata_part = reqwest::multipart::Part::text(metadata.to_string())
            .mime_str("application/json")
            .map_err(|e| RemoteError::Upload(e.to_string()))?;
        let file_part = reqwest::multipart::Part::bytes(bytes)
            .file_name(file_name)
            .mime_str(mime)
            .map_err(|e| RemoteError::Upload(e.to_string()))?;

        let form = reqwest::multipart::Form::new()
            .part("metadata", metadata_part)
            .part("file", file_part);

        let response = self
            .client
            .post(format!("{}/upload/v1beta/files", self.base_url))
            .query(&[("key", self.config.api_key.as_str())])
            .multipart(form)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(RemoteError::Upload(format!("HTTP {}: {}", status, body)));
        }

        let uploaded: UploadResponse = response
            .json()
            .await
            .map_err(|e| RemoteError::Api(e.to_string()))?;

        tracing::info!("File uploaded: {}", uploaded.file.name);
        Ok(uploaded.file)
    }

    /// Poll the remote file on a fixed interval until it leaves PROCESSING.
    async fn poll_until_ready(&self, file: RemoteFile) -> Result<RemoteFile, RemoteError> {
        let mut current = file;
        loop {
            match current.state {
                RemoteFileState::Active => return Ok(current),
                RemoteFileState::Failed => {
                    return Err(RemoteError::ProcessingFailed(current.name));
                }
                RemoteFileState::Processing | RemoteFileState::Unknown => {
                    tracing::debug!("Remote file {} still processing", current.name);
                    sleep(self.config.poll_interval).await;
                    current = self.get_file(&current.name).await?;
                }
            }
        }
    }

    async fn get_file(&self, name: &str) -> Result<RemoteFile, RemoteError> {
        let response = self
            .client
            .get(format!("{}/v1beta/{}", self.base_url, name))
            .query(&[("key", self.config.api_key.as_str())])
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(RemoteError::Api(format!("HTTP {}: {}", status, body)));
        }

        response
            .json::<RemoteFile>()
            .await
            .map_err(|e| RemoteError::Api(e.to_string()))
    }

    /// Delete the remote file handle. Runs on every path, success or
    /// failure; a delete failure is logged, never propagated over the
    /// pipeline's own result.
    async fn delete_file(&self, name: &str) {
        tracing::info!("Deleting remote file {}", name);
        let result = self
            .client
            .delete(format!("{}/v1beta/{}", self.base_url, name))
            .query(&[("key", self.config.api_key.as_str())])
            .send()
            .await;

        match result {
            Ok(response) if response.status().is_success() => {
                tracing::debug!("Remote file {} deleted", name);
            }
            Ok(response) => {
                tracing::error!(
                    "Failed to delete remote file {}: HTTP {}",
                    name,
                    response.status()
                );
            }
            Err(e) => {
                tracing::error!("Failed to delete remote file {}: {}", name, e);
            }
        }
    }

    async fn generate_once(&self, parts: Vec<Part<'_>>) -> Result<String, RemoteError> {
        let request = GenerateRequest {
            contents: vec![Content { parts }],
        };

        let response = self
            .client
            .post(format!(
                "{}/v1beta/models/{}:generateContent",
                self.base_url, self.config.model
            ))
            .query(&[("key", self.config.api_key.as_str())])
            .json(&request)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(RemoteError::Api(format!("HTTP {}: {}", status, body)));
        }

        let generated: GenerateResponse = response
            .json()
            .await
            .map_err(|e| RemoteError::Api(e.to_string()))?;

        let text = generated
            .candidates
            .into_iter()
            .filter_map(|c| c.content)
            .flat_map(|c| c.parts)
            .filter_map(|p| p.text)
            .collect::<Vec<_>>()
            .join("");

        if text.is_empty() {
            return Err(RemoteError::Api("response contained no text".to_string()));
        }

        Ok(text)
    }

    async fn generate_with_file(
        &self,
        operation: &str,
        prompt: &str,
        file: &RemoteFile,
        progress: &dyn ProgressSink,
    ) -> Result<String, RemoteError> {
        let mime = file.mime_type.as_deref().unwrap_or("audio/mpeg");
        self.retry
            .run(operation, progress, || {
                self.generate_once(vec![Part::text(prompt), Part::file(mime, &file.uri)])
            })
            .await
    }
}

#[async_trait]
impl RemoteCapability for GeminiClient {
    async fn transcribe(
        &self,
        audio_path: &Path,
        progress: &dyn ProgressSink,
    ) -> Result<String, RemoteError> {
        let file = self.upload(audio_path).await?;

        // Everything after upload shares one cleanup path: the remote
        // handle is deleted no matter how the inner steps end.
        let result = async {
            let ready = self.poll_until_ready(file.clone()).await?;
            self.generate_with_file(
                "Transcription",
                &self.config.transcription_prompt,
                &ready,
                progress,
            )
            .await
        }
        .await;

        self.delete_file(&file.name).await;

        let text = result?;
        Ok(clean_transcript(&text))
    }

    async fn summarize(
        &self,
        transcript: &str,
        progress: &dyn ProgressSink,
    ) -> Result<String, RemoteError> {
        // The transcript is already text, so it rides along inline; there
        // is no remote handle to poll or delete on this path.
        self.retry
            .run("Summary", progress, || {
                self.generate_once(vec![
                    Part::text(&self.config.summary_prompt),
                    Part::text(transcript),
                ])
            })
            .await
    }
}

fn mime_for_path(path: &Path) -> &'static str {
    match path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .as_deref()
    {
        Some("mp3") => "audio/mpeg",
        Some("wav") => "audio/wav",
        Some("m4a") => "audio/mp4",
        Some("ogg") => "audio/ogg",
        Some("flac") => "audio/flac",
        Some("mp4") => "video/mp4",
        Some("mov") => "video/quicktime",
        Some("webm") => "video/webm",
        Some("mkv") => "video/x-matroska",
        _ => "application/octet-stream",
    }
}

fn clean_transcript(text: &str) -> String {
    static TS_RE: OnceLock<Regex> = OnceLock::new();
    let re = TS_RE.get_or_init(|| {
        Regex::new(r"\[\d{2}:\d{2}.*?\]|\(\d{2}:\d{2}\)").expect("valid timestamp regex")
    });
    let stripped = re.replace_all(text, "");
    stripped.split_whitespace().collect::<Vec<_>>().join(" ")
}
