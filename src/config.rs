use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

const API_KEY_XOR_KEY: &[u8] = b"recap-local-key-v1";
const API_KEY_ENV: &str = "GEMINI_API_KEY";

pub const DEFAULT_MODEL: &str = "gemini-2.5-flash";
pub const DEFAULT_MAX_DURATION_SECONDS: u64 = 3600;
pub const DEFAULT_SEGMENT_DURATION_SECONDS: u64 = 900;
pub const DEFAULT_CHUNK_CONCURRENCY: usize = 4;
pub const DEFAULT_WORKER_COUNT: usize = 2;
pub const DEFAULT_POLL_INTERVAL_SECONDS: u64 = 10;

pub const DEFAULT_SUMMARY_PROMPT: &str = "\
Role: You are an expert corporate summarizer specializing in professional \
minutes of meetings and executive summaries for senior stakeholders.
Task: Analyze the provided call recording and produce a concise, \
well-structured, and formal summary.
Requirements:
- Capture the meeting objective, key discussion points, decisions made, \
action items with owners and deadlines, participants present, and next steps.
- Structure the output with clear sections and bullet points where \
appropriate (Meeting Objective, Key Discussions, Decisions, Action Items, \
Next Steps).
- Maintain an objective, neutral tone without personal opinions.
- The output must be immediately suitable for corporate documentation, \
ready to copy into an official email or report.
- Prohibited: any introductory phrases, closing remarks, or meta-commentary. \
Start directly with the formatted summary in markdown.";

pub const DEFAULT_TRANSCRIPTION_PROMPT: &str = "\
Role: You are a highly accurate verbatim transcription service.
Task: Transcribe the provided audio exactly as spoken.
Requirements:
- Capture every word exactly, including filler words, pauses, false starts, \
and grammatical errors.
- Do not paraphrase, interpret, or summarize.
- Output only the raw transcript with no headings, introductions, or \
commentary.";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub model: String,
    pub summary_prompt: String,
    pub transcription_prompt: String,
    /// Recordings at or under this length take the direct path.
    pub max_duration_seconds: u64,
    /// Chunk length for the chunked path.
    pub segment_duration_seconds: u64,
    /// Simultaneous chunk transcriptions per job. 1 degrades to the
    /// conservative sequential mode.
    pub chunk_concurrency: usize,
    /// Jobs processed at once across the whole service.
    pub worker_count: usize,
    /// Interval between remote file state polls.
    pub poll_interval_seconds: u64,
    pub api_key_obfuscated: Option<String>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            model: DEFAULT_MODEL.to_string(),
            summary_prompt: DEFAULT_SUMMARY_PROMPT.to_string(),
            transcription_prompt: DEFAULT_TRANSCRIPTION_PROMPT.to_string(),
            max_duration_seconds: DEFAULT_MAX_DURATION_SECONDS,
            segment_duration_seconds: DEFAULT_SEGMENT_DURATION_SECONDS,
            chunk_concurrency: DEFAULT_CHUNK_CONCURRENCY,
            worker_count: DEFAULT_WORKER_COUNT,
            poll_interval_seconds: DEFAULT_POLL_INTERVAL_SECONDS,
            api_key_obfuscated: None,
        }
    }
}

impl AppConfig {
    /// Resolve the remote API key. The environment wins over the stored
    /// (obfuscated) key so deployments can rotate keys without touching
    /// the settings file.
    pub fn api_key(&self) -> Option<String> {
        let _ = dotenvy::dotenv();

        std::env::var(API_KEY_ENV)
            .ok()
            .filter(|key| !key.trim().is_empty())
            .or_else(|| {
                self.api_key_obfuscated
                    .as_deref()
                    .and_then(deobfuscate_api_key)
            })
    }

    pub fn set_api_key(&mut self, api_key: &str) {
        let trimmed = api_key.trim();
        self.api_key_obfuscated = if trimmed.is_empty() {
            None
        } else {
            Some(obfuscate_api_key(trimmed))
        };
    }

    pub fn api_key_masked(&self) -> Option<String> {
        self.api_key_obfuscated
            .as_deref()
            .and_then(deobfuscate_api_key)
            .map(|key| mask_api_key(&key))
    }
}

pub fn load_or_create(path: &Path) -> Result<AppConfig, String> {
    if !path.exists() {
        let config = AppConfig::default();
        save(path, &config)?;
        return Ok(config);
    }

    let raw = fs::read_to_string(path).map_err(|e| format!("Failed to read config: {}", e))?;
    match serde_json::from_str::<AppConfig>(&raw) {
        Ok(mut config) => {
            normalize_config(&mut config);
            Ok(config)
        }
        Err(_) => {
            let backup = path.with_extension("json.bak");
            let _ = fs::copy(path, backup);
            tracing::warn!("Config file was corrupt, regenerating defaults");
            let config = AppConfig::default();
            save(path, &config)?;
            Ok(config)
        }
    }
}

pub fn save(path: &Path, config: &AppConfig) -> Result<(), String> {
    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir).map_err(|e| format!("Failed to create config dir: {}", e))?;
    }
    save_raw(&path.to_path_buf(), config)
}

fn save_raw(path: &PathBuf, config: &AppConfig) -> Result<(), String> {
    let json = serde_json::to_string_pretty(config)
        .map_err(|e| format!("Failed to serialize config: {}", e))?;
    fs::write(path, json).map_err(|e| format!("Failed to save config: {}", e))
}

fn normalize_config(config: &mut AppConfig) {
    if config.model.trim().is_empty() {
        config.model = DEFAULT_MODEL.to_string();
    }
    if config.summary_prompt.trim().is_empty() {
        config.summary_prompt = DEFAULT_SUMMARY_PROMPT.to_string();
    }
    if config.transcription_prompt.trim().is_empty() {
        config.transcription_prompt = DEFAULT_TRANSCRIPTION_PROMPT.to_string();
    }
    if config.max_duration_seconds == 0 {
        config.max_duration_seconds = DEFAULT_MAX_DURATION_SECONDS;
    }
    if config.segment_duration_seconds == 0 {
        config.segment_duration_seconds = DEFAULT_SEGMENT_DURATION_SECONDS;
    }
    if config.chunk_concurrency == 0 {
        config.chunk_concurrency = DEFAULT_CHUNK_CONCURRENCY;
    }
    if config.worker_count == 0 {
        config.worker_count = DEFAULT_WORKER_COUNT;
    }
    if config.poll_interval_seconds == 0 {
        config.poll_interval_seconds = DEFAULT_POLL_INTERVAL_SECONDS;
    }
}

fn obfuscate_api_key(api_key: &str) -> String {
    let mut bytes = api_key.as_bytes().to_vec();
    for (idx, byte) in bytes.iter_mut().enumerate() {
        *byte ^= API_KEY_XOR_KEY[idx % API_KEY_XOR_KEY.len()];
    }
    BASE64_STANDARD.encode(bytes)
}

fn deobfuscate_api_key(obfuscated: &str) -> Option<String> {
    let mut bytes = BASE64_STANDARD.decode(obfuscated).ok()?;
    for (idx, byte) in bytes.iter_mut().enumerate() {
        *byte ^= API_KEY_XOR_KEY[idx % API_KEY_XOR_KEY.len()];
    }
    String::from_utf8(bytes).ok()
}

fn mask_api_key(api_key: &str) -> String {
    if api_key.len() <= 10 {
        return "******".to_string();
    }

    let prefix = &api_key[..6];
    let suffix = &api_key[api_key.len().saturating_sub(4)..];
    format!("{}********{}", prefix, suffix)
}
