use async_trait::async_trait;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::process::Command;
use tokio::task::JoinSet;

// Re-encode target: audio-only, small and uniform for the remote service.
const AUDIO_CODEC: &str = "libmp3lame";
const AUDIO_BITRATE: &str = "64k";
const AUDIO_SAMPLE_RATE: &str = "16000";
const CHUNK_EXTENSION: &str = "mp3";

#[derive(Debug, Error)]
pub enum SegmentationError {
    #[error("failed to create chunk directory: {0}")]
    OutputDir(#[source] std::io::Error),

    #[error("failed to run ffmpeg: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("chunk {index} extraction failed: {stderr}")]
    Extraction { index: usize, stderr: String },

    #[error("chunk worker panicked: {0}")]
    Worker(String),
}

/// One time-bounded extract of the source recording. Chunks are strictly
/// ordered by `index` and cover `[0, duration)` with no gaps or overlaps.
#[derive(Debug, Clone, PartialEq)]
pub struct ChunkSpec {
    pub index: usize,
    pub start_offset: f64,
    pub length: f64,
    pub output_path: PathBuf,
}

/// Plan the chunk boundaries for a recording. Deterministic given
/// `(duration, segment_duration)`; output files are named
/// `<stem>_chunk_<n>.mp3`, 1-indexed, so re-running is idempotent.
pub fn plan_chunks(
    duration: f64,
    segment_duration: f64,
    source: &Path,
    output_dir: &Path,
) -> Vec<ChunkSpec> {
    if duration <= 0.0 || segment_duration <= 0.0 {
        return Vec::new();
    }

    let stem = source
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "recording".to_string());

    let count = (duration / segment_duration).ceil() as usize;
    (0..count)
        .map(|index| {
            let start_offset = index as f64 * segment_duration;
            ChunkSpec {
                index,
                start_offset,
                length: segment_duration.min(duration - start_offset),
                output_path: output_dir.join(format!(
                    "{}_chunk_{}.{}",
                    stem,
                    index + 1,
                    CHUNK_EXTENSION
                )),
            }
        })
        .collect()
}

/// Splits a long recording into fixed-duration audio-only chunks.
#[async_trait]
pub trait Segmenter: Send + Sync {
    async fn split(
        &self,
        source: &Path,
        duration: f64,
        segment_duration: f64,
        output_dir: &Path,
    ) -> Result<Vec<ChunkSpec>, SegmentationError>;
}

/// ffmpeg-backed segmenter.
///
/// Extraction runs all chunks concurrently first for speed. If any chunk
/// fails, all partial output is discarded and the entire split is retried
/// sequentially before giving up. Sequential failure is fatal to the job.
pub struct FfmpegSegmenter {
    binary: String,
}

impl FfmpegSegmenter {
    pub fn new() -> Self {
        Self {
            binary: "ffmpeg".to_string(),
        }
    }

    pub fn with_binary(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    async fn split_parallel(
        &self,
        source: &Path,
        chunks: &[ChunkSpec],
    ) -> Result<(), SegmentationError> {
        let mut tasks = JoinSet::new();
        for chunk in chunks {
            let binary = self.binary.clone();
            let source = source.to_path_buf();
            let chunk = chunk.clone();
            tasks.spawn(async move { extract_chunk(&binary, &source, &chunk).await });
        }

        let mut first_error = None;
        while let Some(joined) = tasks.join_next().await {
            let result = joined.map_err(|e| SegmentationError::Worker(e.to_string()))?;
            if let Err(e) = result {
                first_error.get_or_insert(e);
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    async fn split_sequential(
        &self,
        source: &Path,
        chunks: &[ChunkSpec],
    ) -> Result<(), SegmentationError> {
        for chunk in chunks {
            extract_chunk(&self.binary, source, chunk).await?;
        }
        Ok(())
    }
}

impl Default for FfmpegSegmenter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Segmenter for FfmpegSegmenter {
    async fn split(
        &self,
        source: &Path,
        duration: f64,
        segment_duration: f64,
        output_dir: &Path,
    ) -> Result<Vec<ChunkSpec>, SegmentationError> {
        let chunks = plan_chunks(duration, segment_duration, source, output_dir);
        if chunks.is_empty() {
            return Ok(chunks);
        }

        tokio::fs::create_dir_all(output_dir)
            .await
            .map_err(SegmentationError::OutputDir)?;

        tracing::info!(
            "Splitting {} into {} chunks of {:.0}s",
            source.display(),
            chunks.len(),
            segment_duration
        );

        if let Err(e) = self.split_parallel(source, &chunks).await {
            tracing::warn!(
                "Parallel chunk extraction failed ({}), retrying sequentially",
                e
            );
            discard_chunk_files(&chunks).await;

            if let Err(e) = self.split_sequential(source, &chunks).await {
                discard_chunk_files(&chunks).await;
                return Err(e);
            }
        }

        tracing::info!("Split complete: {} chunks", chunks.len());
        Ok(chunks)
    }
}

async fn extract_chunk(
    binary: &str,
    source: &Path,
    chunk: &ChunkSpec,
) -> Result<(), SegmentationError> {
    tracing::debug!(
        "Extracting chunk {} ({:.1}s + {:.1}s)",
        chunk.index + 1,
        chunk.start_offset,
        chunk.length
    );

    let output = Command::new(binary)
        .arg("-y")
        .arg("-v")
        .arg("error")
        .arg("-ss")
        .arg(format!("{}", chunk.start_offset))
        .arg("-t")
        .arg(format!("{}", chunk.length))
        .arg("-i")
        .arg(source)
        .arg("-vn")
        .arg("-acodec")
        .arg(AUDIO_CODEC)
        .arg("-b:a")
        .arg(AUDIO_BITRATE)
        .arg("-ar")
        .arg(AUDIO_SAMPLE_RATE)
        .arg("-ac")
        .arg("1")
        .arg(&chunk.output_path)
        .output()
        .await
        .map_err(SegmentationError::Spawn)?;

    if !output.status.success() {
        return Err(SegmentationError::Extraction {
            index: chunk.index,
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }

    Ok(())
}

async fn discard_chunk_files(chunks: &[ChunkSpec]) {
    for chunk in chunks {
        if let Err(e) = tokio::fs::remove_file(&chunk.output_path).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(
                    "Failed to discard partial chunk {}: {}",
                    chunk.output_path.display(),
                    e
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plan(duration: f64, segment: f64) -> Vec<ChunkSpec> {
        plan_chunks(
            duration,
            segment,
            Path::new("/tmp/meeting.mp4"),
            Path::new("/tmp/chunks"),
        )
    }

    #[test]
    fn test_chunk_count_is_ceiling() {
        assert_eq!(plan(3600.0, 900.0).len(), 4);
        assert_eq!(plan(3601.0, 900.0).len(), 5);
        assert_eq!(plan(899.0, 900.0).len(), 1);
    }

    #[test]
    fn test_coverage_is_exact_and_gapless() {
        let chunks = plan(3912.48, 900.0);

        let mut expected_start = 0.0;
        for (i, chunk) in chunks.iter().enumerate() {
            assert_eq!(chunk.index, i);
            assert!((chunk.start_offset - expected_start).abs() < 1e-9);
            expected_start += chunk.length;
        }
        assert!((expected_start - 3912.48).abs() < 1e-9);
    }

    #[test]
    fn test_last_chunk_is_the_remainder() {
        // 65 minutes at 30-minute segments: 30, 30, 5.
        let chunks = plan(3900.0, 1800.0);
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0].length, 1800.0);
        assert_eq!(chunks[1].length, 1800.0);
        assert_eq!(chunks[2].length, 300.0);
        assert_eq!(chunks[2].start_offset, 3600.0);
    }

    #[test]
    fn test_chunk_naming_is_deterministic_and_one_indexed() {
        let chunks = plan(2000.0, 900.0);
        assert_eq!(
            chunks[0].output_path,
            Path::new("/tmp/chunks/meeting_chunk_1.mp3")
        );
        assert_eq!(
            chunks[2].output_path,
            Path::new("/tmp/chunks/meeting_chunk_3.mp3")
        );
        assert_eq!(plan(2000.0, 900.0), chunks);
    }

    #[test]
    fn test_zero_duration_plans_no_chunks() {
        assert!(plan(0.0, 900.0).is_empty());
        assert!(plan(100.0, 0.0).is_empty());
    }

    #[tokio::test]
    async fn test_split_with_empty_plan_skips_extraction() {
        let segmenter = FfmpegSegmenter::new();
        let chunks = segmenter
            .split(
                Path::new("/tmp/missing.mp4"),
                0.0,
                900.0,
                Path::new("/tmp/chunks"),
            )
            .await
            .unwrap();
        assert!(chunks.is_empty());
    }

    #[tokio::test]
    async fn test_failed_split_leaves_no_partial_output() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("broken.mp4");
        tokio::fs::write(&source, b"not a real container").await.unwrap();
        let out_dir = dir.path().join("chunks");

        let segmenter = FfmpegSegmenter::new();
        let result = segmenter.split(&source, 1800.0, 900.0, &out_dir).await;

        assert!(result.is_err());
        if out_dir.exists() {
            let leftovers: Vec<_> = std::fs::read_dir(&out_dir).unwrap().collect();
            assert!(leftovers.is_empty(), "partial chunks were not discarded");
        }
    }
}
