pub mod probe;
pub mod splitter;

pub use probe::{DurationProbe, FfprobeProbe, ProbeError};
pub use splitter::{plan_chunks, ChunkSpec, FfmpegSegmenter, SegmentationError, Segmenter};

use std::path::{Path, PathBuf};

/// A probed media file: where it lives and how long it plays. Duration is
/// fixed at probe time; nothing downstream re-measures it.
#[derive(Debug, Clone)]
pub struct MediaReference {
    pub path: PathBuf,
    pub duration_seconds: f64,
}

impl MediaReference {
    pub fn new(path: &Path, duration_seconds: f64) -> Self {
        Self {
            path: path.to_path_buf(),
            duration_seconds,
        }
    }
}
