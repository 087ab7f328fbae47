use std::{path::PathBuf, sync::Arc};

use crate::{
    cache::{chunk_size_bytes, ChunkKey},
    error::ProcessingError,
};

/// Bytes per interleaved `f32` sample.
pub const SAMPLE_WIDTH: u16 = 4;

/// Output of one processor call.
#[derive(Debug, Clone)]
pub struct ProcessedChunk {
    /// Persisted artifact, if the processor wrote one.
    pub artifact: Option<PathBuf>,
    /// Interleaved decoded samples.
    pub samples: Arc<[f32]>,
    pub channels: u16,
    pub sample_rate: u32,
    pub size_bytes: u64,
}

impl ProcessedChunk {
    pub fn new(samples: Vec<f32>, channels: u16, sample_rate: u32) -> Self {
        let mut chunk = Self {
            artifact: None,
            samples: samples.into(),
            channels,
            sample_rate,
            size_bytes: 0,
        };
        chunk.size_bytes = chunk_size_bytes(chunk.duration_secs(), sample_rate, channels, SAMPLE_WIDTH);
        chunk
    }

    pub fn with_artifact(mut self, artifact: PathBuf) -> Self {
        self.artifact = Some(artifact);
        self
    }

    pub fn duration_secs(&self) -> f64 {
        if self.channels == 0 || self.sample_rate == 0 {
            return 0.0;
        }
        self.samples.len() as f64 / self.channels as f64 / self.sample_rate as f64
    }
}

/// Renders a chunk of a track with a preset.
///
/// Implementations keep mutable DSP state (envelope followers, filter
/// memories) and must never run twice at once; callers go through
/// [`super::ProcessingLock`].
pub trait ChunkProcessor: Send + 'static {
    fn process(&mut self, key: &ChunkKey) -> Result<ProcessedChunk, ProcessingError>;
}

/// Resolves track ids to source files.
#[cfg_attr(test, mockall::automock)]
pub trait TrackLookup {
    fn filepath_for(&self, track_id: u64) -> Option<PathBuf>;
}
