use thiserror::Error;

/// Invalid startup configuration. Always fatal: the host refuses to start.
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("tier budget {tier} must be >= 0 MB, got {value}")]
    InvalidTierBudget { tier: &'static str, value: f64 },

    #[error("L1 budget must be greater than 0 MB")]
    EmptyHotTier,

    #[error("chunk duration must be a positive number of seconds, got {0}")]
    InvalidChunkDuration(f64),

    #[error("{name} must be within 0.0..=1.0, got {value}")]
    OutOfUnitRange { name: &'static str, value: f64 },

    #[error("warning threshold ({warning}) must be below critical threshold ({critical})")]
    ThresholdOrder { warning: f64, critical: f64 },

    #[error("{0} must be greater than 0")]
    Zero(&'static str),

    #[error("failed to read configuration: {0}")]
    Source(String),
}

/// A chunk could not be produced. The chunk stays missing and is retried on a
/// later worker tick.
#[derive(Debug, Error)]
pub enum ProcessingError {
    #[error("track {0} not found in library")]
    TrackNotFound(u64),

    #[error("chunk {chunk_idx} is past the end of track {track_id}")]
    ChunkOutOfRange { track_id: u64, chunk_idx: u32 },

    #[error("decode failed: {0}")]
    Decode(String),

    #[error("artifact I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("processor task aborted: {0}")]
    Aborted(String),
}
