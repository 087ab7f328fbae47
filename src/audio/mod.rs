//! # Audio Module
//!
//! Everything the cache needs to know about audio, and nothing more.
//!
//! ## Architecture
//!
//! ### [`preset`] - Processing Styles
//! - The fixed set of presets a chunk can be rendered with
//! - Declaration order used for deterministic tie-breaking
//!
//! ### [`processor`] - Collaborator Contracts
//! - [`ChunkProcessor`]: renders one chunk (stateful, non-reentrant)
//! - [`TrackLookup`]: resolves a track id to its source file
//!
//! ### [`lock`] - Processing Lock
//! - One mutex guarding the processor's internal state
//! - Async, blocking and already-exclusive call shapes
//!
//! ### [`decoder`] - File-backed Processor
//! - Decodes a chunk window with Symphonia
//! - Light preset shaping with envelope-follower state
//! - Persists and reuses raw artifacts keyed by [`crate::cache::ChunkCacheKeys`]
//!
//! ## Audio Format
//!
//! - **Samples**: interleaved `f32`
//! - **Sample Width**: 4 bytes
//! - **Channels / Rate**: taken from the source, rate falls back to the configured default

pub mod decoder;
pub mod lock;
pub mod preset;
pub mod processor;

pub use decoder::FileChunkProcessor;
pub use lock::{ExclusiveProcessor, ProcessingLock};
pub use preset::Preset;
pub use processor::{ChunkProcessor, ProcessedChunk, TrackLookup, SAMPLE_WIDTH};

#[cfg(test)]
pub use processor::MockTrackLookup;
