//! # Preset Cache
//!
//! Predictive multi-tier cache of processed audio chunks, so that playback
//! and preset switches never wait on processing.
//!
//! ## Layout
//!
//! - [`cache`]: byte-budgeted tiers (L1/L2/L3) and on-disk artifact keys
//! - [`prediction`]: preset transition model and audio-content affinity
//! - [`buffer`]: the orchestrator that plans residency, and its background
//!   worker
//! - [`memory`]: memory monitor and degradation levels
//! - [`tuning`]: periodic self-tuning loop
//! - [`audio`]: presets, the processor contract, the processing lock and the
//!   file-backed processor
//! - [`storage`]: JSON track library
//!
//! Everything is constructed explicitly by the host; there are no globals.

pub mod audio;
pub mod buffer;
pub mod cache;
pub mod config;
pub mod error;
pub mod memory;
pub mod prediction;
pub mod storage;
pub mod tuning;

pub use buffer::{BufferManager, CacheStats};
pub use config::Config;
pub use error::{ConfigError, ProcessingError};
