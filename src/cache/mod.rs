//! # Cache Module
//!
//! Bounded in-memory stores for processed audio chunks.
//!
//! Every chunk the player may need is identified by a [`ChunkKey`]
//! (track, preset, chunk index, intensity). The buffer orchestrator keeps three
//! [`CacheTier`] instances that only differ in capacity and in the minimum
//! probability an entry needs to be planned into them:
//!
//! - **L1 (hot)**: current and next chunk for every preset, so a preset switch
//!   never waits on processing.
//! - **L2 (warm)**: a deeper lookahead for the presets the user is most likely
//!   to switch to next.
//! - **L3 (long horizon)**: a long, low-probability runway for the current
//!   preset only.
//!
//! ## Eviction
//!
//! Tiers are budgeted in bytes. When an insert or a budget change pushes a
//! tier over its limit, the entry with the lowest `probability` goes first,
//! ties broken by the oldest timestamp. The order is deterministic for the
//! same input.
//!
//! ## Example Usage
//!
//! ```rust
//! use preset_cache::audio::Preset;
//! use preset_cache::cache::{CacheEntry, CacheTier, ChunkKey, TierName};
//!
//! let mut tier = CacheTier::new(TierName::L1, 1024, 0.0);
//! let key = ChunkKey::new(7, Preset::Punchy, 0, 1.0);
//! tier.add_entry(CacheEntry::new(key, 0.9, 512));
//!
//! assert!(tier.contains(&key));
//! assert_eq!(tier.stats().size_bytes, 512);
//! ```
//!
//! On-disk artifacts are addressed separately by [`chunk_keys::ChunkCacheKeys`].

pub mod chunk_keys;
pub mod tier;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::{fmt, path::PathBuf, str::FromStr};

use crate::audio::Preset;

pub use chunk_keys::ChunkCacheKeys;
pub use tier::CacheTier;

/// Identity of one cached chunk.
///
/// Intensity is stored in thousandths so the key is exact and hashable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ChunkKey {
    pub track_id: u64,
    pub preset: Preset,
    pub chunk_idx: u32,
    intensity_milli: u16,
}

impl ChunkKey {
    pub fn new(track_id: u64, preset: Preset, chunk_idx: u32, intensity: f32) -> Self {
        Self {
            track_id,
            preset,
            chunk_idx,
            intensity_milli: quantize_intensity(intensity),
        }
    }

    pub fn intensity(&self) -> f32 {
        self.intensity_milli as f32 / 1000.0
    }

    /// Same chunk, different preset.
    pub fn with_preset(self, preset: Preset) -> Self {
        Self { preset, ..self }
    }
}

impl fmt::Display for ChunkKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "track {} / {} / chunk {} @ {:.2}",
            self.track_id,
            self.preset,
            self.chunk_idx,
            self.intensity()
        )
    }
}

fn quantize_intensity(intensity: f32) -> u16 {
    let clamped = if intensity.is_finite() {
        intensity.clamp(0.0, 1.0)
    } else {
        0.0
    };
    (clamped * 1000.0).round() as u16
}

/// One resident chunk.
///
/// Only `probability` changes after creation; it is refreshed as predictions
/// move.
#[derive(Debug, Clone, Serialize)]
pub struct CacheEntry {
    pub key: ChunkKey,
    pub timestamp: DateTime<Utc>,
    pub probability: f64,
    pub size_bytes: u64,
    /// Location of the processed artifact, when the processor persisted one.
    pub artifact: Option<PathBuf>,
}

impl CacheEntry {
    pub fn new(key: ChunkKey, probability: f64, size_bytes: u64) -> Self {
        Self {
            key,
            timestamp: Utc::now(),
            probability: clamp_probability(probability),
            size_bytes,
            artifact: None,
        }
    }

    pub fn with_artifact(mut self, artifact: Option<PathBuf>) -> Self {
        self.artifact = artifact;
        self
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn track_id(&self) -> u64 {
        self.key.track_id
    }

    pub fn preset(&self) -> Preset {
        self.key.preset
    }

    pub fn chunk_idx(&self) -> u32 {
        self.key.chunk_idx
    }
}

pub(crate) fn clamp_probability(p: f64) -> f64 {
    if p.is_finite() {
        p.clamp(0.0, 1.0)
    } else {
        0.0
    }
}

/// Bytes occupied by a decoded chunk: duration x channels x sample width.
pub fn chunk_size_bytes(duration_secs: f64, sample_rate: u32, channels: u16, sample_width: u16) -> u64 {
    if !duration_secs.is_finite() || duration_secs <= 0.0 {
        return 0;
    }
    let frames = (duration_secs * sample_rate as f64).round() as u64;
    frames * channels as u64 * sample_width as u64
}

/// The three tiers, hottest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum TierName {
    L1,
    L2,
    L3,
}

impl TierName {
    pub const ALL: [TierName; 3] = [TierName::L1, TierName::L2, TierName::L3];

    pub fn as_str(&self) -> &'static str {
        match self {
            TierName::L1 => "L1",
            TierName::L2 => "L2",
            TierName::L3 => "L3",
        }
    }
}

impl fmt::Display for TierName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TierName {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_uppercase().as_str() {
            "L1" => Ok(TierName::L1),
            "L2" => Ok(TierName::L2),
            "L3" => Ok(TierName::L3),
            other => Err(format!("unknown tier '{}'", other)),
        }
    }
}

/// Snapshot of one tier.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TierStats {
    pub name: TierName,
    pub size_bytes: u64,
    pub max_size_bytes: u64,
    pub entry_count: usize,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub hit_rate: f64,
    /// Tracks with at least one resident entry, ascending.
    pub tracks: Vec<u64>,
}

/// Byte budgets for the three tiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierBudgets {
    pub l1: u64,
    pub l2: u64,
    pub l3: u64,
}

impl TierBudgets {
    pub fn get(&self, tier: TierName) -> u64 {
        match tier {
            TierName::L1 => self.l1,
            TierName::L2 => self.l2,
            TierName::L3 => self.l3,
        }
    }

    pub fn total(&self) -> u64 {
        self.l1 + self.l2 + self.l3
    }

    /// Every budget multiplied by `factor`.
    pub fn scaled(&self, factor: f64) -> Self {
        let scale = |v: u64| (v as f64 * factor.max(0.0)).round() as u64;
        Self {
            l1: scale(self.l1),
            l2: scale(self.l2),
            l3: scale(self.l3),
        }
    }
}

pub(crate) fn hit_rate(hits: u64, misses: u64) -> f64 {
    if hits + misses == 0 {
        0.0
    } else {
        hits as f64 / (hits + misses) as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_intensity_is_quantized_and_clamped() {
        let a = ChunkKey::new(1, Preset::Warm, 3, 0.5004);
        let b = ChunkKey::new(1, Preset::Warm, 3, 0.5);
        assert_eq!(a, b);
        assert_eq!(ChunkKey::new(1, Preset::Warm, 3, 7.0).intensity(), 1.0);
        assert_eq!(ChunkKey::new(1, Preset::Warm, 3, f32::NAN).intensity(), 0.0);
    }

    #[test]
    fn test_chunk_size_uses_duration_channels_and_width() {
        // 10 s of 44.1 kHz stereo f32
        assert_eq!(chunk_size_bytes(10.0, 44_100, 2, 4), 3_528_000);
        assert_eq!(chunk_size_bytes(-1.0, 44_100, 2, 4), 0);
    }

    #[test]
    fn test_tier_names_parse_case_insensitively() {
        assert_eq!("l3".parse::<TierName>(), Ok(TierName::L3));
        assert!("L4".parse::<TierName>().is_err());
    }
}
