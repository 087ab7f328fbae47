use serde::{Deserialize, Serialize};
use std::{path::PathBuf, time::Duration};

use crate::{
    audio::SAMPLE_WIDTH,
    cache::{chunk_size_bytes, TierBudgets},
    error::ConfigError,
};

const BYTES_PER_MB: f64 = 1024.0 * 1024.0;
/// Channel count assumed before any chunk of a track has been processed.
const EXPECTED_CHANNELS: u16 = 2;

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    // Tiers (MB)
    pub l1_max_mb: f64,
    pub l2_max_mb: f64,
    pub l3_max_mb: f64,

    // Chunking / prefetch horizon
    pub chunk_duration_seconds: f64,
    pub l2_top_presets: usize,
    pub l2_lookahead_chunks: u32,
    pub l3_lookahead_chunks: u32,

    // Memory pressure (fractions of total memory in use)
    pub warning_threshold: f64,
    pub critical_threshold: f64,

    // Self-tuning
    pub tuning_interval_seconds: u64,
    pub user_weight: f64,
    pub audio_weight: f64,
    pub tier_resize_hysteresis: f64,
    /// JSON rule table polled by the self-tuner; absent file keeps the rules.
    pub rules_path: PathBuf,

    // Background worker
    pub worker_latency_threshold_ms: u64,
    pub worker_poll_interval_ms: u64,
    pub worker_max_in_flight: usize,

    // Processor integration
    pub cache_dir: PathBuf,
    pub library_path: PathBuf,
    pub sample_rate: u32,
}

impl Config {
    /// Loads `.env`, an optional `preset-cache.{toml,json,yaml}` file, then
    /// environment variables (`L1_MAX_MB`, `CHUNK_DURATION_SECONDS`, ...), and
    /// validates the result.
    pub fn load() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();

        let config: Config = config::Config::builder()
            .add_source(config::File::with_name("preset-cache").required(false))
            .add_source(config::Environment::default().try_parsing(true))
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| ConfigError::Source(e.to_string()))?;

        config.validate()?;

        // Create directories if they don't exist
        std::fs::create_dir_all(&config.cache_dir)
            .map_err(|e| ConfigError::Source(format!("{}: {}", config.cache_dir.display(), e)))?;

        Ok(config)
    }

    /// Validates configuration values for correctness.
    ///
    /// # Validation Rules
    ///
    /// - Tier budgets must be finite and non-negative; L1 must be positive
    /// - Chunk duration must be positive
    /// - Thresholds and weights must be fractions, warning below critical
    /// - Intervals and worker limits must be non-zero
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (tier, value) in [
            ("l1_max_mb", self.l1_max_mb),
            ("l2_max_mb", self.l2_max_mb),
            ("l3_max_mb", self.l3_max_mb),
        ] {
            if !value.is_finite() || value < 0.0 {
                return Err(ConfigError::InvalidTierBudget { tier, value });
            }
        }
        if self.l1_max_mb == 0.0 {
            return Err(ConfigError::EmptyHotTier);
        }

        if !self.chunk_duration_seconds.is_finite() || self.chunk_duration_seconds <= 0.0 {
            return Err(ConfigError::InvalidChunkDuration(self.chunk_duration_seconds));
        }

        for (name, value) in [
            ("warning_threshold", self.warning_threshold),
            ("critical_threshold", self.critical_threshold),
            ("user_weight", self.user_weight),
            ("audio_weight", self.audio_weight),
            ("tier_resize_hysteresis", self.tier_resize_hysteresis),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(ConfigError::OutOfUnitRange { name, value });
            }
        }
        if self.warning_threshold >= self.critical_threshold {
            return Err(ConfigError::ThresholdOrder {
                warning: self.warning_threshold,
                critical: self.critical_threshold,
            });
        }

        if self.tuning_interval_seconds == 0 {
            return Err(ConfigError::Zero("tuning_interval_seconds"));
        }
        if self.worker_poll_interval_ms == 0 {
            return Err(ConfigError::Zero("worker_poll_interval_ms"));
        }
        if self.worker_max_in_flight == 0 {
            return Err(ConfigError::Zero("worker_max_in_flight"));
        }
        if self.sample_rate == 0 {
            return Err(ConfigError::Zero("sample_rate"));
        }

        Ok(())
    }

    pub fn tier_budgets(&self) -> TierBudgets {
        let bytes = |mb: f64| (mb * BYTES_PER_MB).round() as u64;
        TierBudgets {
            l1: bytes(self.l1_max_mb),
            l2: bytes(self.l2_max_mb),
            l3: bytes(self.l3_max_mb),
        }
    }

    /// Size of one chunk at `sample_rate` in stereo `f32`, the planning
    /// estimate until real chunks are seen.
    pub fn expected_chunk_bytes(&self) -> u64 {
        chunk_size_bytes(
            self.chunk_duration_seconds,
            self.sample_rate,
            EXPECTED_CHANNELS,
            SAMPLE_WIDTH,
        )
    }

    pub fn tuning_interval(&self) -> Duration {
        Duration::from_secs(self.tuning_interval_seconds)
    }

    pub fn worker_poll_interval(&self) -> Duration {
        Duration::from_millis(self.worker_poll_interval_ms)
    }

    pub fn worker_latency_threshold(&self) -> Duration {
        Duration::from_millis(self.worker_latency_threshold_ms)
    }

    /// Returns a summary of the current configuration for logging.
    pub fn summary(&self) -> String {
        format!(
            "Config Summary:\n  \
            Tiers: L1 {}MB, L2 {}MB, L3 {}MB\n  \
            Chunks: {}s, L2 top-{} x{} ahead, L3 x{} ahead\n  \
            Memory: warning {:.0}%, critical {:.0}%\n  \
            Tuning: every {}, weights {:.2}/{:.2} user/audio\n  \
            Worker: poll {}, {} in flight, latency limit {}",
            self.l1_max_mb,
            self.l2_max_mb,
            self.l3_max_mb,
            self.chunk_duration_seconds,
            self.l2_top_presets,
            self.l2_lookahead_chunks,
            self.l3_lookahead_chunks,
            self.warning_threshold * 100.0,
            self.critical_threshold * 100.0,
            humantime::format_duration(self.tuning_interval()),
            self.user_weight,
            self.audio_weight,
            humantime::format_duration(self.worker_poll_interval()),
            self.worker_max_in_flight,
            humantime::format_duration(self.worker_latency_threshold()),
        )
    }
}

/// Default configuration values.
///
/// Used as fallbacks when neither the config file nor the environment sets a
/// value.
impl Default for Config {
    fn default() -> Self {
        Self {
            l1_max_mb: 12.0,
            l2_max_mb: 36.0,
            l3_max_mb: 45.0,

            chunk_duration_seconds: 10.0,
            l2_top_presets: 2,
            l2_lookahead_chunks: 3,
            l3_lookahead_chunks: 10,

            warning_threshold: 0.75,
            critical_threshold: 0.85,

            tuning_interval_seconds: 300,
            user_weight: 0.7,
            audio_weight: 0.3,
            tier_resize_hysteresis: 0.1,
            rules_path: "/app/data/affinity_rules.json".into(),

            worker_latency_threshold_ms: 100,
            worker_poll_interval_ms: 250,
            worker_max_in_flight: 4,

            cache_dir: "/app/cache/chunks".into(),
            library_path: "/app/data/library.json".into(),
            sample_rate: 44_100,
        }
    }
}
