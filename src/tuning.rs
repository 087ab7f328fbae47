//! # Self-Tuning
//!
//! Periodic control loop over the buffer. Each cycle runs four independent
//! steps in order:
//!
//! 1. Re-derive the user/audio blend weights from prediction accuracy
//! 2. Pull a fresh affinity rule table from the [`AffinityLearner`]
//! 3. Resize the tier base budgets when the memory recommendation moved by
//!    more than the hysteresis
//! 4. Re-evaluate the degradation level
//!
//! A failing step is logged and skipped; the cycle and the loop go on.

use anyhow::{ensure, Context, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::{
    io::ErrorKind,
    path::PathBuf,
    sync::Arc,
    time::{Duration, SystemTime},
};
use tokio::fs;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    buffer::BufferManager,
    cache::{TierBudgets, TierName},
    config::Config,
    memory::{DegradationManager, MemoryMonitor},
    prediction::RuleTable,
};

/// Switches observed before accuracy moves the weights.
const MIN_ACCURACY_SAMPLES: usize = 10;
/// Fraction of the gap to the target closed per cycle.
const WEIGHT_SMOOTHING: f64 = 0.2;
const USER_WEIGHT_RANGE: (f64, f64) = (0.2, 0.9);

/// User-behavior vs audio-content weight in the prediction blend.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BlendWeights {
    pub user: f64,
    pub audio: f64,
}

impl Default for BlendWeights {
    fn default() -> Self {
        Self {
            user: 0.7,
            audio: 0.3,
        }
    }
}

impl BlendWeights {
    /// Normalized pair; negative, non-finite or all-zero input falls back to
    /// the default split.
    pub fn new(user: f64, audio: f64) -> Self {
        let sum = user + audio;
        if !sum.is_finite() || sum <= 0.0 || user < 0.0 || audio < 0.0 {
            return Self::default();
        }
        Self {
            user: user / sum,
            audio: audio / sum,
        }
    }
}

/// Source of refreshed affinity rules.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait AffinityLearner {
    /// A new rule table, or `None` to keep the current one.
    async fn learn(&self) -> Result<Option<RuleTable>>;
}

/// Reloads a JSON [`RuleTable`] whenever the file's mtime changes.
pub struct FileRuleLearner {
    path: PathBuf,
    last_modified: Mutex<Option<SystemTime>>,
}

impl FileRuleLearner {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            last_modified: Mutex::new(None),
        }
    }
}

#[async_trait]
impl AffinityLearner for FileRuleLearner {
    async fn learn(&self) -> Result<Option<RuleTable>> {
        let metadata = match fs::metadata(&self.path).await {
            Ok(metadata) => metadata,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(e).with_context(|| format!("cannot stat {}", self.path.display()))
            }
        };

        let modified = metadata.modified().ok();
        let unchanged = {
            let last = self.last_modified.lock();
            modified.is_some() && *last == modified
        };
        if unchanged {
            return Ok(None);
        }

        let raw = fs::read_to_string(&self.path)
            .await
            .with_context(|| format!("cannot read {}", self.path.display()))?;
        let table: RuleTable = serde_json::from_str(&raw)
            .with_context(|| format!("invalid rule table in {}", self.path.display()))?;

        *self.last_modified.lock() = modified;
        info!(
            "📐 Reglas de afinidad cargadas desde {} ({} reglas)",
            self.path.display(),
            table.rules.len()
        );
        Ok(Some(table))
    }
}

pub struct SelfTuner {
    buffer: Arc<BufferManager>,
    monitor: Arc<MemoryMonitor>,
    degradation: Arc<DegradationManager>,
    learner: Arc<dyn AffinityLearner + Send + Sync>,
    configured: TierBudgets,
    interval: Duration,
    hysteresis: f64,
}

impl SelfTuner {
    pub fn new(
        buffer: Arc<BufferManager>,
        monitor: Arc<MemoryMonitor>,
        degradation: Arc<DegradationManager>,
        learner: Arc<dyn AffinityLearner + Send + Sync>,
        config: &Config,
    ) -> Self {
        Self {
            buffer,
            monitor,
            degradation,
            learner,
            configured: config.tier_budgets(),
            interval: config.tuning_interval(),
            hysteresis: config.tier_resize_hysteresis,
        }
    }

    /// Runs one cycle. Returns the number of failed steps.
    pub async fn run_cycle(&self) -> usize {
        let mut failed = 0;

        if let Err(e) = self.rebalance_weights() {
            warn!("⚠️ Ajuste: falló el rebalanceo de pesos: {:#}", e);
            failed += 1;
        }
        if let Err(e) = self.refresh_rules().await {
            warn!("⚠️ Ajuste: falló la recarga de reglas: {:#}", e);
            failed += 1;
        }
        if let Err(e) = self.resize_tiers() {
            warn!("⚠️ Ajuste: falló el redimensionado de tiers: {:#}", e);
            failed += 1;
        }
        if let Err(e) = self.apply_degradation() {
            warn!("⚠️ Ajuste: falló la actualización de degradación: {:#}", e);
            failed += 1;
        }

        failed
    }

    fn rebalance_weights(&self) -> Result<()> {
        let accuracy = self.buffer.accuracy();
        if accuracy.samples < MIN_ACCURACY_SAMPLES {
            debug!(
                "⚖️ {} cambios observados, se mantienen los pesos",
                accuracy.samples
            );
            return Ok(());
        }

        let signal = accuracy.user + accuracy.audio;
        if signal <= 0.0 {
            return Ok(());
        }
        let target = accuracy.user / signal;
        ensure!(target.is_finite(), "non-finite weight target from {:?}", accuracy);

        let current = self.buffer.blend_weights();
        let (min, max) = USER_WEIGHT_RANGE;
        let user = (current.user + WEIGHT_SMOOTHING * (target - current.user)).clamp(min, max);
        let weights = BlendWeights::new(user, 1.0 - user);
        self.buffer.set_blend_weights(weights);

        info!(
            "⚖️ Pesos de mezcla: usuario {:.2} / audio {:.2} (precisión {:.0}% / {:.0}%)",
            weights.user,
            weights.audio,
            accuracy.user * 100.0,
            accuracy.audio * 100.0
        );
        Ok(())
    }

    async fn refresh_rules(&self) -> Result<()> {
        let rules = self
            .learner
            .learn()
            .await
            .context("affinity learner failed")?;
        if let Some(rules) = rules {
            self.buffer.set_rules(rules);
        }
        Ok(())
    }

    fn resize_tiers(&self) -> Result<()> {
        let status = self.monitor.status();
        ensure!(status.total_bytes > 0, "memory probe returned no data");

        let recommended = self.monitor.recommended_budgets(&status, self.configured);
        let current = self.degradation.base_budgets();
        if exceeds_hysteresis(current, recommended, self.hysteresis) {
            self.degradation.set_base_budgets(recommended);
        }
        Ok(())
    }

    fn apply_degradation(&self) -> Result<()> {
        let status = self.monitor.status();
        ensure!(status.total_bytes > 0, "memory probe returned no data");

        let level = self.degradation.update(&status);
        debug!("🎛️ Nivel de degradación {}", level);
        Ok(())
    }

    pub async fn run(self, cancel: CancellationToken) {
        info!(
            "🎛️ Self-tuner iniciado (cada {})",
            humantime::format_duration(self.interval)
        );

        let mut ticker = tokio::time::interval(self.interval);
        // The first tick completes immediately.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let failed = self.run_cycle().await;
                    if failed > 0 {
                        debug!("🎛️ Ciclo de ajuste terminado con {} pasos fallidos", failed);
                    }
                }
            }
        }

        info!("🛑 Self-tuner detenido");
    }
}

/// Whether any tier moved by more than `hysteresis`, relative to `current`.
fn exceeds_hysteresis(current: TierBudgets, recommended: TierBudgets, hysteresis: f64) -> bool {
    TierName::ALL.into_iter().any(|tier| {
        let c = current.get(tier) as f64;
        let r = recommended.get(tier) as f64;
        if c == 0.0 {
            r > 0.0
        } else {
            ((r - c) / c).abs() > hysteresis
        }
    })
}
