//! # Memory Module
//!
//! System memory observation and the degradation posture derived from it.
//!
//! [`MemoryMonitor`] reads total/available memory through a [`MemoryProbe`]
//! (backed by `sysinfo` in production) and classifies the usage against the
//! configured warning and critical thresholds. The
//! [`degradation::DegradationManager`] turns that classification into tier
//! capacities and the worker's pause state.

pub mod degradation;

use parking_lot::Mutex;
use serde::Serialize;
use sysinfo::System;
use tracing::{debug, warn};

use crate::{cache::TierBudgets, config::Config};

pub use degradation::{DegradationLevel, DegradationManager, DegradationSnapshot, Transition};

/// Share of available memory the tiers may claim in total.
const MAX_AVAILABLE_SHARE: f64 = 0.25;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MemoryPressure {
    Normal,
    Warning,
    Critical,
}

impl MemoryPressure {
    /// Budget scale applied to recommended tier sizes.
    fn budget_factor(&self) -> f64 {
        match self {
            MemoryPressure::Normal => 1.0,
            MemoryPressure::Warning => 0.75,
            MemoryPressure::Critical => 0.5,
        }
    }
}

/// Raw probe output, in bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryReading {
    pub total_bytes: u64,
    pub available_bytes: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct MemoryStatus {
    pub total_bytes: u64,
    pub available_bytes: u64,
    pub used_bytes: u64,
    /// Fraction of total memory in use, 0..=1.
    pub used_percent: f64,
    pub pressure: MemoryPressure,
}

/// Source of memory readings.
#[cfg_attr(test, mockall::automock)]
pub trait MemoryProbe {
    fn read(&self) -> MemoryReading;
}

/// Reads system memory with `sysinfo`.
pub struct SysinfoProbe {
    system: Mutex<System>,
}

impl SysinfoProbe {
    pub fn new() -> Self {
        Self {
            system: Mutex::new(System::new()),
        }
    }
}

impl Default for SysinfoProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryProbe for SysinfoProbe {
    fn read(&self) -> MemoryReading {
        let mut system = self.system.lock();
        system.refresh_memory();
        MemoryReading {
            total_bytes: system.total_memory(),
            available_bytes: system.available_memory(),
        }
    }
}

/// Computes [`MemoryStatus`] on demand.
pub struct MemoryMonitor {
    probe: Box<dyn MemoryProbe + Send + Sync>,
    warning_threshold: f64,
    critical_threshold: f64,
}

impl MemoryMonitor {
    pub fn new(probe: impl MemoryProbe + Send + Sync + 'static, config: &Config) -> Self {
        Self {
            probe: Box::new(probe),
            warning_threshold: config.warning_threshold,
            critical_threshold: config.critical_threshold,
        }
    }

    pub fn pressure_for(&self, used_percent: f64) -> MemoryPressure {
        if used_percent >= self.critical_threshold {
            MemoryPressure::Critical
        } else if used_percent >= self.warning_threshold {
            MemoryPressure::Warning
        } else {
            MemoryPressure::Normal
        }
    }

    /// Fresh reading. A probe that reports no memory yields a normal, empty
    /// status.
    pub fn status(&self) -> MemoryStatus {
        let reading = self.probe.read();
        let total = reading.total_bytes;
        let available = reading.available_bytes.min(total);
        let used = total - available;

        let used_percent = if total == 0 {
            0.0
        } else {
            used as f64 / total as f64
        };
        let pressure = self.pressure_for(used_percent);

        match pressure {
            MemoryPressure::Critical => warn!(
                "🚨 Memoria crítica: {}MB usados / {}MB totales ({:.1}%)",
                used / 1024 / 1024,
                total / 1024 / 1024,
                used_percent * 100.0
            ),
            MemoryPressure::Warning => warn!(
                "⚠️ Memoria alta: {}MB usados / {}MB totales ({:.1}%)",
                used / 1024 / 1024,
                total / 1024 / 1024,
                used_percent * 100.0
            ),
            MemoryPressure::Normal => debug!(
                "💾 Memoria normal: {:.1}% en uso",
                used_percent * 100.0
            ),
        }

        MemoryStatus {
            total_bytes: total,
            available_bytes: available,
            used_bytes: used,
            used_percent,
            pressure,
        }
    }

    /// Tier sizes for `status`: `configured` scaled by pressure, then capped
    /// to a quarter of available memory in total.
    pub fn recommended_budgets(&self, status: &MemoryStatus, configured: TierBudgets) -> TierBudgets {
        let scaled = configured.scaled(status.pressure.budget_factor());
        if status.total_bytes == 0 {
            return scaled;
        }

        let cap = status.available_bytes as f64 * MAX_AVAILABLE_SHARE;
        let total = scaled.total() as f64;
        if total > cap && total > 0.0 {
            scaled.scaled(cap / total)
        } else {
            scaled
        }
    }
}
