use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::{collections::VecDeque, fmt, sync::Arc, time::Duration};
use tokio::sync::watch;
use tracing::{info, warn};

use super::{MemoryPressure, MemoryStatus};
use crate::{
    buffer::{BufferManager, WorkerState},
    cache::{TierBudgets, TierName},
};

const HISTORY_LIMIT: usize = 50;
const LATENCY_WINDOW: usize = 10;
/// L1 share kept in emergency.
const EMERGENCY_L1_FACTOR: f64 = 0.5;

/// System-wide cache posture, richest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DegradationLevel {
    /// L1 + L2 + L3.
    Normal = 0,
    /// L1 + L2; L3 emptied.
    Warning = 1,
    /// L1 only.
    Critical = 2,
    /// L1 reduced, background worker paused.
    Emergency = 3,
}

impl DegradationLevel {
    pub fn as_u8(&self) -> u8 {
        *self as u8
    }

    /// Tier capacities at this level for the given base budgets.
    pub fn budgets(&self, base: TierBudgets) -> TierBudgets {
        match self {
            DegradationLevel::Normal => base,
            DegradationLevel::Warning => TierBudgets { l3: 0, ..base },
            DegradationLevel::Critical => TierBudgets { l2: 0, l3: 0, ..base },
            DegradationLevel::Emergency => TierBudgets {
                l1: (base.l1 as f64 * EMERGENCY_L1_FACTOR).round() as u64,
                l2: 0,
                l3: 0,
            },
        }
    }

    pub fn worker_state(&self) -> WorkerState {
        match self {
            DegradationLevel::Emergency => WorkerState::Paused,
            _ => WorkerState::Running,
        }
    }
}

impl fmt::Display for DegradationLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({:?})", self.as_u8(), self)
    }
}

/// One recorded level change.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Transition {
    pub from: DegradationLevel,
    pub to: DegradationLevel,
    pub at: DateTime<Utc>,
    pub used_percent: f64,
    pub avg_latency_ms: Option<f64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DegradationSnapshot {
    pub level: DegradationLevel,
    pub base_budgets: TierBudgets,
    pub avg_latency_ms: Option<f64>,
    pub history: Vec<Transition>,
}

#[derive(Debug)]
struct DegradationState {
    level: DegradationLevel,
    base: TierBudgets,
    history: VecDeque<Transition>,
    latencies: VecDeque<Duration>,
}

impl DegradationState {
    fn average_latency(&self) -> Option<Duration> {
        if self.latencies.is_empty() {
            return None;
        }
        let total: Duration = self.latencies.iter().sum();
        Some(total / self.latencies.len() as u32)
    }
}

/// Applies degradation levels to the buffer tiers and the worker.
///
/// Holds only references: capacities change through
/// [`BufferManager::set_tier_capacity`], the worker through a watch channel.
pub struct DegradationManager {
    buffer: Arc<BufferManager>,
    worker: watch::Sender<WorkerState>,
    latency_threshold: Duration,
    state: Mutex<DegradationState>,
}

impl DegradationManager {
    pub fn new(
        buffer: Arc<BufferManager>,
        worker: watch::Sender<WorkerState>,
        base: TierBudgets,
        latency_threshold: Duration,
    ) -> Self {
        Self {
            buffer,
            worker,
            latency_threshold,
            state: Mutex::new(DegradationState {
                level: DegradationLevel::Normal,
                base,
                history: VecDeque::new(),
                latencies: VecDeque::with_capacity(LATENCY_WINDOW),
            }),
        }
    }

    pub fn level(&self) -> DegradationLevel {
        self.state.lock().level
    }

    pub fn base_budgets(&self) -> TierBudgets {
        self.state.lock().base
    }

    /// Feeds one processor call latency into the rolling window.
    pub fn record_latency(&self, latency: Duration) {
        let mut state = self.state.lock();
        if state.latencies.len() == LATENCY_WINDOW {
            state.latencies.pop_front();
        }
        state.latencies.push_back(latency);
    }

    pub fn average_latency(&self) -> Option<Duration> {
        self.state.lock().average_latency()
    }

    /// Level warranted by `status` and the recent worker latency.
    ///
    /// Latency only matters when critical pressure is entered from a lower
    /// level. Critical and Emergency hold until pressure eases.
    pub fn evaluate(&self, status: &MemoryStatus) -> DegradationLevel {
        match status.pressure {
            MemoryPressure::Normal => DegradationLevel::Normal,
            MemoryPressure::Warning => DegradationLevel::Warning,
            MemoryPressure::Critical => {
                let state = self.state.lock();
                match state.level {
                    level @ (DegradationLevel::Critical | DegradationLevel::Emergency) => level,
                    _ => match state.average_latency() {
                        Some(avg) if avg > self.latency_threshold => DegradationLevel::Emergency,
                        _ => DegradationLevel::Critical,
                    },
                }
            }
        }
    }

    /// Evaluates and applies in one step.
    pub fn update(&self, status: &MemoryStatus) -> DegradationLevel {
        let level = self.evaluate(status);
        self.apply(level, status.used_percent);
        level
    }

    /// Moves to `level`. Re-applying the current level is a no-op and returns
    /// `false`.
    pub fn apply(&self, level: DegradationLevel, used_percent: f64) -> bool {
        let mut state = self.state.lock();
        if state.level == level {
            return false;
        }

        let from = state.level;
        let avg_latency_ms = state.average_latency().map(|d| d.as_secs_f64() * 1000.0);
        self.enforce(level, state.base);
        state.level = level;

        if state.history.len() == HISTORY_LIMIT {
            state.history.pop_front();
        }
        state.history.push_back(Transition {
            from,
            to: level,
            at: Utc::now(),
            used_percent,
            avg_latency_ms,
        });

        if level > from {
            warn!(
                "📉 Degradación {} → {} (memoria {:.1}%)",
                from,
                level,
                used_percent * 100.0
            );
        } else {
            info!(
                "📈 Recuperación {} → {} (memoria {:.1}%)",
                from,
                level,
                used_percent * 100.0
            );
        }
        true
    }

    /// Replaces the base budgets and re-applies the current level's mask
    /// immediately.
    pub fn set_base_budgets(&self, base: TierBudgets) {
        let mut state = self.state.lock();
        if state.base == base {
            return;
        }
        state.base = base;
        self.enforce(state.level, base);
        info!(
            "📏 Presupuestos base: L1 {}B, L2 {}B, L3 {}B",
            base.l1, base.l2, base.l3
        );
    }

    pub fn snapshot(&self) -> DegradationSnapshot {
        let state = self.state.lock();
        DegradationSnapshot {
            level: state.level,
            base_budgets: state.base,
            avg_latency_ms: state.average_latency().map(|d| d.as_secs_f64() * 1000.0),
            history: state.history.iter().cloned().collect(),
        }
    }

    fn enforce(&self, level: DegradationLevel, base: TierBudgets) {
        let budgets = level.budgets(base);
        for name in TierName::ALL {
            let capacity = budgets.get(name);
            self.buffer.set_tier_capacity(name, capacity);
            if capacity == 0 {
                self.buffer.clear_tier(name);
            }
        }

        let worker_state = level.worker_state();
        let previous = self.worker.send_replace(worker_state);
        if previous != worker_state {
            match worker_state {
                WorkerState::Paused => warn!("⏸️ Worker en pausa por emergencia de memoria"),
                WorkerState::Running => info!("▶️ Worker reanudado"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        audio::{Preset, ProcessedChunk},
        config::Config,
        memory::{MemoryMonitor, MemoryReading, MockMemoryProbe},
    };
    use pretty_assertions::assert_eq;

    fn status(used_percent: f64) -> MemoryStatus {
        let mut probe = MockMemoryProbe::new();
        probe.expect_read().returning(move || MemoryReading {
            total_bytes: 1_000_000,
            available_bytes: ((1.0 - used_percent) * 1_000_000.0).round() as u64,
        });
        MemoryMonitor::new(probe, &Config::default()).status()
    }

    fn setup() -> (Arc<BufferManager>, DegradationManager, watch::Receiver<WorkerState>) {
        let config = Config::default();
        let buffer = Arc::new(BufferManager::new(&config));
        let (tx, rx) = watch::channel(WorkerState::Running);
        let manager = DegradationManager::new(
            Arc::clone(&buffer),
            tx,
            config.tier_budgets(),
            config.worker_latency_threshold(),
        );
        (buffer, manager, rx)
    }

    #[test]
    fn test_levels_follow_memory_pressure() {
        let (buffer, manager, rx) = setup();
        let base = manager.base_budgets();

        assert_eq!(manager.update(&status(0.5)), DegradationLevel::Normal);
        assert_eq!(buffer.tier_capacities(), base);

        assert_eq!(manager.update(&status(0.80)), DegradationLevel::Warning);
        assert_eq!(buffer.tier_capacities().l3, 0);
        assert_eq!(buffer.tier_capacities().l2, base.l2);

        assert_eq!(manager.update(&status(0.90)), DegradationLevel::Critical);
        assert_eq!(buffer.tier_capacities(), TierBudgets { l1: base.l1, l2: 0, l3: 0 });
        assert_eq!(*rx.borrow(), WorkerState::Running);
    }

    #[test]
    fn test_slow_worker_escalates_critical_to_emergency() {
        let (buffer, manager, rx) = setup();
        let base = manager.base_budgets();
        manager.update(&status(0.80));
        for _ in 0..10 {
            manager.record_latency(Duration::from_millis(150));
        }

        assert_eq!(manager.update(&status(0.90)), DegradationLevel::Emergency);
        assert_eq!(buffer.tier_capacities().l1, base.l1 / 2);
        assert_eq!(*rx.borrow(), WorkerState::Paused);

        // Recovery resumes the worker and restores the tiers.
        assert_eq!(manager.update(&status(0.5)), DegradationLevel::Normal);
        assert_eq!(buffer.tier_capacities(), base);
        assert_eq!(*rx.borrow(), WorkerState::Running);
    }

    #[test]
    fn test_latency_only_escalates_when_entering_critical() {
        let (_, manager, rx) = setup();
        assert_eq!(manager.update(&status(0.90)), DegradationLevel::Critical);
        for _ in 0..10 {
            manager.record_latency(Duration::from_millis(400));
        }
        // Already critical: slow calls do not escalate further.
        assert_eq!(manager.update(&status(0.90)), DegradationLevel::Critical);
        assert_eq!(*rx.borrow(), WorkerState::Running);

        manager.update(&status(0.80));
        assert_eq!(manager.update(&status(0.90)), DegradationLevel::Emergency);

        // Emergency holds while pressure stays critical, even once calls are fast.
        for _ in 0..10 {
            manager.record_latency(Duration::from_millis(5));
        }
        assert_eq!(manager.update(&status(0.90)), DegradationLevel::Emergency);
        assert_eq!(*rx.borrow(), WorkerState::Paused);
        assert_eq!(manager.snapshot().history.len(), 3);
    }

    #[test]
    fn test_latency_window_keeps_last_ten() {
        let (_, manager, _) = setup();
        for _ in 0..10 {
            manager.record_latency(Duration::from_millis(500));
        }
        for _ in 0..10 {
            manager.record_latency(Duration::from_millis(20));
        }
        assert_eq!(manager.average_latency(), Some(Duration::from_millis(20)));
        assert_eq!(manager.update(&status(0.90)), DegradationLevel::Critical);
    }

    #[test]
    fn test_transitions_are_idempotent_and_recorded() {
        let (_, manager, _) = setup();
        assert!(!manager.apply(DegradationLevel::Normal, 0.5));
        assert!(manager.apply(DegradationLevel::Warning, 0.8));
        assert!(!manager.apply(DegradationLevel::Warning, 0.8));

        let snapshot = manager.snapshot();
        assert_eq!(snapshot.history.len(), 1);
        assert_eq!(snapshot.history[0].from, DegradationLevel::Normal);
        assert_eq!(snapshot.history[0].to, DegradationLevel::Warning);
    }

    #[test]
    fn test_dropping_a_tier_clears_its_entries() {
        let (buffer, manager, _) = setup();
        buffer.update_position(1, 0.0, Preset::Adaptive, 1.0);
        for request in buffer.needed_requests(1) {
            buffer.complete_chunk(&request, ProcessedChunk::new(vec![0.0; 256], 2, 44_100));
        }
        assert!(buffer.cache_stats().tiers[2].entry_count > 0);

        manager.apply(DegradationLevel::Warning, 0.8);
        let stats = buffer.cache_stats();
        assert_eq!(stats.tiers[2].entry_count, 0);
        assert!(stats.tiers[0].entry_count > 0);
    }

    #[test]
    fn test_new_base_budgets_keep_the_level_mask() {
        let (buffer, manager, _) = setup();
        manager.apply(DegradationLevel::Critical, 0.9);
        let base = TierBudgets { l1: 1_000, l2: 2_000, l3: 3_000 };
        manager.set_base_budgets(base);
        assert_eq!(buffer.tier_capacities(), TierBudgets { l1: 1_000, l2: 0, l3: 0 });
    }
}
