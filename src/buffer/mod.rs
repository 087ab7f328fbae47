//! # Buffer Module
//!
//! Turns playback position updates into prefetch decisions.
//!
//! [`BufferManager`] owns the three cache tiers and both predictors behind a
//! single mutex. Every position update re-plans the chunks that should be
//! resident:
//!
//! | Tier | Presets | Chunks |
//! |------|---------|--------|
//! | L1 | every preset | current, next |
//! | L2 | top-N predicted next presets | `next + 1 ..= current + l2_lookahead + 1` |
//! | L3 | active preset | `next + 1 ..= current + l3_lookahead + 1` |
//!
//! Each tier only gets as many requests as fit its byte budget, counted with
//! the expected chunk size and taken in probability order. Resident chunks of
//! the active track that fall out of the plan drop to probability 0, so they
//! are evicted before anything planned.
//!
//! The [`worker::BackgroundWorker`] polls [`BufferManager::needed_requests`]
//! and fills the gaps through the chunk processor.

pub mod accuracy;
pub mod worker;

use parking_lot::Mutex;
use serde::Serialize;
use std::{
    collections::{BTreeMap, BTreeSet, HashSet},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};
use tracing::{debug, info};

use crate::{
    audio::{Preset, ProcessedChunk},
    cache::{hit_rate, CacheEntry, CacheTier, ChunkKey, TierBudgets, TierName, TierStats},
    config::Config,
    prediction::{combine, AudioContentPredictor, RuleTable, TransitionPredictor},
    tuning::BlendWeights,
};

pub use accuracy::{Prediction, PredictionAccuracy};
pub use worker::{BackgroundWorker, WorkerState};

use accuracy::AccuracyTracker;

/// Minimum planned probability per tier, hottest first.
const MIN_PROBABILITY: [f64; 3] = [0.5, 0.1, 0.05];
/// Per-chunk decay of probability with distance from the playhead.
const LOOKAHEAD_DECAY: f64 = 0.9;
const L3_BASE_PROBABILITY: f64 = 0.5;

/// One chunk the worker should produce, and where it goes.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ChunkRequest {
    pub key: ChunkKey,
    pub tier: TierName,
    pub probability: f64,
}

/// Buffering state of the active track.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum BufferPhase {
    Idle,
    /// The current chunk of the active preset is not resident yet.
    Buffering { current: u32 },
    /// Current chunk is ready; filling next and beyond.
    BufferingAhead { current: u32, next: u32 },
}

#[derive(Debug, Clone, Serialize)]
pub struct CacheStats {
    pub tiers: Vec<TierStats>,
    pub total_size_bytes: u64,
    pub total_entries: usize,
    /// Lookups answered by any tier over all lookups.
    pub overall_hit_rate: f64,
    pub prediction_accuracy: PredictionAccuracy,
    pub blend_weights: BlendWeights,
    pub active_track: Option<u64>,
    pub phase: BufferPhase,
}

#[derive(Debug, Clone, Copy)]
struct Horizon {
    chunk_duration: f64,
    expected_chunk_bytes: u64,
    l2_top_presets: usize,
    l2_lookahead: u32,
    l3_lookahead: u32,
}

#[derive(Debug)]
struct Playback {
    track_id: u64,
    preset: Preset,
    intensity: f32,
    current_chunk: u32,
    /// First chunk index the processor reported past the end of the track.
    end_chunk: Option<u32>,
    plan: Vec<ChunkRequest>,
    prediction: Prediction,
}

#[derive(Debug)]
struct BufferState {
    tiers: [CacheTier; 3],
    transitions: TransitionPredictor,
    content: AudioContentPredictor,
    weights: BlendWeights,
    accuracy: AccuracyTracker,
    playback: Option<Playback>,
    /// Samples of the most recent current chunk, for content prediction.
    latest_samples: Option<Arc<[f32]>>,
    /// Planning size of one chunk: the configured estimate, raised by any
    /// larger chunk of the active track.
    chunk_bytes: u64,
}

impl BufferState {
    fn tier(&self, name: TierName) -> &CacheTier {
        &self.tiers[name as usize]
    }

    fn tier_mut(&mut self, name: TierName) -> &mut CacheTier {
        &mut self.tiers[name as usize]
    }

    fn capacities(&self) -> [u64; 3] {
        TierName::ALL.map(|name| self.tier(name).max_size_bytes())
    }

    /// Re-fits the active plan after a budget or chunk size change.
    fn refit_plan(&mut self) {
        let capacities = self.capacities();
        let chunk_bytes = self.chunk_bytes;
        if let Some(playback) = self.playback.as_mut() {
            let before = playback.plan.len();
            fit_to_budget(&mut playback.plan, capacities, chunk_bytes);
            if playback.plan.len() < before {
                debug!(
                    "✂️ Plan recortado a {} chunks ({} bytes por chunk)",
                    playback.plan.len(),
                    chunk_bytes
                );
            }
        }
    }

    fn resident_tier(&self, key: &ChunkKey) -> Option<TierName> {
        TierName::ALL
            .into_iter()
            .find(|name| self.tier(*name).peek(key).is_some())
    }

    fn phase(&self) -> BufferPhase {
        match &self.playback {
            None => BufferPhase::Idle,
            Some(p) => {
                let key = ChunkKey::new(p.track_id, p.preset, p.current_chunk, p.intensity);
                if self.resident_tier(&key).is_some() {
                    BufferPhase::BufferingAhead {
                        current: p.current_chunk,
                        next: p.current_chunk.saturating_add(1),
                    }
                } else {
                    BufferPhase::Buffering { current: p.current_chunk }
                }
            }
        }
    }

    /// Demotes resident chunks of `track_id` that left the plan, refreshes
    /// planned probabilities, and moves chunks planned into another tier.
    fn apply_plan(&mut self, track_id: u64, plan: &[ChunkRequest]) {
        let planned: HashSet<ChunkKey> = plan.iter().map(|r| r.key).collect();
        let demoted: usize = self
            .tiers
            .iter_mut()
            .map(|tier| tier.demote_unplanned(track_id, &planned))
            .sum();
        if demoted > 0 {
            debug!("⬇️ {} chunks fuera del plan de la pista {}", demoted, track_id);
        }

        for request in plan {
            if self
                .tier_mut(request.tier)
                .refresh_probability(&request.key, request.probability)
            {
                continue;
            }
            let Some(from) = self.resident_tier(&request.key) else {
                continue;
            };
            if let Some(mut entry) = self.tier_mut(from).take(&request.key) {
                entry.probability = request.probability;
                debug!("↕️ {} movido {} → {}", request.key, from, request.tier);
                self.tier_mut(request.tier).add_entry(entry);
            }
        }
    }
}

/// Owner of the cache tiers, the transition model and the content predictor.
#[derive(Debug)]
pub struct BufferManager {
    state: Mutex<BufferState>,
    horizon: Horizon,
    lookups: AtomicU64,
    lookup_hits: AtomicU64,
}

impl BufferManager {
    pub fn new(config: &Config) -> Self {
        let budgets = config.tier_budgets();
        let tiers = TierName::ALL.map(|name| {
            CacheTier::new(name, budgets.get(name), MIN_PROBABILITY[name as usize])
        });

        info!(
            "🗄️ Buffer listo: L1 {}MB, L2 {}MB, L3 {}MB, chunks de {}s",
            config.l1_max_mb, config.l2_max_mb, config.l3_max_mb, config.chunk_duration_seconds
        );

        Self {
            state: Mutex::new(BufferState {
                tiers,
                transitions: TransitionPredictor::new(),
                content: AudioContentPredictor::default(),
                weights: BlendWeights::new(config.user_weight, config.audio_weight),
                accuracy: AccuracyTracker::default(),
                playback: None,
                latest_samples: None,
                chunk_bytes: config.expected_chunk_bytes(),
            }),
            horizon: Horizon {
                chunk_duration: config.chunk_duration_seconds,
                expected_chunk_bytes: config.expected_chunk_bytes(),
                l2_top_presets: config.l2_top_presets,
                l2_lookahead: config.l2_lookahead_chunks,
                l3_lookahead: config.l3_lookahead_chunks,
            },
            lookups: AtomicU64::new(0),
            lookup_hits: AtomicU64::new(0),
        }
    }

    /// Reports the playhead and re-plans what should be resident.
    ///
    /// Never blocks on processing: only the in-memory plan and tier
    /// bookkeeping change here.
    pub fn update_position(
        &self,
        track_id: u64,
        position_secs: f64,
        preset: Preset,
        intensity: f32,
    ) -> BufferPhase {
        let mut guard = self.state.lock();
        let state = &mut *guard;

        let previous = match state.playback.take() {
            Some(p) if p.track_id == track_id => Some(p),
            Some(old) => {
                // Same critical section as the population below.
                let removed: usize = state
                    .tiers
                    .iter_mut()
                    .map(|tier| tier.remove_track(old.track_id))
                    .sum();
                state.latest_samples = None;
                state.chunk_bytes = self.horizon.expected_chunk_bytes;
                info!(
                    "⏭️ Pista {} → {}: {} chunks descartados",
                    old.track_id, track_id, removed
                );
                None
            }
            None => None,
        };

        if let Some(prev) = &previous {
            if state.transitions.record_transition(prev.preset, preset) {
                state.accuracy.record(&prev.prediction, preset);
            }
        }

        let current_chunk = chunk_index(position_secs, self.horizon.chunk_duration);
        let end_chunk = previous.as_ref().and_then(|p| p.end_chunk);
        let (plan, prediction) =
            self.plan(state, track_id, preset, intensity, current_chunk, end_chunk);
        state.apply_plan(track_id, &plan);

        debug!(
            "📍 Pista {} @ {:.1}s ({}, chunk {}): {} chunks planificados",
            track_id,
            position_secs,
            preset,
            current_chunk,
            plan.len()
        );

        state.playback = Some(Playback {
            track_id,
            preset,
            intensity,
            current_chunk,
            end_chunk,
            plan,
            prediction,
        });
        state.phase()
    }

    fn plan(
        &self,
        state: &mut BufferState,
        track_id: u64,
        preset: Preset,
        intensity: f32,
        current: u32,
        end_chunk: Option<u32>,
    ) -> (Vec<ChunkRequest>, Prediction) {
        let user = state
            .transitions
            .predict_next(preset, Preset::ALL.len() + 1);
        let audio = match state.latest_samples.clone() {
            Some(samples) => state.content.predict(&samples),
            None => state.content.rules().baseline,
        };
        let weights = state.weights;
        let blended: Vec<(Preset, f64)> = combine(&user, &audio, weights.user, weights.audio)
            .into_iter()
            .filter(|(p, _)| *p != preset)
            .collect();
        let blended_score = |p: Preset| {
            blended
                .iter()
                .find(|(q, _)| *q == p)
                .map(|(_, s)| *s)
                .unwrap_or(0.0)
        };

        let in_track = |chunk: u32| end_chunk.map_or(true, |end| chunk < end);
        let mut requests = Vec::new();
        let mut request = |tier: TierName, p: Preset, chunk: u32, probability: f64| {
            if in_track(chunk) && state.tier(tier).admits(probability) {
                requests.push(ChunkRequest {
                    key: ChunkKey::new(track_id, p, chunk, intensity),
                    tier,
                    probability,
                });
            }
        };

        // L1: current and next chunk of every preset.
        let l1_presets = Preset::ALL
            .into_iter()
            .chain((!Preset::ALL.contains(&preset)).then_some(preset));
        for p in l1_presets {
            let probability = if p == preset {
                1.0
            } else {
                0.5 + 0.5 * blended_score(p).clamp(0.0, 1.0)
            };
            request(TierName::L1, p, current, probability);
            request(TierName::L1, p, current.saturating_add(1), probability);
        }

        let deep_start = current.saturating_add(2);

        // L2: deeper lookahead for the most likely next presets.
        let mut prefetched: Vec<Preset> = blended
            .iter()
            .filter(|(_, score)| *score > 0.0)
            .take(self.horizon.l2_top_presets)
            .map(|(p, _)| *p)
            .collect();
        for p in &prefetched {
            let score = blended_score(*p).clamp(0.0, 1.0);
            for i in 0..self.horizon.l2_lookahead {
                let chunk = deep_start.saturating_add(i);
                request(TierName::L2, *p, chunk, score * LOOKAHEAD_DECAY.powi(i as i32));
            }
        }

        // L3: long runway for the active preset.
        for i in 0..self.horizon.l3_lookahead {
            let chunk = deep_start.saturating_add(i);
            let probability = L3_BASE_PROBABILITY * LOOKAHEAD_DECAY.powi(i as i32);
            request(TierName::L3, preset, chunk, probability);
        }

        requests.sort_by(|a, b| {
            a.tier
                .cmp(&b.tier)
                .then_with(|| b.probability.total_cmp(&a.probability))
        });
        fit_to_budget(&mut requests, state.capacities(), state.chunk_bytes);
        prefetched.retain(|p| {
            requests
                .iter()
                .any(|r| r.tier == TierName::L2 && r.key.preset == *p)
        });

        let prediction = Prediction {
            user_top: (state.transitions.observations(preset) > 0)
                .then(|| user.first().map(|(p, _)| *p))
                .flatten(),
            audio_top: audio.top_other_than(preset),
            prefetched,
        };
        (requests, prediction)
    }

    /// Planned chunks for `track_id` that no tier holds yet, most urgent first.
    ///
    /// Empty when the track is not the active one.
    pub fn needed_requests(&self, track_id: u64) -> Vec<ChunkRequest> {
        let state = self.state.lock();
        match &state.playback {
            Some(p) if p.track_id == track_id => p
                .plan
                .iter()
                .filter(|r| state.resident_tier(&r.key).is_none())
                .copied()
                .collect(),
            _ => Vec::new(),
        }
    }

    /// Missing chunk indices per preset for `track_id`. No side effects.
    pub fn get_needed_chunks(&self, track_id: u64) -> BTreeMap<Preset, BTreeSet<u32>> {
        let mut needed: BTreeMap<Preset, BTreeSet<u32>> = BTreeMap::new();
        for request in self.needed_requests(track_id) {
            needed
                .entry(request.key.preset)
                .or_default()
                .insert(request.key.chunk_idx);
        }
        needed
    }

    /// Checks L1, then L2, then L3. Returns the answering tier, `None` on a
    /// miss.
    pub fn is_cached(
        &self,
        track_id: u64,
        preset: Preset,
        chunk_idx: u32,
        intensity: f32,
    ) -> Option<TierName> {
        let key = ChunkKey::new(track_id, preset, chunk_idx, intensity);
        let state = self.state.lock();

        let tier = TierName::ALL
            .into_iter()
            .find(|name| state.tier(*name).contains(&key));

        self.lookups.fetch_add(1, Ordering::Relaxed);
        if tier.is_some() {
            self.lookup_hits.fetch_add(1, Ordering::Relaxed);
        }
        debug!(
            "🔍 {} → {}",
            key,
            tier.map(|t| t.as_str()).unwrap_or("miss")
        );
        tier
    }

    /// Resident entry for `key`, without touching hit/miss statistics.
    pub fn cached_entry(&self, key: &ChunkKey) -> Option<CacheEntry> {
        let state = self.state.lock();
        state
            .resident_tier(key)
            .and_then(|name| state.tier(name).peek(key).cloned())
    }

    /// Stores a processed chunk into the tier it was requested for.
    ///
    /// Completions for a track that is no longer active are dropped. Returns
    /// whether the chunk ended up resident.
    pub fn complete_chunk(&self, request: &ChunkRequest, chunk: ProcessedChunk) -> bool {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let key = request.key;

        let Some(playback) = &state.playback else {
            debug!("⏭️ Descartando {}: no hay pista activa", key);
            return false;
        };
        if playback.track_id != key.track_id {
            debug!("⏭️ Descartando {}: la pista activa es {}", key, playback.track_id);
            return false;
        }

        if key.chunk_idx == playback.current_chunk
            && (key.preset == playback.preset || state.latest_samples.is_none())
        {
            state.latest_samples = Some(Arc::clone(&chunk.samples));
        }

        if chunk.size_bytes > state.chunk_bytes {
            state.chunk_bytes = chunk.size_bytes;
            state.refit_plan();
        }

        if let Some(existing) = state.resident_tier(&key) {
            state
                .tier_mut(existing)
                .refresh_probability(&key, request.probability);
            return true;
        }

        let entry = CacheEntry::new(key, request.probability, chunk.size_bytes)
            .with_artifact(chunk.artifact);
        let stored = state.tier_mut(request.tier).add_entry(entry);
        debug!(
            "📥 {} → {} ({} bytes, p={:.2}, guardado={})",
            key, request.tier, chunk.size_bytes, request.probability, stored
        );
        stored
    }

    /// Records that `chunk_idx` is past the end of `track_id`, so later chunks
    /// are no longer planned.
    pub fn mark_track_end(&self, track_id: u64, chunk_idx: u32) {
        let mut state = self.state.lock();
        if let Some(p) = state.playback.as_mut() {
            if p.track_id == track_id && p.end_chunk.map_or(true, |end| chunk_idx < end) {
                p.end_chunk = Some(chunk_idx);
                p.plan.retain(|r| r.key.chunk_idx < chunk_idx);
                debug!("🏁 La pista {} termina antes del chunk {}", track_id, chunk_idx);
            }
        }
    }

    pub fn active_track(&self) -> Option<u64> {
        self.state.lock().playback.as_ref().map(|p| p.track_id)
    }

    pub fn phase(&self) -> BufferPhase {
        self.state.lock().phase()
    }

    pub fn cache_stats(&self) -> CacheStats {
        let state = self.state.lock();
        let tiers: Vec<TierStats> = state.tiers.iter().map(CacheTier::stats).collect();
        let lookups = self.lookups.load(Ordering::Relaxed);
        let hits = self.lookup_hits.load(Ordering::Relaxed);

        CacheStats {
            total_size_bytes: tiers.iter().map(|t| t.size_bytes).sum(),
            total_entries: tiers.iter().map(|t| t.entry_count).sum(),
            tiers,
            overall_hit_rate: hit_rate(hits, lookups.saturating_sub(hits)),
            prediction_accuracy: state.accuracy.snapshot(),
            blend_weights: state.weights,
            active_track: state.playback.as_ref().map(|p| p.track_id),
            phase: state.phase(),
        }
    }

    /// Empties every tier. Counters and the transition model are kept.
    pub fn clear_all(&self) -> usize {
        let mut state = self.state.lock();
        let removed: usize = state.tiers.iter().map(CacheTier::len).sum();
        state.tiers.iter_mut().for_each(CacheTier::clear);
        info!("🧹 Todos los tiers vaciados ({} entradas)", removed);
        removed
    }

    pub fn clear_tier(&self, name: TierName) -> usize {
        let mut state = self.state.lock();
        let tier = state.tier_mut(name);
        let removed = tier.len();
        tier.clear();
        info!("🧹 {} vaciado ({} entradas)", name, removed);
        removed
    }

    /// Resizes one tier, evicting immediately when shrinking. Returns the
    /// number of evicted entries.
    pub fn set_tier_capacity(&self, name: TierName, max_size_bytes: u64) -> usize {
        let mut state = self.state.lock();
        let tier = state.tier_mut(name);
        if tier.max_size_bytes() == max_size_bytes {
            return 0;
        }
        let evicted = tier.set_max_size(max_size_bytes);
        state.refit_plan();
        info!(
            "📏 Capacidad de {} → {:.1}MB ({} desalojados)",
            name,
            max_size_bytes as f64 / (1024.0 * 1024.0),
            evicted
        );
        evicted
    }

    pub fn tier_capacities(&self) -> TierBudgets {
        let state = self.state.lock();
        TierBudgets {
            l1: state.tier(TierName::L1).max_size_bytes(),
            l2: state.tier(TierName::L2).max_size_bytes(),
            l3: state.tier(TierName::L3).max_size_bytes(),
        }
    }

    pub fn blend_weights(&self) -> BlendWeights {
        self.state.lock().weights
    }

    pub fn set_blend_weights(&self, weights: BlendWeights) {
        self.state.lock().weights = weights;
    }

    pub fn set_rules(&self, rules: RuleTable) {
        self.state.lock().content.set_rules(rules);
    }

    pub fn accuracy(&self) -> PredictionAccuracy {
        self.state.lock().accuracy.snapshot()
    }
}

/// Keeps, per tier, the leading requests whose expected size fits the tier's
/// budget. `plan` is ordered by tier, then probability descending.
fn fit_to_budget(plan: &mut Vec<ChunkRequest>, capacities: [u64; 3], chunk_bytes: u64) {
    let mut used = [0u64; 3];
    plan.retain(|request| {
        let tier = request.tier as usize;
        let fits = capacities[tier] > 0
            && used[tier].saturating_add(chunk_bytes) <= capacities[tier];
        if fits {
            used[tier] += chunk_bytes;
        }
        fits
    });
}

/// `floor(position / duration)`; negative or non-finite positions map to 0.
fn chunk_index(position_secs: f64, chunk_duration: f64) -> u32 {
    let idx = (position_secs / chunk_duration).floor();
    if idx.is_finite() && idx > 0.0 {
        idx.min(u32::MAX as f64) as u32
    } else {
        0
    }
}
