use std::{
    cmp::Ordering as CmpOrdering,
    collections::{BTreeSet, HashMap, HashSet},
    sync::atomic::{AtomicU64, Ordering},
};
use tracing::debug;

use super::{clamp_probability, hit_rate, CacheEntry, ChunkKey, TierName, TierStats};

#[derive(Debug)]
struct Slot {
    entry: CacheEntry,
    // Insertion order, breaks timestamp ties.
    seq: u64,
}

/// Byte-budgeted store with probability-ordered eviction.
///
/// Mutation takes `&mut self`; the owner serializes access. Hit and miss
/// counters are atomics so that [`CacheTier::contains`] works through a shared
/// reference.
#[derive(Debug)]
pub struct CacheTier {
    name: TierName,
    entries: HashMap<ChunkKey, Slot>,
    size_bytes: u64,
    max_size_bytes: u64,
    min_probability: f64,
    next_seq: u64,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

impl CacheTier {
    pub fn new(name: TierName, max_size_bytes: u64, min_probability: f64) -> Self {
        Self {
            name,
            entries: HashMap::new(),
            size_bytes: 0,
            max_size_bytes,
            min_probability: clamp_probability(min_probability),
            next_seq: 0,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    pub fn name(&self) -> TierName {
        self.name
    }

    pub fn max_size_bytes(&self) -> u64 {
        self.max_size_bytes
    }

    pub fn size_bytes(&self) -> u64 {
        self.size_bytes
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Whether a chunk with this probability should be planned into the tier.
    pub fn admits(&self, probability: f64) -> bool {
        self.max_size_bytes > 0 && probability >= self.min_probability
    }

    /// Inserts or overwrites by key, then evicts until back under budget.
    ///
    /// Returns `false` when the new entry itself was evicted.
    pub fn add_entry(&mut self, entry: CacheEntry) -> bool {
        let key = entry.key;
        if let Some(old) = self.entries.remove(&key) {
            self.size_bytes -= old.entry.size_bytes;
        }

        self.size_bytes += entry.size_bytes;
        let seq = self.next_seq;
        self.next_seq += 1;
        self.entries.insert(key, Slot { entry, seq });

        self.evict_to_budget();
        self.entries.contains_key(&key)
    }

    /// Membership test. The only place hit/miss statistics change.
    pub fn contains(&self, key: &ChunkKey) -> bool {
        let found = self.entries.contains_key(key);
        if found {
            self.hits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.misses.fetch_add(1, Ordering::Relaxed);
        }
        found
    }

    /// Looks up an entry without touching statistics.
    pub fn peek(&self, key: &ChunkKey) -> Option<&CacheEntry> {
        self.entries.get(key).map(|slot| &slot.entry)
    }

    /// Updates the probability of a resident entry. Returns `false` if absent.
    pub fn refresh_probability(&mut self, key: &ChunkKey, probability: f64) -> bool {
        match self.entries.get_mut(key) {
            Some(slot) => {
                slot.entry.probability = clamp_probability(probability);
                true
            }
            None => false,
        }
    }

    /// Removes and returns an entry, for promotion into another tier.
    pub fn take(&mut self, key: &ChunkKey) -> Option<CacheEntry> {
        let slot = self.entries.remove(key)?;
        self.size_bytes -= slot.entry.size_bytes;
        Some(slot.entry)
    }

    /// Drops every entry belonging to `track_id`.
    pub fn remove_track(&mut self, track_id: u64) -> usize {
        let before = self.entries.len();
        let mut freed = 0;
        self.entries.retain(|key, slot| {
            if key.track_id == track_id {
                freed += slot.entry.size_bytes;
                false
            } else {
                true
            }
        });
        self.size_bytes -= freed;

        let removed = before - self.entries.len();
        if removed > 0 {
            debug!("🧹 {}: eliminadas {} entradas de la pista {}", self.name, removed, track_id);
        }
        removed
    }

    /// Sets the probability of `track_id`'s entries outside `planned` to 0, so
    /// they are the first to go. Returns how many entries changed.
    pub fn demote_unplanned(&mut self, track_id: u64, planned: &HashSet<ChunkKey>) -> usize {
        let mut demoted = 0;
        for (key, slot) in self.entries.iter_mut() {
            if key.track_id == track_id && slot.entry.probability > 0.0 && !planned.contains(key) {
                slot.entry.probability = 0.0;
                demoted += 1;
            }
        }
        demoted
    }

    /// Drops everything. Hit/miss counters are cumulative and survive.
    pub fn clear(&mut self) {
        self.entries.clear();
        self.size_bytes = 0;
    }

    /// Changes the budget, evicting immediately when shrinking below usage.
    pub fn set_max_size(&mut self, max_size_bytes: u64) -> usize {
        self.max_size_bytes = max_size_bytes;
        self.evict_to_budget()
    }

    pub fn stats(&self) -> TierStats {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let tracks: BTreeSet<u64> = self.entries.keys().map(|k| k.track_id).collect();

        TierStats {
            name: self.name,
            size_bytes: self.size_bytes,
            max_size_bytes: self.max_size_bytes,
            entry_count: self.entries.len(),
            hits,
            misses,
            evictions: self.evictions.load(Ordering::Relaxed),
            hit_rate: hit_rate(hits, misses),
            tracks: tracks.into_iter().collect(),
        }
    }

    fn evict_to_budget(&mut self) -> usize {
        let mut evicted = 0;
        while self.size_bytes > self.max_size_bytes {
            let Some(victim) = self.next_victim() else {
                break;
            };
            if let Some(slot) = self.entries.remove(&victim) {
                self.size_bytes -= slot.entry.size_bytes;
                self.evictions.fetch_add(1, Ordering::Relaxed);
                evicted += 1;
                debug!(
                    "🗑️ {}: desalojado {} (p={:.3})",
                    self.name, victim, slot.entry.probability
                );
            }
        }
        evicted
    }

    /// Lowest probability, then oldest timestamp, then insertion order.
    fn next_victim(&self) -> Option<ChunkKey> {
        self.entries
            .iter()
            .min_by(|(ka, a), (kb, b)| eviction_order(a, b).then_with(|| ka.cmp(kb)))
            .map(|(key, _)| *key)
    }
}

fn eviction_order(a: &Slot, b: &Slot) -> CmpOrdering {
    a.entry
        .probability
        .total_cmp(&b.entry.probability)
        .then_with(|| a.entry.timestamp.cmp(&b.entry.timestamp))
        .then_with(|| a.seq.cmp(&b.seq))
}
