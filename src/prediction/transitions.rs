use std::collections::HashMap;
use tracing::debug;

use crate::audio::Preset;

/// First-order Markov model over preset switches.
///
/// Counts only grow. The preset set is small and fixed, so the matrix stays
/// O(k²).
#[derive(Debug, Default, Clone)]
pub struct TransitionPredictor {
    counts: HashMap<(Preset, Preset), u64>,
    totals: HashMap<Preset, u64>,
}

impl TransitionPredictor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Counts one observed switch. Self-transitions are not switches.
    pub fn record_transition(&mut self, from: Preset, to: Preset) -> bool {
        if from == to {
            return false;
        }
        *self.counts.entry((from, to)).or_default() += 1;
        *self.totals.entry(from).or_default() += 1;
        debug!("🔀 Transición {} → {}", from, to);
        true
    }

    pub fn count(&self, from: Preset, to: Preset) -> u64 {
        self.counts.get(&(from, to)).copied().unwrap_or(0)
    }

    /// Number of switches observed away from `from`.
    pub fn observations(&self, from: Preset) -> u64 {
        self.totals.get(&from).copied().unwrap_or(0)
    }

    /// Most likely next presets, best first, at most `top_n`.
    ///
    /// Without data for `current` every other preset is equally likely.
    /// Ties keep declaration order.
    pub fn predict_next(&self, current: Preset, top_n: usize) -> Vec<(Preset, f64)> {
        let total = self.observations(current);

        let mut ranked: Vec<(Preset, f64)> = if total == 0 {
            let candidates: Vec<Preset> =
                Preset::ALL.into_iter().filter(|p| *p != current).collect();
            if candidates.is_empty() {
                return vec![(Preset::NEUTRAL, 1.0)];
            }
            let uniform = 1.0 / candidates.len() as f64;
            candidates.into_iter().map(|p| (p, uniform)).collect()
        } else {
            Preset::ALL
                .into_iter()
                .chain(std::iter::once(Preset::Original))
                .filter(|p| *p != current)
                .filter_map(|to| match self.count(current, to) {
                    0 => None,
                    n => Some((to, n as f64 / total as f64)),
                })
                .collect()
        };

        ranked.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        ranked.truncate(top_n);
        ranked
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_counts_drive_probabilities() {
        let mut predictor = TransitionPredictor::new();
        for _ in 0..5 {
            predictor.record_transition(Preset::Adaptive, Preset::Punchy);
        }
        predictor.record_transition(Preset::Adaptive, Preset::Gentle);

        let next = predictor.predict_next(Preset::Adaptive, 3);
        assert_eq!(next.len(), 2);
        assert_eq!(next[0].0, Preset::Punchy);
        assert!((next[0].1 - 5.0 / 6.0).abs() < 1e-12);
        assert_eq!(next[1].0, Preset::Gentle);
        assert!((next[1].1 - 1.0 / 6.0).abs() < 1e-12);
    }

    #[test]
    fn test_self_transitions_are_ignored() {
        let mut predictor = TransitionPredictor::new();
        assert!(!predictor.record_transition(Preset::Warm, Preset::Warm));
        assert_eq!(predictor.observations(Preset::Warm), 0);
    }

    #[test]
    fn test_no_data_gives_uniform_over_the_others() {
        let predictor = TransitionPredictor::new();
        let next = predictor.predict_next(Preset::Bright, 10);
        assert_eq!(
            next.iter().map(|(p, _)| *p).collect::<Vec<_>>(),
            vec![Preset::Adaptive, Preset::Gentle, Preset::Warm, Preset::Punchy]
        );
        assert!(next.iter().all(|(_, prob)| (*prob - 0.25).abs() < 1e-12));
    }

    #[test]
    fn test_ties_follow_declaration_order_and_top_n_truncates() {
        let mut predictor = TransitionPredictor::new();
        predictor.record_transition(Preset::Gentle, Preset::Punchy);
        predictor.record_transition(Preset::Gentle, Preset::Warm);
        predictor.record_transition(Preset::Gentle, Preset::Adaptive);

        let next = predictor.predict_next(Preset::Gentle, 2);
        assert_eq!(
            next.iter().map(|(p, _)| *p).collect::<Vec<_>>(),
            vec![Preset::Adaptive, Preset::Warm]
        );
    }
}
