use serde::Serialize;
use std::collections::VecDeque;

use crate::audio::Preset;

/// Outcomes remembered for the rolling accuracy.
const ACCURACY_WINDOW: usize = 50;

/// What was predicted for the next switch, captured before it happens.
#[derive(Debug, Clone, PartialEq)]
pub struct Prediction {
    /// Top user-behavior guess, `None` while the model has no data.
    pub user_top: Option<Preset>,
    pub audio_top: Preset,
    /// Presets that got an L2 lookahead.
    pub prefetched: Vec<Preset>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct Outcome {
    user: bool,
    audio: bool,
    prefetched: bool,
}

/// Rolling hit rates of each predictor against actual switches.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
pub struct PredictionAccuracy {
    pub samples: usize,
    pub user: f64,
    pub audio: f64,
    /// Share of switches that landed on a preset with an L2 lookahead.
    pub prefetched: f64,
}

#[derive(Debug, Default)]
pub struct AccuracyTracker {
    outcomes: VecDeque<Outcome>,
}

impl AccuracyTracker {
    pub fn record(&mut self, prediction: &Prediction, actual: Preset) {
        if self.outcomes.len() == ACCURACY_WINDOW {
            self.outcomes.pop_front();
        }
        self.outcomes.push_back(Outcome {
            user: prediction.user_top == Some(actual),
            audio: prediction.audio_top == actual,
            prefetched: prediction.prefetched.contains(&actual),
        });
    }

    pub fn snapshot(&self) -> PredictionAccuracy {
        let n = self.outcomes.len();
        if n == 0 {
            return PredictionAccuracy::default();
        }
        let rate = |f: fn(&Outcome) -> bool| {
            self.outcomes.iter().filter(|o| f(o)).count() as f64 / n as f64
        };
        PredictionAccuracy {
            samples: n,
            user: rate(|o| o.user),
            audio: rate(|o| o.audio),
            prefetched: rate(|o| o.prefetched),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rates_follow_outcomes_and_window_is_bounded() {
        let mut tracker = AccuracyTracker::default();
        assert_eq!(tracker.snapshot(), PredictionAccuracy::default());

        let prediction = Prediction {
            user_top: Some(Preset::Punchy),
            audio_top: Preset::Warm,
            prefetched: vec![Preset::Punchy, Preset::Warm],
        };
        tracker.record(&prediction, Preset::Punchy);
        tracker.record(&prediction, Preset::Warm);
        tracker.record(&prediction, Preset::Gentle);
        tracker.record(&prediction, Preset::Punchy);

        let snap = tracker.snapshot();
        assert_eq!(snap.samples, 4);
        assert_eq!(snap.user, 0.5);
        assert_eq!(snap.audio, 0.25);
        assert_eq!(snap.prefetched, 0.75);

        for _ in 0..100 {
            tracker.record(&prediction, Preset::Gentle);
        }
        let snap = tracker.snapshot();
        assert_eq!(snap.samples, ACCURACY_WINDOW);
        assert_eq!(snap.user, 0.0);
    }
}
