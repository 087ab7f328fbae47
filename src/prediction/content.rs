use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;

use crate::audio::Preset;

/// RMS that maps to full energy; typical mastered music sits well below it.
const ENERGY_REFERENCE: f32 = 0.4;
/// Crest factor range mapped onto 0..1 dynamics, in dB.
const CREST_DB_FLOOR: f32 = 3.0;
const CREST_DB_SPAN: f32 = 17.0;
/// One-pole coefficients splitting low / mid / high content.
const SLOW_POLE: f32 = 0.02;
const FAST_POLE: f32 = 0.25;
/// Samples per onset-detection frame.
const ONSET_FRAME: usize = 1024;
const ONSET_RISE: f32 = 1.5;
const PRESET_COUNT: usize = Preset::ALL.len();

fn unit(value: f32) -> f32 {
    if value.is_finite() {
        value.clamp(0.0, 1.0)
    } else {
        0.0
    }
}

/// Cheap per-chunk descriptors, each within 0..=1.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct AudioFeatures {
    pub energy: f32,
    pub brightness: f32,
    pub dynamics: f32,
    pub vocal_presence: f32,
    pub tempo_energy: f32,
}

impl AudioFeatures {
    pub fn get(&self, feature: Feature) -> f32 {
        match feature {
            Feature::Energy => self.energy,
            Feature::Brightness => self.brightness,
            Feature::Dynamics => self.dynamics,
            Feature::VocalPresence => self.vocal_presence,
            Feature::TempoEnergy => self.tempo_energy,
        }
    }
}

/// Extracts features from interleaved samples. Non-finite samples count as
/// silence.
pub fn extract_features(samples: &[f32]) -> AudioFeatures {
    if samples.is_empty() {
        return AudioFeatures::default();
    }

    let clean = |s: f32| if s.is_finite() { s } else { 0.0 };
    let n = samples.len() as f32;

    let mut sum_sq = 0.0f32;
    let mut diff_sq = 0.0f32;
    let mut band_sq = 0.0f32;
    let mut peak = 0.0f32;
    let mut prev = 0.0f32;
    let mut slow = 0.0f32;
    let mut fast = 0.0f32;

    for &raw in samples {
        let s = clean(raw);
        sum_sq += s * s;
        peak = peak.max(s.abs());
        let d = s - prev;
        diff_sq += d * d;
        prev = s;

        slow += SLOW_POLE * (s - slow);
        fast += FAST_POLE * (s - fast);
        let band = fast - slow;
        band_sq += band * band;
    }

    let rms = (sum_sq / n).sqrt();
    if rms <= f32::EPSILON {
        return AudioFeatures::default();
    }
    let diff_rms = (diff_sq / n).sqrt();
    let band_rms = (band_sq / n).sqrt();

    let crest_db = 20.0 * (peak / rms).log10();

    AudioFeatures {
        energy: unit(rms / ENERGY_REFERENCE),
        brightness: unit(diff_rms / (2.0 * rms)),
        dynamics: unit((crest_db - CREST_DB_FLOOR) / CREST_DB_SPAN),
        vocal_presence: unit(1.5 * band_rms / rms),
        tempo_energy: unit(3.0 * onset_rate(samples)),
    }
}

/// Fraction of frames whose energy jumps over the previous frame.
fn onset_rate(samples: &[f32]) -> f32 {
    let energies: Vec<f32> = samples
        .chunks(ONSET_FRAME)
        .map(|frame| {
            frame
                .iter()
                .map(|s| if s.is_finite() { s * s } else { 0.0 })
                .sum::<f32>()
                / frame.len() as f32
        })
        .collect();
    if energies.len() < 2 {
        return 0.0;
    }

    let rises = energies
        .windows(2)
        .filter(|w| w[1] > w[0] * ONSET_RISE && w[1] > 1e-6)
        .count();
    rises as f32 / (energies.len() - 1) as f32
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Feature {
    Energy,
    Brightness,
    Dynamics,
    VocalPresence,
    TempoEnergy,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "when", content = "threshold")]
pub enum Condition {
    Above(f32),
    Below(f32),
}

impl Condition {
    /// 0 when the condition does not hold, rising linearly to 1 at the far end.
    fn activation(&self, value: f32) -> f32 {
        match *self {
            Condition::Above(t) if value > t && t < 1.0 => (value - t) / (1.0 - t),
            Condition::Below(t) if value < t && t > 0.0 => (t - value) / t,
            _ => 0.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AffinityRule {
    pub feature: Feature,
    pub condition: Condition,
    pub boosts: Vec<(Preset, f32)>,
}

/// Rule data mapping features to preset affinity. Replaceable at runtime.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleTable {
    pub baseline: PresetAffinityScores,
    pub rules: Vec<AffinityRule>,
}

impl Default for RuleTable {
    fn default() -> Self {
        use Condition::{Above, Below};
        use Feature::*;
        use Preset::*;

        let rule = |feature, condition, boosts: &[(Preset, f32)]| AffinityRule {
            feature,
            condition,
            boosts: boosts.to_vec(),
        };

        Self {
            baseline: PresetAffinityScores::from_pairs(&[
                (Adaptive, 0.3),
                (Gentle, 0.1),
                (Warm, 0.1),
                (Bright, 0.1),
                (Punchy, 0.1),
            ]),
            rules: vec![
                rule(Energy, Above(0.6), &[(Punchy, 0.6), (Bright, 0.3)]),
                rule(Energy, Below(0.3), &[(Gentle, 0.6), (Warm, 0.4)]),
                rule(Brightness, Above(0.6), &[(Warm, 0.4), (Gentle, 0.2)]),
                rule(Brightness, Below(0.3), &[(Bright, 0.5)]),
                rule(Dynamics, Above(0.6), &[(Adaptive, 0.3), (Gentle, 0.2)]),
                rule(Dynamics, Below(0.3), &[(Punchy, 0.3)]),
                rule(VocalPresence, Above(0.5), &[(Warm, 0.3), (Adaptive, 0.2)]),
                rule(TempoEnergy, Above(0.5), &[(Punchy, 0.4), (Bright, 0.2)]),
            ],
        }
    }
}

/// One affinity per processing preset, each within 0..=1. Not normalized.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct PresetAffinityScores([f32; PRESET_COUNT]);

impl PresetAffinityScores {
    pub fn from_pairs(pairs: &[(Preset, f32)]) -> Self {
        let mut scores = Self::default();
        for (preset, score) in pairs {
            scores.set(*preset, *score);
        }
        scores
    }

    /// `Original` has no affinity and reads as 0.
    pub fn get(&self, preset: Preset) -> f32 {
        preset.index().map(|i| self.0[i]).unwrap_or(0.0)
    }

    pub fn set(&mut self, preset: Preset, score: f32) {
        if let Some(i) = preset.index() {
            self.0[i] = unit(score);
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (Preset, f32)> + '_ {
        Preset::ALL.into_iter().zip(self.0.iter().copied())
    }

    /// Best preset, ties in declaration order.
    pub fn top(&self) -> Preset {
        self.best(None)
    }

    /// Best preset a switch away from `current` can land on.
    pub fn top_other_than(&self, current: Preset) -> Preset {
        self.best(Some(current))
    }

    fn best(&self, skip: Option<Preset>) -> Preset {
        self.iter()
            .filter(|(p, _)| Some(*p) != skip)
            .fold(None::<(Preset, f32)>, |best, (p, s)| match best {
                Some((_, bs)) if bs >= s => best,
                _ => Some((p, s)),
            })
            .map(|(p, _)| p)
            .unwrap_or(Preset::NEUTRAL)
    }
}

/// Rule-driven preset affinity with a one-slot memo keyed on buffer identity.
#[derive(Debug, Default)]
pub struct AudioContentPredictor {
    rules: RuleTable,
    memo: Option<(Arc<[f32]>, AudioFeatures)>,
}

impl AudioContentPredictor {
    pub fn new(rules: RuleTable) -> Self {
        Self { rules, memo: None }
    }

    pub fn rules(&self) -> &RuleTable {
        &self.rules
    }

    pub fn set_rules(&mut self, rules: RuleTable) {
        debug!("📐 Tabla de reglas reemplazada ({} reglas)", rules.rules.len());
        self.rules = rules;
    }

    /// Features of `samples`, reusing the previous result for the same buffer.
    pub fn features(&mut self, samples: &Arc<[f32]>) -> AudioFeatures {
        if let Some((buffer, features)) = &self.memo {
            if Arc::ptr_eq(buffer, samples) {
                return *features;
            }
        }
        let features = extract_features(samples);
        self.memo = Some((Arc::clone(samples), features));
        features
    }

    pub fn score(&self, features: &AudioFeatures) -> PresetAffinityScores {
        let mut scores = self.rules.baseline;
        for rule in &self.rules.rules {
            let activation = rule.condition.activation(features.get(rule.feature));
            if activation <= 0.0 {
                continue;
            }
            for (preset, weight) in &rule.boosts {
                scores.set(*preset, scores.get(*preset) + activation * weight);
            }
        }
        scores
    }

    pub fn predict(&mut self, samples: &Arc<[f32]>) -> PresetAffinityScores {
        let features = self.features(samples);
        self.score(&features)
    }
}

/// Weighted blend of user-behavior probabilities and content affinity.
///
/// Sorted best first; ties keep declaration order. Weights are used as given.
pub fn combine(
    user: &[(Preset, f64)],
    audio: &PresetAffinityScores,
    user_weight: f64,
    audio_weight: f64,
) -> Vec<(Preset, f64)> {
    let user_prob = |preset: Preset| {
        user.iter()
            .find(|(p, _)| *p == preset)
            .map(|(_, prob)| *prob)
            .unwrap_or(0.0)
    };

    let mut blended: Vec<(Preset, f64)> = Preset::ALL
        .into_iter()
        .map(|p| {
            let score = user_weight * user_prob(p) + audio_weight * audio.get(p) as f64;
            (p, if score.is_finite() { score } else { 0.0 })
        })
        .collect();

    // Stable sort keeps declaration order for equal scores.
    blended.sort_by(|a, b| b.1.total_cmp(&a.1));
    blended
}
