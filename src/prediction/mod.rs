//! # Prediction Module
//!
//! Two independent guesses about the next preset, blended into one ranking.
//!
//! - [`transitions`]: what *this listener* tends to switch to, learned from
//!   observed switches (first-order Markov counts).
//! - [`content`]: what *this audio* suits, from cheap signal features run
//!   through a hot-reloadable rule table.
//!
//! [`combine`] merges both with a user/audio weight pair. The default split
//! (70/30) belongs to the self-tuner, which moves it as accuracy feedback
//! arrives.

pub mod content;
pub mod transitions;

pub use content::{
    combine, extract_features, AffinityRule, AudioContentPredictor, AudioFeatures, Condition,
    Feature, PresetAffinityScores, RuleTable,
};
pub use transitions::TransitionPredictor;
