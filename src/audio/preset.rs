use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr};

/// Processing styles a chunk can be rendered with.
///
/// Declaration order matters: every ranking in the crate breaks ties by it.
/// `Original` is the unprocessed source and is not part of [`Preset::ALL`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Preset {
    Adaptive,
    Gentle,
    Warm,
    Bright,
    Punchy,
    Original,
}

impl Preset {
    /// The fixed set of processing presets, in declaration order.
    pub const ALL: [Preset; 5] = [
        Preset::Adaptive,
        Preset::Gentle,
        Preset::Warm,
        Preset::Bright,
        Preset::Punchy,
    ];

    /// Fallback when there is nothing to predict from.
    pub const NEUTRAL: Preset = Preset::Adaptive;

    pub fn as_str(&self) -> &'static str {
        match self {
            Preset::Adaptive => "adaptive",
            Preset::Gentle => "gentle",
            Preset::Warm => "warm",
            Preset::Bright => "bright",
            Preset::Punchy => "punchy",
            Preset::Original => "original",
        }
    }

    /// Position in [`Preset::ALL`], `None` for `Original`.
    pub fn index(&self) -> Option<usize> {
        Self::ALL.iter().position(|p| p == self)
    }

    /// Tone shaping applied by the file-backed processor:
    /// (high-shelf tilt, low emphasis, compression amount).
    pub fn shaping(&self) -> (f32, f32, f32) {
        match self {
            Preset::Adaptive => (0.1, 0.1, 0.3),
            Preset::Gentle => (-0.2, 0.1, 0.5),
            Preset::Warm => (-0.1, 0.4, 0.2),
            Preset::Bright => (0.5, -0.1, 0.2),
            Preset::Punchy => (0.2, 0.3, 0.7),
            Preset::Original => (0.0, 0.0, 0.0),
        }
    }
}

impl fmt::Display for Preset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Preset {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "adaptive" => Ok(Preset::Adaptive),
            "gentle" => Ok(Preset::Gentle),
            "warm" => Ok(Preset::Warm),
            "bright" => Ok(Preset::Bright),
            "punchy" => Ok(Preset::Punchy),
            "original" => Ok(Preset::Original),
            other => Err(format!("Preset '{}' no encontrado", other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_preset_names_roundtrip_through_from_str() {
        for preset in Preset::ALL {
            assert_eq!(preset.as_str().parse::<Preset>(), Ok(preset));
        }
        assert_eq!(" Original ".parse::<Preset>(), Ok(Preset::Original));
        assert!("loud".parse::<Preset>().is_err());
    }

    #[test]
    fn test_original_is_outside_the_processing_set() {
        assert_eq!(Preset::Original.index(), None);
        assert_eq!(Preset::Punchy.index(), Some(4));
        assert!(Preset::Adaptive < Preset::Punchy);
    }
}
