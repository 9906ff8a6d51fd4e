//! Deterministic token estimation.
//!
//! Estimators are not tokenizers. They only need to be monotone enough for
//! budgeting and identical across runs and hosts.

use serde::{Deserialize, Serialize};

/// Pluggable token counter.
pub trait TokenEstimator: Send + Sync {
    fn estimate(&self, text: &str) -> u64;

    /// Short identifier used in logs.
    fn name(&self) -> &'static str;
}

/// `ceil(chars / 4)`, with at least one token for non-empty text.
#[derive(Clone, Copy, Debug, Default)]
pub struct CharRatioEstimator;

impl TokenEstimator for CharRatioEstimator {
    fn estimate(&self, text: &str) -> u64 {
        let chars = text.chars().count() as u64;
        if chars == 0 { 0 } else { chars.div_ceil(4).max(1) }
    }

    fn name(&self) -> &'static str {
        "chars"
    }
}

/// One token per whitespace-separated word.
#[derive(Clone, Copy, Debug, Default)]
pub struct WhitespaceEstimator;

impl TokenEstimator for WhitespaceEstimator {
    fn estimate(&self, text: &str) -> u64 {
        text.split_whitespace().count() as u64
    }

    fn name(&self) -> &'static str {
        "words"
    }
}

/// Built-in estimator selection, as exposed on the command line.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EstimatorKind {
    #[default]
    Chars,
    Words,
}

impl EstimatorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Chars => "chars",
            Self::Words => "words",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "chars" => Some(Self::Chars),
            "words" => Some(Self::Words),
            _ => None,
        }
    }

    pub fn build(self) -> Box<dyn TokenEstimator> {
        match self {
            Self::Chars => Box::new(CharRatioEstimator),
            Self::Words => Box::new(WhitespaceEstimator),
        }
    }
}
