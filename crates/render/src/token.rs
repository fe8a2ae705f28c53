//! Default token estimation.
//!
//! A character-ratio heuristic: ~4 characters per token, rounded up. Close
//! enough to BPE tokenizers on English prose, and predictable in tests.

use promptloom_core::TokenEstimator;

/// Estimate tokens as `ceil(chars / ratio)`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CharRatioEstimator {
    chars_per_token: f64,
}

impl CharRatioEstimator {
    pub const DEFAULT_RATIO: f64 = 4.0;

    /// A non-positive or non-finite ratio falls back to the default.
    pub fn new(chars_per_token: f64) -> Self {
        let chars_per_token = if chars_per_token.is_finite() && chars_per_token > 0.0 {
            chars_per_token
        } else {
            Self::DEFAULT_RATIO
        };
        Self { chars_per_token }
    }

    pub fn chars_per_token(&self) -> f64 {
        self.chars_per_token
    }
}

impl Default for CharRatioEstimator {
    fn default() -> Self {
        Self::new(Self::DEFAULT_RATIO)
    }
}

impl TokenEstimator for CharRatioEstimator {
    fn estimate(&self, text: &str) -> usize {
        if text.is_empty() {
            return 0;
        }
        let chars = text.chars().count() as f64;
        (chars / self.chars_per_token).ceil() as usize
    }
}

/// Estimate with the default ratio.
pub fn estimate_tokens(text: &str) -> usize {
    CharRatioEstimator::default().estimate(text)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_string_is_zero() {
        assert_eq!(estimate_tokens(""), 0);
    }

    #[test]
    fn four_chars_is_one_token() {
        assert_eq!(estimate_tokens("test"), 1);
    }

    #[test]
    fn five_chars_rounds_up() {
        assert_eq!(estimate_tokens("hello"), 2);
    }

    #[test]
    fn hundred_chars() {
        assert_eq!(estimate_tokens(&"a".repeat(100)), 25);
    }

    #[test]
    fn counts_chars_not_bytes() {
        // 4 chars, 12 bytes.
        assert_eq!(estimate_tokens("日本語字"), 1);
    }

    #[test]
    fn custom_ratio() {
        let one_per_char = CharRatioEstimator::new(1.0);
        assert_eq!(one_per_char.estimate("Intro"), 5);
        let two = CharRatioEstimator::new(2.5);
        assert_eq!(two.estimate("abcdef"), 3);
    }

    #[test]
    fn bad_ratio_falls_back() {
        assert_eq!(CharRatioEstimator::new(0.0).chars_per_token(), 4.0);
        assert_eq!(CharRatioEstimator::new(f64::NAN).chars_per_token(), 4.0);
    }
}
