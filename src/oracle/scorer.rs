//! The pluggable artifact-quality seam.
//!
//! The composite weighting is part of the verification protocol and lives
//! here; what produces the three component signals is an implementation
//! detail behind the trait. The shipped baseline is deterministic on
//! purpose: two honest oracles scoring the same artifact must agree, or the
//! tolerance band does nothing.

use async_trait::async_trait;

use crate::error::MarketError;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScoreBreakdown {
    /// Structural quality of the artifact itself, in [0, 1].
    pub quality: f64,
    /// How well the content matches the market's stated expectations, in [0, 1].
    pub alignment: f64,
    /// Integrity signals (encoding, truncation, tampering), in [0, 1].
    pub integrity: f64,
}

impl ScoreBreakdown {
    /// Composite verification score: round(100 x (0.6q + 0.3a + 0.1i)).
    pub fn composite(&self) -> u8 {
        let quality = self.quality.clamp(0.0, 1.0);
        let alignment = self.alignment.clamp(0.0, 1.0);
        let integrity = self.integrity.clamp(0.0, 1.0);
        let weighted = 0.6 * quality + 0.3 * alignment + 0.1 * integrity;
        (weighted * 100.0).round().clamp(0.0, 100.0) as u8
    }
}

#[async_trait]
pub trait Scorer: Send + Sync {
    async fn score(
        &self,
        artifact: &[u8],
        expectations: &str,
    ) -> Result<ScoreBreakdown, MarketError>;
}

/// Deterministic content-derived baseline scorer.
///
/// Quality rewards non-trivial, line-structured artifacts; alignment is
/// keyword overlap against the expectation string; integrity checks UTF-8
/// validity and absence of truncation markers.
#[derive(Debug, Default)]
pub struct LexicalScorer;

impl LexicalScorer {
    fn quality_signal(artifact: &[u8]) -> f64 {
        if artifact.is_empty() {
            return 0.0;
        }
        // Saturating size signal: 4 KiB or more earns full marks.
        let size_signal = (artifact.len() as f64 / 4_096.0).min(1.0);

        // Structure signal: distinct byte diversity as a cheap proxy for
        // non-degenerate content (a run of one byte scores near zero).
        let mut seen = [false; 256];
        let mut distinct = 0usize;
        for byte in artifact {
            if !seen[*byte as usize] {
                seen[*byte as usize] = true;
                distinct += 1;
            }
        }
        let diversity_signal = (distinct as f64 / 64.0).min(1.0);

        0.5 * size_signal + 0.5 * diversity_signal
    }

    fn alignment_signal(artifact: &[u8], expectations: &str) -> f64 {
        let keywords: Vec<String> = expectations
            .split(|ch: char| !ch.is_alphanumeric())
            .filter(|word| word.len() >= 3)
            .map(|word| word.to_ascii_lowercase())
            .collect();
        if keywords.is_empty() {
            // Nothing asked for, nothing to misalign with.
            return 1.0;
        }
        let haystack = String::from_utf8_lossy(artifact).to_ascii_lowercase();
        let hits = keywords
            .iter()
            .filter(|word| haystack.contains(word.as_str()))
            .count();
        hits as f64 / keywords.len() as f64
    }

    fn integrity_signal(artifact: &[u8]) -> f64 {
        if artifact.is_empty() {
            return 0.0;
        }
        let mut signal: f64 = 1.0;
        if std::str::from_utf8(artifact).is_err() {
            signal -= 0.5;
        }
        if artifact.ends_with(b"\x00") {
            signal -= 0.3;
        }
        signal.max(0.0)
    }
}

#[async_trait]
impl Scorer for LexicalScorer {
    async fn score(
        &self,
        artifact: &[u8],
        expectations: &str,
    ) -> Result<ScoreBreakdown, MarketError> {
        Ok(ScoreBreakdown {
            quality: Self::quality_signal(artifact),
            alignment: Self::alignment_signal(artifact, expectations),
            integrity: Self::integrity_signal(artifact),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_composite_weighting() {
        let breakdown = ScoreBreakdown {
            quality: 1.0,
            alignment: 1.0,
            integrity: 1.0,
        };
        assert_eq!(breakdown.composite(), 100);

        let breakdown = ScoreBreakdown {
            quality: 0.5,
            alignment: 1.0,
            integrity: 0.0,
        };
        // 0.6*0.5 + 0.3*1.0 = 0.60 -> 60.
        assert_eq!(breakdown.composite(), 60);
    }

    #[test]
    fn test_composite_clamps_out_of_range_components() {
        let breakdown = ScoreBreakdown {
            quality: 1.7,
            alignment: -0.3,
            integrity: 1.0,
        };
        assert_eq!(breakdown.composite(), 70);
    }

    #[tokio::test]
    async fn test_lexical_scorer_is_deterministic() {
        let scorer = LexicalScorer;
        let artifact = b"market report: liquidity depth and spread analysis".repeat(40);
        let a = scorer.score(&artifact, "liquidity spread").await.unwrap();
        let b = scorer.score(&artifact, "liquidity spread").await.unwrap();
        assert_eq!(a, b);
        assert_eq!(a.alignment, 1.0);
    }

    #[tokio::test]
    async fn test_lexical_scorer_penalizes_degenerate_content() {
        let scorer = LexicalScorer;
        let junk = scorer.score(&[0u8; 4096], "anything").await.unwrap();
        let real = scorer
            .score(
                "structured findings with varied vocabulary across many lines\n"
                    .repeat(80)
                    .as_bytes(),
                "findings",
            )
            .await
            .unwrap();
        assert!(real.composite() > junk.composite());
    }
}
