//! Entropy sources with known output.

use logsig_tree::{EntropySource, TreeError};

/// Fills every IV with the same repeating pattern.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FixedEntropy {
    pattern: Vec<u8>,
}

impl FixedEntropy {
    /// Repeats `pattern` over the whole buffer; an empty pattern yields zeros.
    pub fn new(pattern: Vec<u8>) -> Self {
        Self { pattern }
    }

    /// Counting bytes `00 01 02 ..` wrapping at 256.
    pub fn counting() -> Self {
        Self::new((0..=u8::MAX).collect())
    }
}

impl EntropySource for FixedEntropy {
    fn fill(&self, buf: &mut [u8]) -> logsig_tree::Result<()> {
        if self.pattern.is_empty() {
            buf.fill(0);
            return Ok(());
        }
        for (byte, value) in buf.iter_mut().zip(self.pattern.iter().cycle()) {
            *byte = *value;
        }
        Ok(())
    }
}

/// Source that always fails, as an unreadable random device would.
#[derive(Debug, Clone, Copy, Default)]
pub struct FailingEntropy;

impl EntropySource for FailingEntropy {
    fn fill(&self, _buf: &mut [u8]) -> logsig_tree::Result<()> {
        Err(TreeError::entropy("random source unavailable"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counting_entropy_starts_at_zero_every_fill() {
        let source = FixedEntropy::counting();
        let mut first = [0xFFu8; 4];
        let mut second = [0xFFu8; 4];
        source.fill(&mut first).unwrap();
        source.fill(&mut second).unwrap();

        assert_eq!(first, [0, 1, 2, 3]);
        assert_eq!(first, second);
    }

    #[test]
    fn pattern_repeats() {
        let mut buf = [0u8; 5];
        FixedEntropy::new(vec![0xAB, 0xCD]).fill(&mut buf).unwrap();
        assert_eq!(buf, [0xAB, 0xCD, 0xAB, 0xCD, 0xAB]);
    }

    #[test]
    fn failing_entropy_reports_unavailable() {
        let err = FailingEntropy.fill(&mut [0u8; 4]).unwrap_err();
        assert!(matches!(err, TreeError::EntropyUnavailable { .. }));
    }
}
