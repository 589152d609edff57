//! Retry policy: decides which failed captures a drain may pick up again.

/// Flat attempt ceiling.
///
/// A failed capture is retried on every drain until its `retry_count`
/// reaches `max_attempts`; after that only a manual retry-all revives it.
/// There is no growing delay between attempts: the auto-sync interval is the
/// only spacing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32) -> Self {
        Self { max_attempts }
    }

    /// Is a failed capture with `retry_count` failures still eligible?
    pub fn allows(&self, retry_count: u32) -> bool {
        retry_count < self.max_attempts
    }

    /// Has the capture used up its automatic attempts?
    pub fn is_exhausted(&self, retry_count: u32) -> bool {
        !self.allows(retry_count)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(5)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(0, true)]
    #[case(4, true)]
    #[case(5, false)]
    #[case(9, false)]
    fn ceiling_is_strict(#[case] retry_count: u32, #[case] eligible: bool) {
        let policy = RetryPolicy::default();
        assert_eq!(policy.allows(retry_count), eligible);
        assert_eq!(policy.is_exhausted(retry_count), !eligible);
    }

    #[test]
    fn zero_ceiling_never_retries() {
        assert!(!RetryPolicy::new(0).allows(0));
    }
}
