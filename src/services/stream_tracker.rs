use crate::models::usage::Usage;
use crate::services::usage_service::estimate_tokens_from_chars;

/// Per-stream accounting state. Counts the characters actually sent
/// downstream and latches the upstream's own usage numbers when they arrive,
/// so finalize can bill from actuals and fall back to an estimate when the
/// upstream stayed silent or the client left early.
#[derive(Debug, Default)]
pub struct StreamTracker {
    sent_chars: usize,
    actual_usage: Option<Usage>,
}

impl StreamTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Additive character counter for emitted delta content.
    pub fn track_content(&mut self, s: &str) {
        self.sent_chars += s.chars().count();
    }

    /// Idempotent latch; the last observed actual usage wins.
    pub fn record_actual_usage(&mut self, usage: Usage) {
        self.actual_usage = Some(usage);
    }

    pub fn has_received_usage(&self) -> bool {
        self.actual_usage.is_some()
    }

    /// The usage to bill: latched actuals if present, otherwise an estimate
    /// from the tracked character count.
    pub fn build_usage(&self, prompt_tokens: u64, cached_tokens: u64) -> Usage {
        if let Some(usage) = self.actual_usage {
            return usage;
        }

        let completion_tokens = estimate_tokens_from_chars(self.sent_chars);
        Usage {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens + completion_tokens,
            cached_tokens,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn estimates_from_tracked_chars_when_upstream_was_silent() {
        let mut tracker = StreamTracker::new();
        tracker.track_content(&"a".repeat(10));
        tracker.track_content(&"b".repeat(20));
        tracker.track_content(&"c".repeat(30));

        let usage = tracker.build_usage(12, 0);
        assert!(!tracker.has_received_usage());
        assert_eq!(usage.completion_tokens, 30); // ceil(60 / 2)
        assert_eq!(usage.prompt_tokens, 12);
        assert_eq!(usage.total_tokens, 42);
    }

    #[test]
    fn actual_usage_latch_wins_over_estimate() {
        let mut tracker = StreamTracker::new();
        tracker.track_content("some streamed text");
        let actual = Usage {
            prompt_tokens: 100,
            completion_tokens: 50,
            total_tokens: 150,
            cached_tokens: 10,
        };
        tracker.record_actual_usage(actual);

        assert!(tracker.has_received_usage());
        assert_eq!(tracker.build_usage(1, 0), actual);
    }

    #[test]
    fn last_latched_usage_wins() {
        let mut tracker = StreamTracker::new();
        let first = Usage {
            prompt_tokens: 1,
            completion_tokens: 1,
            total_tokens: 2,
            cached_tokens: 0,
        };
        let second = Usage {
            prompt_tokens: 2,
            completion_tokens: 3,
            total_tokens: 5,
            cached_tokens: 0,
        };
        tracker.record_actual_usage(first);
        tracker.record_actual_usage(second);
        assert_eq!(tracker.build_usage(0, 0), second);
    }

    #[test]
    fn empty_stream_still_bills_one_completion_token() {
        let tracker = StreamTracker::new();
        let usage = tracker.build_usage(8, 0);
        assert_eq!(usage.completion_tokens, 1);
    }
}
