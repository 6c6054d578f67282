//! Suppression of repeated identical messages.

use std::collections::HashMap;

use time::{Duration, OffsetDateTime};

/// How many identical messages may go out per window.
const MAX_OCCURRENCES: usize = 3;

/// The sliding window length.
const WINDOW: Duration = Duration::seconds(3600);

/// Tracks recent message-event text and decides whether another
/// occurrence may still be sent.
///
/// Occurrences are counted over a sliding window; entries older than
/// the window are purged before counting, so a burst stops being held
/// against a message once it ages out. Suppressed occurrences are not
/// recorded, only delivered ones count toward the ceiling.
#[derive(Debug)]
pub struct Dedup {
    max_occurrences: usize,
    window: Duration,
    seen: HashMap<String, Vec<OffsetDateTime>>,
}

impl Default for Dedup {
    fn default() -> Dedup {
        Dedup::new()
    }
}

impl Dedup {
    pub fn new() -> Dedup {
        Dedup::with_limits(MAX_OCCURRENCES, WINDOW)
    }

    pub fn with_limits(max_occurrences: usize, window: Duration) -> Dedup {
        Dedup {
            max_occurrences,
            window,
            seen: HashMap::new(),
        }
    }

    /// Whether a message observed at `now` may be sent. Records the
    /// occurrence only when the answer is yes.
    pub fn should_send(&mut self, message: &str, now: OffsetDateTime) -> bool {
        let cutoff = now - self.window;
        let occurrences = self.seen.entry(message.to_owned()).or_default();
        occurrences.retain(|&at| at > cutoff);
        if occurrences.len() >= self.max_occurrences {
            return false;
        }
        occurrences.push(now);
        true
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn at(secs: i64) -> OffsetDateTime {
        OffsetDateTime::from_unix_timestamp(1_700_000_000 + secs).unwrap()
    }

    #[test]
    fn test_ceiling_per_window() {
        let mut dedup = Dedup::new();
        assert!(dedup.should_send("boom", at(0)));
        assert!(dedup.should_send("boom", at(1)));
        assert!(dedup.should_send("boom", at(2)));
        assert!(!dedup.should_send("boom", at(3)));
        assert!(!dedup.should_send("boom", at(4)));
    }

    #[test]
    fn test_window_expiry_frees_budget() {
        let mut dedup = Dedup::with_limits(2, Duration::seconds(10));
        assert!(dedup.should_send("boom", at(0)));
        assert!(dedup.should_send("boom", at(1)));
        assert!(!dedup.should_send("boom", at(5)));
        // Both early occurrences have aged out by t=11.
        assert!(dedup.should_send("boom", at(11)));
        assert!(dedup.should_send("boom", at(12)));
        assert!(!dedup.should_send("boom", at(13)));
    }

    #[test]
    fn test_messages_are_tracked_independently() {
        let mut dedup = Dedup::with_limits(1, Duration::seconds(10));
        assert!(dedup.should_send("boom", at(0)));
        assert!(dedup.should_send("bang", at(0)));
        assert!(!dedup.should_send("boom", at(1)));
        assert!(!dedup.should_send("bang", at(1)));
    }

    #[test]
    fn test_suppressed_occurrences_are_not_recorded() {
        let mut dedup = Dedup::with_limits(2, Duration::seconds(10));
        assert!(dedup.should_send("boom", at(0)));
        assert!(dedup.should_send("boom", at(1)));
        // Suppressed attempts must not extend the window: only the two
        // delivered occurrences count, and both age out by t=12.
        for s in 2..=9 {
            assert!(!dedup.should_send("boom", at(s)));
        }
        assert!(dedup.should_send("boom", at(12)));
    }
}
