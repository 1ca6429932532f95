//! Device-presence heuristic.

use chrono::{DateTime, Duration as ChronoDuration, Utc};

/// Decides whether other devices are worth syncing with.
///
/// The gate answers two questions from one caller-supplied signal, the last
/// time any other device of this user was active:
///
/// - is a realtime backend subscription worth its cost right now?
/// - can a reconciliation pull be skipped entirely?
///
/// With no signal ever supplied the gate stays optimistic and assumes
/// syncing is needed.
#[derive(Debug, Clone, Copy)]
pub struct PresenceGate {
    window: ChronoDuration,
}

impl PresenceGate {
    /// Creates a gate with the given inactivity window.
    pub fn new(window: std::time::Duration) -> Self {
        Self {
            window: ChronoDuration::from_std(window).unwrap_or(ChronoDuration::MAX),
        }
    }

    /// Returns true if another device was recently active, or if presence
    /// was never reported.
    pub fn other_devices_active(
        &self,
        last_active: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> bool {
        match last_active {
            None => true,
            Some(at) => now.signed_duration_since(at) <= self.window,
        }
    }

    /// Returns true if a pull can be skipped: we pulled after the last
    /// other-device activity plus the window, so nothing else could have
    /// written since.
    pub fn skip_pull(
        &self,
        last_pulled: Option<DateTime<Utc>>,
        last_active: Option<DateTime<Utc>>,
    ) -> bool {
        match (last_pulled, last_active) {
            (Some(pulled), Some(active)) => pulled > active + self.window,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::time::Duration;

    fn ts(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    #[test]
    fn optimistic_without_signal() {
        let gate = PresenceGate::new(Duration::from_secs(60));
        assert!(gate.other_devices_active(None, ts(1000)));
    }

    #[test]
    fn active_within_window() {
        let gate = PresenceGate::new(Duration::from_secs(60));
        assert!(gate.other_devices_active(Some(ts(950)), ts(1000)));
        assert!(gate.other_devices_active(Some(ts(940)), ts(1000)));
        assert!(!gate.other_devices_active(Some(ts(900)), ts(1000)));
    }

    #[test]
    fn pull_skip_requires_both_signals() {
        let gate = PresenceGate::new(Duration::from_secs(60));
        assert!(!gate.skip_pull(None, None));
        assert!(!gate.skip_pull(Some(ts(1000)), None));
        assert!(!gate.skip_pull(None, Some(ts(1000))));
    }

    #[test]
    fn pull_skip_is_strict_about_the_window() {
        let gate = PresenceGate::new(Duration::from_secs(60));
        // Pulled well after the other device went quiet: skip.
        assert!(gate.skip_pull(Some(ts(1061)), Some(ts(1000))));
        // Pulled exactly at the window edge, or inside it: do not skip.
        assert!(!gate.skip_pull(Some(ts(1060)), Some(ts(1000))));
        assert!(!gate.skip_pull(Some(ts(1030)), Some(ts(1000))));
    }
}
