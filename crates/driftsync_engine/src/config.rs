//! Configuration for the sync engine.

use std::time::Duration;

/// Configuration for the sync engine.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Interval between drain loop ticks.
    pub drain_interval: Duration,
    /// How recently another device must have been active for the presence
    /// gate to keep the realtime backend subscription alive, and for a
    /// pull to be considered necessary.
    pub inactivity_window: Duration,
    /// Ids requested per backend page fetch.
    pub pull_page_size: usize,
    /// Retention for echo-suppression entries. `None` keeps them for the
    /// lifetime of the engine, matching the reference behavior at the cost
    /// of unbounded growth.
    pub echo_retention: Option<Duration>,
    /// Capacity of the sync activity event channel.
    pub event_capacity: usize,
}

impl EngineConfig {
    /// Creates the default configuration.
    pub fn new() -> Self {
        Self {
            drain_interval: Duration::from_secs(10),
            inactivity_window: Duration::from_secs(600),
            pull_page_size: 100,
            echo_retention: Some(Duration::from_secs(1800)),
            event_capacity: 256,
        }
    }

    /// Sets the drain interval.
    pub fn with_drain_interval(mut self, interval: Duration) -> Self {
        self.drain_interval = interval;
        self
    }

    /// Sets the presence inactivity window.
    pub fn with_inactivity_window(mut self, window: Duration) -> Self {
        self.inactivity_window = window;
        self
    }

    /// Sets the pull page size.
    pub fn with_pull_page_size(mut self, size: usize) -> Self {
        self.pull_page_size = size;
        self
    }

    /// Sets the echo-suppression retention.
    pub fn with_echo_retention(mut self, retention: Option<Duration>) -> Self {
        self.echo_retention = retention;
        self
    }

    /// Sets the event channel capacity.
    pub fn with_event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity;
        self
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_builder() {
        let config = EngineConfig::new()
            .with_drain_interval(Duration::from_millis(50))
            .with_inactivity_window(Duration::from_secs(60))
            .with_pull_page_size(10)
            .with_echo_retention(None);

        assert_eq!(config.drain_interval, Duration::from_millis(50));
        assert_eq!(config.inactivity_window, Duration::from_secs(60));
        assert_eq!(config.pull_page_size, 10);
        assert_eq!(config.echo_retention, None);
    }

    #[test]
    fn defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.pull_page_size, 100);
        assert!(config.echo_retention.is_some());
    }
}
