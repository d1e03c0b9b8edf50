use std::time::{Duration, SystemTime};

/// Snapshot of delivery statistics.
///
/// Counters only grow until [super::Network::reset_stats] is called.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Stats {
    /// Messages admitted to the queue plus endpoints reached by broadcasts.
    pub sent: u64,
    /// Messages handed to their destination.
    pub received: u64,
    /// Messages lost to simulated packet loss or discarded at shutdown.
    pub dropped: u64,
    /// Messages whose destination was missing or refused them.
    pub errors: u64,
    /// When counting started.
    pub start_time: SystemTime,
}

impl Stats {
    pub(super) fn new() -> Self {
        Self {
            sent: 0,
            received: 0,
            dropped: 0,
            errors: 0,
            start_time: SystemTime::now(),
        }
    }

    /// Wall-clock time elapsed since counting started.
    pub fn uptime(&self) -> Duration {
        SystemTime::now()
            .duration_since(self.start_time)
            .unwrap_or_default()
    }

    /// Percentage of settled point-to-point messages (received, dropped or failed) that
    /// reached their destination, if any have settled.
    pub fn delivery_rate(&self) -> Option<f64> {
        let settled = self.received + self.dropped + self.errors;
        if settled == 0 {
            return None;
        }
        Some(100.0 * self.received as f64 / settled as f64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delivery_rate() {
        let mut stats = Stats::new();
        assert_eq!(stats.delivery_rate(), None);

        // Broadcast fan-out alone settles nothing
        stats.sent = 4;
        assert_eq!(stats.delivery_rate(), None);

        stats.received = 6;
        stats.dropped = 1;
        stats.errors = 1;
        assert_eq!(stats.delivery_rate(), Some(75.0));
    }

    #[test]
    fn test_uptime() {
        let mut stats = Stats::new();
        stats.start_time = SystemTime::now() - Duration::from_secs(5);
        assert!(stats.uptime() >= Duration::from_secs(5));

        // Clock skew never panics
        stats.start_time = SystemTime::now() + Duration::from_secs(60);
        assert_eq!(stats.uptime(), Duration::ZERO);
    }
}
