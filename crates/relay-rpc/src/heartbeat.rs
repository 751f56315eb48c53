//! Heartbeat bookkeeping.
//!
//! One ping is outstanding at a time. If the next tick arrives while the
//! previous ping is still unanswered the peer is considered dead.

use std::collections::VecDeque;
use std::time::Duration;
use tokio::time::Instant;

/// Number of latency samples retained.
pub const LATENCY_WINDOW: usize = 15;

/// Outcome of a heartbeat tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tick {
    /// Send a new ping.
    SendPing,
    /// The previous ping was never answered.
    Missed,
}

/// Ping/pong state for one connection.
#[derive(Debug)]
pub struct Heartbeat {
    ponged: bool,
    ping_sent_at: Option<Instant>,
    samples: VecDeque<Duration>,
}

impl Default for Heartbeat {
    fn default() -> Self {
        Self::new()
    }
}

impl Heartbeat {
    /// Starts as if a pong had just been received so the first tick pings.
    #[must_use]
    pub fn new() -> Self {
        Self {
            ponged: true,
            ping_sent_at: None,
            samples: VecDeque::with_capacity(LATENCY_WINDOW),
        }
    }

    /// Advance on an interval tick.
    pub fn on_tick(&mut self, now: Instant) -> Tick {
        if !self.ponged {
            return Tick::Missed;
        }

        self.ponged = false;
        self.ping_sent_at = Some(now);
        Tick::SendPing
    }

    /// Record a pong. Returns the measured round trip, if a ping was outstanding.
    pub fn on_pong(&mut self, now: Instant) -> Option<Duration> {
        self.ponged = true;
        let sent = self.ping_sent_at.take()?;
        let latency = now.saturating_duration_since(sent);

        if self.samples.len() == LATENCY_WINDOW {
            self.samples.pop_front();
        }
        self.samples.push_back(latency);
        Some(latency)
    }

    /// Snapshot of the retained samples.
    #[must_use]
    pub fn stats(&self) -> LatencyStats {
        LatencyStats::from_samples(&self.samples)
    }
}

/// Summary of recent round-trip samples.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LatencyStats {
    /// Most recent sample.
    pub latest: Option<Duration>,
    /// Mean of the retained samples.
    pub average: Option<Duration>,
    /// Number of retained samples.
    pub samples: usize,
}

impl LatencyStats {
    fn from_samples(samples: &VecDeque<Duration>) -> Self {
        let count = samples.len();
        let average = u32::try_from(count)
            .ok()
            .filter(|n| *n > 0)
            .map(|n| samples.iter().sum::<Duration>() / n);

        Self {
            latest: samples.back().copied(),
            average,
            samples: count,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_first_tick_sends_ping() {
        let mut hb = Heartbeat::new();
        assert_eq!(hb.on_tick(Instant::now()), Tick::SendPing);
    }

    #[test]
    fn test_unanswered_ping_is_missed_on_next_tick() {
        let mut hb = Heartbeat::new();
        let now = Instant::now();
        assert_eq!(hb.on_tick(now), Tick::SendPing);
        assert_eq!(hb.on_tick(now + Duration::from_secs(30)), Tick::Missed);
    }

    #[test]
    fn test_pong_records_latency_and_rearms() {
        let mut hb = Heartbeat::new();
        let now = Instant::now();
        hb.on_tick(now);

        let latency = hb.on_pong(now + Duration::from_millis(40)).unwrap();
        assert_eq!(latency, Duration::from_millis(40));
        assert_eq!(hb.on_tick(now + Duration::from_secs(30)), Tick::SendPing);

        let stats = hb.stats();
        assert_eq!(stats.latest, Some(Duration::from_millis(40)));
        assert_eq!(stats.samples, 1);
    }

    #[test]
    fn test_window_keeps_last_fifteen() {
        let mut hb = Heartbeat::new();
        let start = Instant::now();

        for i in 0..20u64 {
            let sent = start + Duration::from_secs(i * 30);
            hb.on_tick(sent);
            hb.on_pong(sent + Duration::from_millis(i + 1));
        }

        let stats = hb.stats();
        assert_eq!(stats.samples, LATENCY_WINDOW);
        assert_eq!(stats.latest, Some(Duration::from_millis(20)));
        // Samples 6..=20 ms are retained.
        assert_eq!(stats.average, Some(Duration::from_millis(13)));
    }

    #[test]
    fn test_unsolicited_pong_has_no_sample() {
        let mut hb = Heartbeat::new();
        assert!(hb.on_pong(Instant::now()).is_none());
        assert_eq!(hb.stats(), LatencyStats::default());
    }
}
