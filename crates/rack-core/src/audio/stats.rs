//! Tick timing statistics
//!
//! Diagnostic counters only; nothing reads them to make decisions.

use std::time::{Duration, Instant};

/// Minimum spacing of repeated hot-path error messages
pub(crate) const ERROR_LOG_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickStats {
    /// Ticks executed
    pub ticks: u64,
    /// Ticks whose wait saw exactly one expiration
    pub on_time: u64,
    /// Ticks that missed one deadline
    pub missed_one: u64,
    /// Ticks that missed 2..=9 deadlines
    pub missed_few: u64,
    /// Ticks that missed 10 or more deadlines
    pub missed_many: u64,
    /// Time spent waiting for the clock
    pub idle: Duration,
    /// Stream overruns / disconnects seen
    pub xruns: u64,
    /// Successful stream recoveries
    pub recoveries: u64,
    /// Ticks where a stream had no frame to deliver
    pub starved_ticks: u64,
    /// `process_samples` failures across all cards
    pub card_errors: u64,
}

impl TickStats {
    /// Classify one tick by the number of clock expirations it consumed
    pub fn record_expirations(&mut self, expirations: u64) {
        self.ticks += 1;
        match expirations.saturating_sub(1) {
            0 => self.on_time += 1,
            1 => self.missed_one += 1,
            2..=9 => self.missed_few += 1,
            _ => self.missed_many += 1,
        }
    }

    /// Mean idle time per tick
    pub fn mean_idle(&self) -> Duration {
        if self.ticks == 0 {
            return Duration::ZERO;
        }
        self.idle / self.ticks.min(u64::from(u32::MAX)) as u32
    }

    pub fn log_summary(&self) {
        log::info!(
            "Audio: {} ticks, {} on time, missed 1: {}, missed <10: {}, missed ≥10: {}",
            self.ticks,
            self.on_time,
            self.missed_one,
            self.missed_few,
            self.missed_many
        );
        log::info!(
            "Audio: mean idle {:?}, xruns {}, recoveries {}, starved {}, card errors {}",
            self.mean_idle(),
            self.xruns,
            self.recoveries,
            self.starved_ticks,
            self.card_errors
        );
    }
}

/// Rate limiter for errors that can repeat every tick
#[derive(Debug, Default)]
pub(crate) struct LogThrottle {
    last: Option<Instant>,
    suppressed: u64,
}

impl LogThrottle {
    /// Returns the number of messages suppressed since the last one when a
    /// message may be logged now, `None` otherwise
    pub(crate) fn allow(&mut self) -> Option<u64> {
        let now = Instant::now();
        match self.last {
            Some(last) if now.duration_since(last) < ERROR_LOG_INTERVAL => {
                self.suppressed += 1;
                None
            }
            _ => {
                self.last = Some(now);
                Some(std::mem::take(&mut self.suppressed))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expiration_buckets() {
        let mut stats = TickStats::default();
        for expirations in [1, 1, 2, 3, 10, 11, 0] {
            stats.record_expirations(expirations);
        }
        assert_eq!(stats.ticks, 7);
        assert_eq!(stats.on_time, 3);
        assert_eq!(stats.missed_one, 1);
        assert_eq!(stats.missed_few, 2);
        assert_eq!(stats.missed_many, 1);
    }

    #[test]
    fn test_mean_idle() {
        let mut stats = TickStats::default();
        assert_eq!(stats.mean_idle(), Duration::ZERO);
        stats.ticks = 4;
        stats.idle = Duration::from_micros(800);
        assert_eq!(stats.mean_idle(), Duration::from_micros(200));
    }

    #[test]
    fn test_throttle_suppresses_bursts() {
        let mut throttle = LogThrottle::default();
        assert_eq!(throttle.allow(), Some(0));
        assert_eq!(throttle.allow(), None);
        assert_eq!(throttle.allow(), None);
        assert_eq!(throttle.suppressed, 2);
    }
}
