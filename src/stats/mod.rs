//! Packet-arrival statistics for one UDP listener

use std::time::{Duration, Instant};

/// Rolling counters for a listener; payload is never kept
#[derive(Debug, Clone, Default)]
pub struct ListenerStats {
    pub packets: u64,
    pub bytes: u64,
    pub first_packet: Option<Instant>,
    pub last_packet: Option<Instant>,
}

impl ListenerStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one datagram of `len` bytes arriving at `now`
    pub fn record(&mut self, len: usize, now: Instant) {
        self.packets += 1;
        self.bytes += len as u64;
        self.first_packet.get_or_insert(now);
        self.last_packet = Some(now);
    }

    /// Time since the most recent datagram, `None` before the first one
    pub fn last_packet_age(&self, now: Instant) -> Option<Duration> {
        self.last_packet.map(|t| now.saturating_duration_since(t))
    }

    /// Average input bitrate in kbps since the first datagram
    pub fn bitrate_kbps(&self, now: Instant) -> Option<f64> {
        let first = self.first_packet?;
        let seconds = now.saturating_duration_since(first).as_secs_f64().max(0.1);
        Some((self.bytes as f64 * 8.0 / 1000.0) / seconds)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn silent_listener_has_no_age() {
        let stats = ListenerStats::new();
        assert_eq!(stats.last_packet_age(Instant::now()), None);
        assert_eq!(stats.bitrate_kbps(Instant::now()), None);
    }

    #[test]
    fn age_and_bitrate_follow_recorded_packets() {
        let start = Instant::now();
        let mut stats = ListenerStats::new();
        stats.record(1316, start);
        stats.record(1316, start + Duration::from_millis(500));

        let now = start + Duration::from_secs(1);
        assert_eq!(stats.packets, 2);
        assert_eq!(stats.last_packet_age(now), Some(Duration::from_millis(500)));
        let kbps = stats.bitrate_kbps(now).unwrap();
        assert!((kbps - 21.056).abs() < 1e-6);
    }
}
