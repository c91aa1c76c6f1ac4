//! Timestamp Reconstructor
//!
//! Maps wrapped 13-bit BLE-MIDI timestamps onto the local monotonic clock.

use crate::domain::codec::TIMESTAMP_MODULUS;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

/// Largest gap honored between consecutive events.
pub const MAX_EVENT_DELTA: Duration = Duration::from_secs(2);

/// Milliseconds from `previous` to `current`, assuming at most one wrap.
pub fn elapsed_ms(previous: u16, current: u16) -> u16 {
    let previous = previous % TIMESTAMP_MODULUS;
    let current = current % TIMESTAMP_MODULUS;
    (current + TIMESTAMP_MODULUS - previous) % TIMESTAMP_MODULUS
}

/// Session-scoped anchor between the peripheral clock and ours.
#[derive(Debug, Default)]
pub struct TimestampReconstructor {
    anchor: Option<Anchor>,
    clamped: u64,
}

#[derive(Debug, Clone, Copy)]
struct Anchor {
    raw: u16,
    delivery: Instant,
}

impl TimestampReconstructor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delivery instant for an event stamped `raw`, observed at `now`.
    ///
    /// The first event of a session is delivered immediately. Later events
    /// keep their spacing relative to the previous one, never land in the
    /// past, and never wait longer than [`MAX_EVENT_DELTA`].
    pub fn delivery_time(&mut self, raw: u16, now: Instant) -> Instant {
        let delivery = match self.anchor {
            None => now,
            Some(anchor) => {
                let mut delta = Duration::from_millis(elapsed_ms(anchor.raw, raw) as u64);
                if delta > MAX_EVENT_DELTA {
                    debug!(
                        "Clamping timestamp delta {:?} (raw {} -> {})",
                        delta, anchor.raw, raw
                    );
                    self.clamped += 1;
                    delta = MAX_EVENT_DELTA;
                }
                (anchor.delivery + delta).clamp(now, now + MAX_EVENT_DELTA)
            }
        };

        self.anchor = Some(Anchor { raw, delivery });
        delivery
    }

    /// Number of deltas clamped so far in this session.
    pub fn clamped_count(&self) -> u64 {
        self.clamped
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_elapsed_across_wrap() {
        assert_eq!(elapsed_ms(8000, 50), 242);
        assert_eq!(elapsed_ms(100, 350), 250);
        assert_eq!(elapsed_ms(500, 500), 0);
    }

    #[test]
    fn test_first_event_is_immediate() {
        let now = Instant::now();
        let mut clock = TimestampReconstructor::new();
        assert_eq!(clock.delivery_time(4000, now), now);
    }

    #[test]
    fn test_events_keep_relative_spacing() {
        let now = Instant::now();
        let mut clock = TimestampReconstructor::new();
        let first = clock.delivery_time(8000, now);
        let second = clock.delivery_time(50, now);
        assert_eq!(second - first, Duration::from_millis(242));
    }

    #[test]
    fn test_large_delta_is_clamped() {
        let now = Instant::now();
        let mut clock = TimestampReconstructor::new();
        clock.delivery_time(0, now);
        let later = clock.delivery_time(5000, now);
        assert_eq!(later - now, MAX_EVENT_DELTA);
        assert_eq!(clock.clamped_count(), 1);
    }

    #[test]
    fn test_late_packet_is_not_scheduled_in_the_past() {
        let start = Instant::now();
        let mut clock = TimestampReconstructor::new();
        clock.delivery_time(100, start);

        // Peripheral says 10 ms passed, but the packet arrived 500 ms later
        let arrival = start + Duration::from_millis(500);
        assert_eq!(clock.delivery_time(110, arrival), arrival);

        // Spacing continues from the new anchor
        let next = clock.delivery_time(130, arrival);
        assert_eq!(next - arrival, Duration::from_millis(20));
    }
}
