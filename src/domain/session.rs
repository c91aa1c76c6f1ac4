//! Per-subscription decode state.

use crate::domain::codec::{RunningStatusContext, TimedMessage};
use crate::domain::error::FramingError;
use crate::domain::models::MidiEvent;
use crate::domain::timestamp::TimestampReconstructor;
use tokio::time::Instant;

/// Everything a streaming session remembers between notifications.
///
/// Created when a subscription succeeds and dropped with the link, so no
/// running status or partial SysEx survives a reconnect.
#[derive(Debug, Default)]
pub struct SessionContext {
    codec: RunningStatusContext,
    clock: TimestampReconstructor,
    packets: u64,
    framing_errors: u64,
}

/// Result of decoding one notification.
#[derive(Debug)]
pub struct DecodedPacket {
    pub events: Vec<MidiEvent>,
    pub error: Option<FramingError>,
}

impl SessionContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn decode(&mut self, packet: &[u8], now: Instant) -> DecodedPacket {
        self.packets += 1;

        let mut messages: Vec<TimedMessage> = Vec::new();
        let error = self.codec.decode(packet, &mut messages).err();
        if error.is_some() {
            self.framing_errors += 1;
        }

        let events = messages
            .into_iter()
            .map(|m| MidiEvent {
                timestamp: self.clock.delivery_time(m.timestamp, now),
                status: m.status,
                data: m.data,
            })
            .collect();

        DecodedPacket { events, error }
    }

    pub fn packets(&self) -> u64 {
        self.packets
    }

    pub fn framing_errors(&self) -> u64 {
        self.framing_errors
    }

    pub fn clamped_events(&self) -> u64 {
        self.clock.clamped_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_fresh_session_has_no_running_status() {
        let now = Instant::now();
        let mut first = SessionContext::new();
        let decoded = first.decode(&[0x80, 0x81, 0x90, 60, 100], now);
        assert_eq!(decoded.events.len(), 1);
        let decoded = first.decode(&[0x80, 62, 100], now);
        assert_eq!(decoded.events[0].data, vec![62, 100]);

        let mut second = SessionContext::new();
        let decoded = second.decode(&[0x80, 62, 100], now);
        assert!(decoded.events.is_empty());
        assert_eq!(decoded.error, Some(FramingError::NoRunningStatus(62)));
        assert_eq!(second.framing_errors(), 1);
    }

    #[test]
    fn test_events_are_spaced_by_ble_timestamps() {
        let now = Instant::now();
        let mut session = SessionContext::new();
        let decoded = session.decode(&[0x80, 0x81, 0x90, 60, 100, 0x8B, 0x80, 60, 0], now);
        assert_eq!(decoded.events[0].timestamp, now);
        assert_eq!(
            decoded.events[1].timestamp - now,
            Duration::from_millis(10)
        );
        assert_eq!(session.packets(), 1);
    }
}
