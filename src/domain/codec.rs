//! BLE-MIDI Packet Codec
//!
//! Decodes GATT notification payloads into timestamped MIDI messages and
//! encodes messages back into notification-sized packets.
//!
//! # Packet Structure
//!
//! ```text
//! [0]     : Header       1 0 t t t t t t   (t = timestamp bits 12..7)
//! [1]     : Timestamp    1 t t t t t t t   (t = timestamp bits 6..0)
//! [2]     : Status       1 s s s s s s s
//! [3..]   : Data         0 d d d d d d d
//!           ... then, per following message, one of:
//!           timestamp + status + data     full message
//!           timestamp + data              running status, new timestamp
//!           data                          running status, same timestamp
//! ```
//!
//! SysEx may span packets: a continuation packet is a header followed
//! directly by SysEx data bytes; the message ends with timestamp + 0xF7.

use crate::domain::error::FramingError;
use tracing::{trace, warn};

/// BLE-MIDI timestamps are 13 bits of milliseconds.
pub const TIMESTAMP_MODULUS: u16 = 1 << 13;

/// Payload size for the BLE minimum MTU (23) minus ATT overhead.
pub const DEFAULT_MAX_PACKET_LEN: usize = 20;

/// Header + timestamp + status + two data bytes.
const MIN_PACKET_LEN: usize = 5;

const SYSEX_START: u8 = 0xF0;
const SYSEX_END: u8 = 0xF7;

/// One decoded message with its raw 13-bit BLE timestamp.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimedMessage {
    pub timestamp: u16,
    pub status: u8,
    /// For SysEx, the payload between 0xF0 and 0xF7.
    pub data: Vec<u8>,
}

impl TimedMessage {
    pub fn new(timestamp: u16, status: u8, data: &[u8]) -> Self {
        Self {
            timestamp: timestamp % TIMESTAMP_MODULUS,
            status,
            data: data.to_vec(),
        }
    }
}

#[derive(Debug)]
struct SysExBuffer {
    timestamp: u16,
    data: Vec<u8>,
}

/// Decoder state for one notification stream.
///
/// Running status and a partial SysEx are only meaningful inside one
/// subscription, so a new context must be created for every session.
#[derive(Debug, Default)]
pub struct RunningStatusContext {
    last_timestamp: Option<u16>,
    running_status: Option<u8>,
    sysex: Option<SysExBuffer>,
}

/// Tracks the timestamp high bits while walking one packet.
struct PacketClock {
    high: u16,
    last_low: Option<u8>,
}

impl PacketClock {
    fn new(header: u8) -> Self {
        Self {
            high: (header & 0x3F) as u16,
            last_low: None,
        }
    }

    /// A low byte smaller than the previous one means the low 7 bits wrapped.
    fn advance(&mut self, timestamp_byte: u8) -> u16 {
        let low = timestamp_byte & 0x7F;
        if matches!(self.last_low, Some(prev) if low < prev) {
            self.high = (self.high + 1) & 0x3F;
        }
        self.last_low = Some(low);
        (self.high << 7) | low as u16
    }

    fn current(&self, fallback: Option<u16>) -> u16 {
        let low = self
            .last_low
            .or_else(|| fallback.map(|ts| (ts & 0x7F) as u8))
            .unwrap_or(0);
        (self.high << 7) | low as u16
    }
}

impl RunningStatusContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn running_status(&self) -> Option<u8> {
        self.running_status
    }

    pub fn in_sysex(&self) -> bool {
        self.sysex.is_some()
    }

    /// Decode one notification, appending complete messages to `out`.
    ///
    /// Messages decoded before a framing error stay in `out`. A SysEx aborted
    /// by a new status is reported after the rest of the packet is decoded;
    /// any other error stops decoding of this packet and takes precedence.
    pub fn decode(
        &mut self,
        packet: &[u8],
        out: &mut Vec<TimedMessage>,
    ) -> Result<(), FramingError> {
        let (&header, body) = packet.split_first().ok_or(FramingError::EmptyPacket)?;
        if header & 0x80 == 0 {
            return Err(FramingError::InvalidHeader(header));
        }

        trace!("BLE-MIDI packet: {:02X?}", packet);

        let mut aborted = None;
        match (self.decode_body(header, body, out, &mut aborted), aborted) {
            (Err(err), Some(aborted)) => {
                warn!("{} in {:02X?}, also: {}", err, packet, aborted);
                Err(err)
            }
            (Err(err), None) | (Ok(()), Some(err)) => Err(err),
            (Ok(()), None) => Ok(()),
        }
    }

    /// Decode the bytes after the header. A SysEx aborted by a new status
    /// is recorded in `aborted` and decoding carries on.
    fn decode_body(
        &mut self,
        header: u8,
        body: &[u8],
        out: &mut Vec<TimedMessage>,
        aborted: &mut Option<FramingError>,
    ) -> Result<(), FramingError> {
        let mut clock = PacketClock::new(header);
        let mut i = 0;

        while i < body.len() {
            let byte = body[i];

            if byte & 0x80 == 0 {
                if let Some(sysex) = self.sysex.as_mut() {
                    sysex.data.push(byte);
                    i += 1;
                } else {
                    // Running status, same timestamp as the previous message
                    let status = self
                        .running_status
                        .ok_or(FramingError::NoRunningStatus(byte))?;
                    let timestamp = clock.current(self.last_timestamp);
                    i = self.read_channel_message(status, timestamp, body, i, out)?;
                }
                continue;
            }

            let timestamp = clock.advance(byte);
            i += 1;
            let next = *body.get(i).ok_or(FramingError::DanglingTimestamp)?;

            if self.sysex.is_some() {
                match next {
                    SYSEX_END => {
                        if let Some(sysex) = self.sysex.take() {
                            out.push(TimedMessage {
                                timestamp: sysex.timestamp,
                                status: SYSEX_START,
                                data: sysex.data,
                            });
                        }
                        self.last_timestamp = Some(timestamp);
                        i += 1;
                        continue;
                    }
                    0xF8..=0xFF => {
                        out.push(TimedMessage::new(timestamp, next, &[]));
                        i += 1;
                        continue;
                    }
                    // Stray timestamp between SysEx data bytes
                    n if n & 0x80 == 0 => continue,
                    n => {
                        self.sysex = None;
                        aborted.get_or_insert(FramingError::SysExAborted(n));
                    }
                }
            }

            i = self.read_message(timestamp, body, i, out)?;
        }
        Ok(())
    }

    /// Read the message that follows a timestamp byte. Returns the index
    /// after the message.
    fn read_message(
        &mut self,
        timestamp: u16,
        body: &[u8],
        i: usize,
        out: &mut Vec<TimedMessage>,
    ) -> Result<usize, FramingError> {
        let byte = body[i];
        match byte {
            0xF8..=0xFF => {
                out.push(TimedMessage::new(timestamp, byte, &[]));
                self.last_timestamp = Some(timestamp);
                Ok(i + 1)
            }
            SYSEX_START => {
                self.running_status = None;
                let mut end = i + 1;
                while end < body.len() && body[end] & 0x80 == 0 {
                    end += 1;
                }
                self.sysex = Some(SysExBuffer {
                    timestamp,
                    data: body[i + 1..end].to_vec(),
                });
                Ok(end)
            }
            SYSEX_END => Err(FramingError::UnexpectedSysExEnd),
            0xF1..=0xF6 => {
                self.running_status = None;
                let (data, next) = read_data(byte, system_common_len(byte), body, i + 1)?;
                out.push(TimedMessage {
                    timestamp,
                    status: byte,
                    data,
                });
                self.last_timestamp = Some(timestamp);
                Ok(next)
            }
            0x80..=0xEF => self.read_channel_message(byte, timestamp, body, i + 1, out),
            _ => {
                // Running status with a new timestamp
                let status = self
                    .running_status
                    .ok_or(FramingError::NoRunningStatus(byte))?;
                self.read_channel_message(status, timestamp, body, i, out)
            }
        }
    }

    fn read_channel_message(
        &mut self,
        status: u8,
        timestamp: u16,
        body: &[u8],
        start: usize,
        out: &mut Vec<TimedMessage>,
    ) -> Result<usize, FramingError> {
        let (data, next) = read_data(status, channel_data_len(status), body, start)?;
        out.push(TimedMessage {
            timestamp,
            status,
            data,
        });
        self.running_status = Some(status);
        self.last_timestamp = Some(timestamp);
        Ok(next)
    }
}

fn read_data(
    status: u8,
    expected: usize,
    body: &[u8],
    start: usize,
) -> Result<(Vec<u8>, usize), FramingError> {
    let available = body[start.min(body.len())..]
        .iter()
        .take(expected)
        .take_while(|b| **b & 0x80 == 0)
        .count();
    if available < expected {
        return Err(FramingError::Truncated {
            status,
            expected,
            found: available,
        });
    }
    Ok((body[start..start + expected].to_vec(), start + expected))
}

/// Data bytes following a channel voice status.
pub fn channel_data_len(status: u8) -> usize {
    match status & 0xF0 {
        0xC0 | 0xD0 => 1,
        _ => 2,
    }
}

fn system_common_len(status: u8) -> usize {
    match status {
        0xF1 | 0xF3 => 1,
        0xF2 => 2,
        _ => 0,
    }
}

/// Builds notification payloads for [`encode`].
struct PacketBuilder {
    packets: Vec<Vec<u8>>,
    current: Vec<u8>,
    max_len: usize,
    high: u16,
    last_low: u8,
    /// Status and timestamp of the last channel message in this packet.
    running: Option<(u8, u16)>,
}

impl PacketBuilder {
    fn new(max_len: usize) -> Self {
        Self {
            packets: Vec::new(),
            current: Vec::new(),
            max_len: max_len.max(MIN_PACKET_LEN),
            high: 0,
            last_low: 0,
            running: None,
        }
    }

    fn flush(&mut self) {
        if self.current.len() > 1 {
            self.packets.push(std::mem::take(&mut self.current));
        }
        self.current.clear();
        self.running = None;
    }

    fn start_packet(&mut self, timestamp: u16) {
        self.flush();
        self.high = (timestamp >> 7) & 0x3F;
        self.last_low = 0;
        self.current.push(0x80 | self.high as u8);
    }

    /// Make sure `needed` bytes fit and the timestamp can be expressed
    /// relative to the current header.
    fn reserve(&mut self, timestamp: u16, needed: usize) {
        let high = (timestamp >> 7) & 0x3F;
        let low = (timestamp & 0x7F) as u8;
        let fits = !self.current.is_empty() && self.current.len() + needed <= self.max_len;
        if !fits || high != self.high || low < self.last_low {
            self.start_packet(timestamp);
        }
    }

    fn push_timestamp(&mut self, timestamp: u16) {
        let low = (timestamp & 0x7F) as u8;
        self.last_low = low;
        self.current.push(0x80 | low);
    }

    fn push_message(&mut self, message: &TimedMessage, compact: bool) {
        let ts = message.timestamp % TIMESTAMP_MODULUS;
        let status = message.status;

        if status == SYSEX_START {
            self.push_sysex(ts, &message.data);
            return;
        }

        let is_channel = (0x80..0xF0).contains(&status);
        let mut same_status =
            compact && is_channel && matches!(self.running, Some((s, _)) if s == status);
        let mut same_timestamp = same_status && matches!(self.running, Some((_, t)) if t == ts);

        let needed = message.data.len()
            + usize::from(!same_timestamp)
            + usize::from(!same_status);
        self.reserve(ts, needed);
        // A fresh packet carries no running status
        if self.running.is_none() {
            same_status = false;
            same_timestamp = false;
        }

        if !same_timestamp {
            self.push_timestamp(ts);
        }
        if !same_status {
            self.current.push(status);
        }
        self.current.extend_from_slice(&message.data);

        if is_channel {
            self.running = Some((status, ts));
        } else if status < 0xF8 {
            self.running = None;
        }
    }

    fn push_sysex(&mut self, ts: u16, payload: &[u8]) {
        self.reserve(ts, 3);
        self.push_timestamp(ts);
        self.current.push(SYSEX_START);
        self.running = None;

        for &byte in payload {
            if self.current.len() + 1 > self.max_len {
                self.start_packet(ts);
            }
            self.current.push(byte);
        }

        if self.current.len() + 2 > self.max_len {
            self.start_packet(ts);
        }
        self.push_timestamp(ts);
        self.current.push(SYSEX_END);
    }
}

/// Encode messages into BLE-MIDI notification payloads of at most
/// `max_packet_len` bytes.
///
/// Timestamps must be non-decreasing modulo the 13-bit wrap. With `compact`,
/// consecutive channel messages sharing a status omit it (and the timestamp
/// byte as well when that is also unchanged).
pub fn encode(messages: &[TimedMessage], max_packet_len: usize, compact: bool) -> Vec<Vec<u8>> {
    let mut builder = PacketBuilder::new(max_packet_len);
    for message in messages {
        builder.push_message(message, compact);
    }
    builder.flush();
    builder.packets
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_all(packets: &[Vec<u8>]) -> Vec<TimedMessage> {
        let mut ctx = RunningStatusContext::new();
        let mut out = Vec::new();
        for packet in packets {
            ctx.decode(packet, &mut out).unwrap();
        }
        out
    }

    fn pairs(messages: &[TimedMessage]) -> Vec<(u8, Vec<u8>)> {
        messages
            .iter()
            .map(|m| (m.status, m.data.clone()))
            .collect()
    }

    fn sample_messages() -> Vec<TimedMessage> {
        vec![
            TimedMessage::new(100, 0x90, &[60, 100]),
            TimedMessage::new(100, 0x90, &[64, 90]),
            TimedMessage::new(105, 0x90, &[67, 80]),
            TimedMessage::new(110, 0xF8, &[]),
            TimedMessage::new(110, 0x90, &[60, 0]),
            TimedMessage::new(120, 0xC0, &[5]),
            TimedMessage::new(120, 0xC0, &[6]),
            TimedMessage::new(130, 0xF0, &[0x43, 0x10, 0x4C, 0x00, 0x00, 0x7E, 0x00]),
            TimedMessage::new(140, 0xB0, &[64, 127]),
            TimedMessage::new(200, 0xE0, &[0x00, 0x40]),
            TimedMessage::new(300, 0xF2, &[0x10, 0x20]),
            TimedMessage::new(300, 0xB0, &[64, 0]),
        ]
    }

    #[test]
    fn test_decode_single_note_on() {
        let mut ctx = RunningStatusContext::new();
        let mut out = Vec::new();
        ctx.decode(&[0x80, 0x80, 0x90, 0x3C, 0x64], &mut out).unwrap();
        assert_eq!(out, vec![TimedMessage::new(0, 0x90, &[0x3C, 0x64])]);
        assert_eq!(ctx.running_status(), Some(0x90));
    }

    #[test]
    fn test_decode_timestamp_bits() {
        let mut ctx = RunningStatusContext::new();
        let mut out = Vec::new();
        // high = 0b000011, low = 0b0000101 -> (3 << 7) | 5
        ctx.decode(&[0x83, 0x85, 0xB0, 0x07, 0x64], &mut out).unwrap();
        assert_eq!(out[0].timestamp, (3 << 7) | 5);
    }

    #[test]
    fn test_running_status_without_timestamp() {
        let mut ctx = RunningStatusContext::new();
        let mut out = Vec::new();
        ctx.decode(&[0x80, 0x81, 0x90, 60, 100, 64, 100, 67, 100], &mut out)
            .unwrap();
        assert_eq!(out.len(), 3);
        assert!(out.iter().all(|m| m.status == 0x90 && m.timestamp == 1));
        assert_eq!(out[2].data, vec![67, 100]);
    }

    #[test]
    fn test_running_status_with_new_timestamp() {
        let mut ctx = RunningStatusContext::new();
        let mut out = Vec::new();
        ctx.decode(&[0x80, 0x81, 0xB0, 1, 2, 0x85, 1, 3], &mut out)
            .unwrap();
        assert_eq!(out[1], TimedMessage::new(5, 0xB0, &[1, 3]));
    }

    #[test]
    fn test_timestamp_low_wrap_inside_packet() {
        let mut ctx = RunningStatusContext::new();
        let mut out = Vec::new();
        ctx.decode(&[0x80, 0xFE, 0x90, 60, 1, 0x82, 0x80, 60, 0], &mut out)
            .unwrap();
        assert_eq!(out[0].timestamp, 0x7E);
        assert_eq!(out[1].timestamp, (1 << 7) | 2);
    }

    #[test]
    fn test_realtime_keeps_running_status() {
        let mut ctx = RunningStatusContext::new();
        let mut out = Vec::new();
        ctx.decode(&[0x80, 0x81, 0x90, 60, 100, 0x81, 0xF8, 64, 100], &mut out)
            .unwrap();
        assert_eq!(pairs(&out), vec![
            (0x90, vec![60, 100]),
            (0xF8, vec![]),
            (0x90, vec![64, 100]),
        ]);
    }

    #[test]
    fn test_system_common_cancels_running_status() {
        let mut ctx = RunningStatusContext::new();
        let mut out = Vec::new();
        let result = ctx.decode(&[0x80, 0x81, 0x90, 60, 100, 0x81, 0xF3, 2, 64], &mut out);
        assert_eq!(result, Err(FramingError::NoRunningStatus(64)));
        assert_eq!(pairs(&out), vec![(0x90, vec![60, 100]), (0xF3, vec![2])]);
    }

    #[test]
    fn test_empty_and_invalid_header() {
        let mut ctx = RunningStatusContext::new();
        let mut out = Vec::new();
        assert_eq!(ctx.decode(&[], &mut out), Err(FramingError::EmptyPacket));
        assert_eq!(
            ctx.decode(&[0x10, 0x80, 0x90, 1, 2], &mut out),
            Err(FramingError::InvalidHeader(0x10))
        );
        assert_eq!(ctx.decode(&[0x80], &mut out), Ok(()));
        assert!(out.is_empty());
    }

    #[test]
    fn test_truncated_message_keeps_context() {
        let mut ctx = RunningStatusContext::new();
        let mut out = Vec::new();
        ctx.decode(&[0x80, 0x81, 0x90, 60, 100], &mut out).unwrap();

        let result = ctx.decode(&[0x80, 0x82, 0xB0, 7], &mut out);
        assert_eq!(
            result,
            Err(FramingError::Truncated {
                status: 0xB0,
                expected: 2,
                found: 1
            })
        );
        assert_eq!(ctx.running_status(), Some(0x90));

        // Next packet decodes cleanly
        ctx.decode(&[0x80, 0x83, 0x80, 60, 0], &mut out).unwrap();
        assert_eq!(out.last().unwrap().status, 0x80);
    }

    #[test]
    fn test_bare_data_without_running_status() {
        let mut ctx = RunningStatusContext::new();
        let mut out = Vec::new();
        assert_eq!(
            ctx.decode(&[0x80, 60, 100], &mut out),
            Err(FramingError::NoRunningStatus(60))
        );
        assert!(out.is_empty());
    }

    #[test]
    fn test_dangling_timestamp_and_stray_end() {
        let mut ctx = RunningStatusContext::new();
        let mut out = Vec::new();
        assert_eq!(
            ctx.decode(&[0x80, 0x81], &mut out),
            Err(FramingError::DanglingTimestamp)
        );
        assert_eq!(
            ctx.decode(&[0x80, 0x81, 0xF7], &mut out),
            Err(FramingError::UnexpectedSysExEnd)
        );
    }

    #[test]
    fn test_sysex_spanning_two_packets() {
        let mut ctx = RunningStatusContext::new();
        let mut out = Vec::new();
        ctx.decode(&[0x80, 0x81, 0xF0, 0x43, 0x12, 0x00], &mut out)
            .unwrap();
        assert!(out.is_empty());
        assert!(ctx.in_sysex());

        ctx.decode(&[0x80, 0x01, 0x02, 0x03, 0x82, 0xF7], &mut out)
            .unwrap();
        assert!(!ctx.in_sysex());
        assert_eq!(
            out,
            vec![TimedMessage::new(
                1,
                0xF0,
                &[0x43, 0x12, 0x00, 0x01, 0x02, 0x03]
            )]
        );
    }

    #[test]
    fn test_realtime_inside_sysex() {
        let mut ctx = RunningStatusContext::new();
        let mut out = Vec::new();
        ctx.decode(&[0x80, 0x81, 0xF0, 0x01, 0x82, 0xF8, 0x02, 0x83, 0xF7], &mut out)
            .unwrap();
        assert_eq!(pairs(&out), vec![(0xF8, vec![]), (0xF0, vec![0x01, 0x02])]);
    }

    #[test]
    fn test_sysex_aborted_by_new_status() {
        let mut ctx = RunningStatusContext::new();
        let mut out = Vec::new();
        ctx.decode(&[0x80, 0x81, 0xF0, 0x01, 0x02], &mut out).unwrap();

        let result = ctx.decode(&[0x80, 0x82, 0x90, 60, 100], &mut out);
        assert_eq!(result, Err(FramingError::SysExAborted(0x90)));
        assert!(!ctx.in_sysex());
        // The message that aborted the SysEx is still delivered
        assert_eq!(pairs(&out), vec![(0x90, vec![60, 100])]);
    }

    #[test]
    fn test_truncation_outranks_sysex_abort() {
        let mut ctx = RunningStatusContext::new();
        let mut out = Vec::new();

        let result = ctx.decode(&[0x80, 0x81, 0xF0, 0x01, 0x82, 0x90, 60], &mut out);
        assert_eq!(
            result,
            Err(FramingError::Truncated {
                status: 0x90,
                expected: 2,
                found: 1
            })
        );
        assert!(!ctx.in_sysex());
        assert!(out.is_empty());
    }

    #[test]
    fn test_round_trip_regardless_of_packet_size() {
        let messages = sample_messages();
        for max_len in [5, 7, 12, 20, 64, 512] {
            for compact in [false, true] {
                let packets = encode(&messages, max_len, compact);
                assert!(packets.iter().all(|p| p.len() <= max_len.max(MIN_PACKET_LEN)));
                let decoded = decode_all(&packets);
                assert_eq!(
                    pairs(&decoded),
                    pairs(&messages),
                    "max_len {} compact {}",
                    max_len,
                    compact
                );
            }
        }
    }

    #[test]
    fn test_round_trip_preserves_timestamps() {
        let messages = sample_messages();
        let decoded = decode_all(&encode(&messages, DEFAULT_MAX_PACKET_LEN, true));
        let timestamps: Vec<u16> = decoded.iter().map(|m| m.timestamp).collect();
        let expected: Vec<u16> = messages.iter().map(|m| m.timestamp).collect();
        assert_eq!(timestamps, expected);
    }

    #[test]
    fn test_compaction_omits_status_and_timestamp() {
        let messages = vec![
            TimedMessage::new(1, 0x90, &[60, 100]),
            TimedMessage::new(1, 0x90, &[64, 100]),
        ];
        assert_eq!(
            encode(&messages, DEFAULT_MAX_PACKET_LEN, true),
            vec![vec![0x80, 0x81, 0x90, 60, 100, 64, 100]]
        );
        assert_eq!(
            encode(&messages, DEFAULT_MAX_PACKET_LEN, false),
            vec![vec![0x80, 0x81, 0x90, 60, 100, 0x81, 0x90, 64, 100]]
        );
    }

    #[test]
    fn test_encode_splits_on_timestamp_high_bits() {
        let messages = vec![
            TimedMessage::new(0x7F, 0x90, &[60, 100]),
            TimedMessage::new(0x80, 0x80, &[60, 0]),
        ];
        let packets = encode(&messages, DEFAULT_MAX_PACKET_LEN, true);
        assert_eq!(packets.len(), 2);
        assert_eq!(packets[1][0], 0x81);
        let decoded = decode_all(&packets);
        assert_eq!(decoded[1].timestamp, 0x80);
    }
}
