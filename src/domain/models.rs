use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::time::Instant;

/// A BLE advertisement that may be the configured MIDI peripheral.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceDescriptor {
    /// Platform Bluetooth address.
    pub address: u64,
    pub name: String,
    /// RSSI in dBm.
    pub signal_strength: i16,
}

impl DeviceDescriptor {
    /// Address formatted as `AA:BB:CC:DD:EE:FF`.
    pub fn address_string(&self) -> String {
        let bytes = self.address.to_be_bytes();
        bytes[2..]
            .iter()
            .map(|b| format!("{:02X}", b))
            .collect::<Vec<_>>()
            .join(":")
    }
}

/// A decoded MIDI message with its local delivery instant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MidiEvent {
    pub status: u8,
    /// Data bytes. For SysEx this is the payload between 0xF0 and 0xF7.
    pub data: Vec<u8>,
    pub timestamp: Instant,
}

impl MidiEvent {
    /// Raw MIDI bytes as written to an output port.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(self.data.len() + 2);
        bytes.push(self.status);
        bytes.extend_from_slice(&self.data);
        if self.status == 0xF0 {
            bytes.push(0xF7);
        }
        bytes
    }

    pub fn summary(&self) -> ActivitySummary {
        ActivitySummary::from_message(self.status, &self.data)
    }
}

/// Why a streaming session ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DisconnectReason {
    /// The peripheral dropped the link or went out of range.
    LinkLost(String),
    /// The notification channel closed without a reason from the platform.
    StreamClosed,
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::LinkLost(reason) => write!(f, "link lost: {}", reason),
            Self::StreamClosed => write!(f, "notification stream closed"),
        }
    }
}

/// Connection supervisor state, one per supervisor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionState {
    Idle,
    Scanning,
    Connecting,
    Subscribing,
    Streaming,
    Disconnected(DisconnectReason),
    BackingOff,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => write!(f, "Idle"),
            Self::Scanning => write!(f, "Scanning"),
            Self::Connecting => write!(f, "Connecting"),
            Self::Subscribing => write!(f, "Subscribing"),
            Self::Streaming => write!(f, "Streaming"),
            Self::Disconnected(reason) => write!(f, "Disconnected ({})", reason),
            Self::BackingOff => write!(f, "Backing off"),
        }
    }
}

/// Short description of a forwarded message, for activity indicators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActivitySummary {
    NoteOn { channel: u8, note: u8, velocity: u8 },
    /// Includes Note On with velocity 0.
    NoteOff { channel: u8, note: u8 },
    PolyPressure { channel: u8, note: u8, pressure: u8 },
    ControlChange { channel: u8, controller: u8, value: u8 },
    ProgramChange { channel: u8, program: u8 },
    ChannelPressure { channel: u8, pressure: u8 },
    /// 14-bit value, center = 8192.
    PitchBend { channel: u8, value: u16 },
    SysEx { length: usize },
    System { status: u8 },
}

impl ActivitySummary {
    pub fn from_message(status: u8, data: &[u8]) -> Self {
        let channel = status & 0x0F;
        let d0 = data.first().copied().unwrap_or(0);
        let d1 = data.get(1).copied().unwrap_or(0);

        match status & 0xF0 {
            0x80 => Self::NoteOff { channel, note: d0 },
            0x90 if d1 == 0 => Self::NoteOff { channel, note: d0 },
            0x90 => Self::NoteOn {
                channel,
                note: d0,
                velocity: d1,
            },
            0xA0 => Self::PolyPressure {
                channel,
                note: d0,
                pressure: d1,
            },
            0xB0 => Self::ControlChange {
                channel,
                controller: d0,
                value: d1,
            },
            0xC0 => Self::ProgramChange {
                channel,
                program: d0,
            },
            0xD0 => Self::ChannelPressure {
                channel,
                pressure: d0,
            },
            0xE0 => Self::PitchBend {
                channel,
                value: ((d1 as u16) << 7) | d0 as u16,
            },
            _ if status == 0xF0 => Self::SysEx { length: data.len() },
            _ => Self::System { status },
        }
    }
}

impl fmt::Display for ActivitySummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::NoteOn {
                channel,
                note,
                velocity,
            } => write!(
                f,
                "Note On: note {} (velocity {}) ch {}",
                note,
                velocity,
                channel + 1
            ),
            Self::NoteOff { channel, note } => {
                write!(f, "Note Off: note {} ch {}", note, channel + 1)
            }
            Self::PolyPressure {
                channel,
                note,
                pressure,
            } => write!(
                f,
                "Poly Pressure: note {} = {} ch {}",
                note,
                pressure,
                channel + 1
            ),
            Self::ControlChange {
                channel,
                controller,
                value,
            } => write!(
                f,
                "Control Change: {} = {} ch {}",
                controller,
                value,
                channel + 1
            ),
            Self::ProgramChange { channel, program } => {
                write!(f, "Program Change: {} ch {}", program, channel + 1)
            }
            Self::ChannelPressure { channel, pressure } => {
                write!(f, "Channel Pressure: {} ch {}", pressure, channel + 1)
            }
            Self::PitchBend { channel, value } => {
                write!(f, "Pitch Bend: {} ch {}", value, channel + 1)
            }
            Self::SysEx { length } => write!(f, "SysEx: {} bytes", length),
            Self::System { status } => write!(f, "System: {:#04X}", status),
        }
    }
}

/// Events published to the UI collaborator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AppEvent {
    ConnectionStatus(ConnectionState),
    MidiActivity(ActivitySummary),
    LogMessage(StatusMessage),
    SinkError(String),
}

/// Commands accepted by the connection supervisor.
#[derive(Debug, Clone)]
pub enum BridgeCommand {
    Start,
    Stop,
    Reconfigure(crate::domain::settings::Configuration),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusMessage {
    pub message: String,
    pub severity: MessageSeverity,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageSeverity {
    Info,
    Success,
    Warning,
    Error,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_note_on_zero_velocity_is_note_off() {
        assert_eq!(
            ActivitySummary::from_message(0x93, &[60, 0]),
            ActivitySummary::NoteOff {
                channel: 3,
                note: 60
            }
        );
    }

    #[test]
    fn test_pitch_bend_value() {
        let summary = ActivitySummary::from_message(0xE0, &[0x00, 0x40]);
        assert_eq!(
            summary,
            ActivitySummary::PitchBend {
                channel: 0,
                value: 8192
            }
        );
        assert_eq!(summary.to_string(), "Pitch Bend: 8192 ch 1");
    }

    #[test]
    fn test_sysex_bytes_are_terminated() {
        let event = MidiEvent {
            status: 0xF0,
            data: vec![0x43, 0x10],
            timestamp: Instant::now(),
        };
        assert_eq!(event.to_bytes(), vec![0xF0, 0x43, 0x10, 0xF7]);
        assert_eq!(event.summary(), ActivitySummary::SysEx { length: 2 });
    }

    #[test]
    fn test_address_string() {
        let device = DeviceDescriptor {
            address: 0x0000_AABB_CCDD_EEFF,
            name: "FP-18".to_string(),
            signal_strength: -60,
        };
        assert_eq!(device.address_string(), "AA:BB:CC:DD:EE:FF");
    }
}
