//! Error taxonomy for the bridge core.
//!
//! Framing and sink errors are local and recoverable: they are logged and the
//! session keeps running. Connect, subscribe and link failures drive the
//! supervisor into backoff. Configuration errors are rejected before start.

use thiserror::Error;

/// A malformed BLE-MIDI notification. Scoped to one packet.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FramingError {
    #[error("empty packet")]
    EmptyPacket,
    #[error("invalid header byte {0:#04X}")]
    InvalidHeader(u8),
    #[error("timestamp byte at end of packet")]
    DanglingTimestamp,
    #[error("message {status:#04X} truncated: expected {expected} data bytes, found {found}")]
    Truncated { status: u8, expected: usize, found: usize },
    #[error("data byte {0:#04X} with no running status")]
    NoRunningStatus(u8),
    #[error("end of SysEx without a start")]
    UnexpectedSysExEnd,
    #[error("SysEx aborted by status {0:#04X}")]
    SysExAborted(u8),
}

/// A failure on the MIDI output path. Never tears down the BLE session.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SinkError {
    #[error("MIDI output port not found: {0}")]
    PortNotFound(String),
    #[error("failed to open MIDI output port: {0}")]
    Open(String),
    #[error("failed to send MIDI message: {0}")]
    Send(String),
    #[error("MIDI output port is closed")]
    Closed,
}

/// Configuration rejected before the supervisor starts.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("device name must not be empty")]
    EmptyDeviceName,
    #[error("MIDI port name must not be empty")]
    EmptyMidiPort,
    #[error("{0} must be greater than zero")]
    ZeroDuration(&'static str),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BridgeError {
    #[error("no matching device found before scan timeout")]
    ScanTimeout,
    #[error("scan failed: {0}")]
    ScanFailure(String),
    #[error("connect failed: {0}")]
    ConnectFailure(String),
    #[error("subscribe failed: {0}")]
    SubscribeFailure(String),
    #[error("link lost: {0}")]
    LinkLost(String),
    #[error(transparent)]
    Framing(#[from] FramingError),
    #[error(transparent)]
    Sink(#[from] SinkError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("bridge supervisor is not running")]
    ChannelClosed,
}

pub type BridgeResult<T> = Result<T, BridgeError>;
