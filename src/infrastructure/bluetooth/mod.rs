//! Bluetooth Module
//!
//! WinRT backend for the bridge's BLE transport.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────┐
//! │               WinRtTransport                 │
//! │        (implements bridge BleTransport)      │
//! └──────────────────────┬──────────────────────┘
//!                        │
//!         ┌──────────────┼──────────────┐
//!         │              │              │
//!         ▼              ▼              ▼
//! ┌────────────┐  ┌────────────┐  ┌────────────┐
//! │  Scanner   │  │ Connection │  │  Protocol  │
//! │            │  │  (WinLink) │  │            │
//! │ - adverts  │  │ - GATT     │  │ - UUIDs    │
//! │            │  │ - notify   │  │ - buffers  │
//! └────────────┘  └────────────┘  └────────────┘
//! ```

pub mod connection;
pub mod protocol;
pub mod scanner;
pub mod transport;

pub use transport::WinRtTransport;
