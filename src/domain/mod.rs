//! Domain layer: data model, settings, and the BLE-MIDI decode pipeline.
//!
//! Nothing in here touches a platform API; everything is driven by bytes and
//! instants handed in by the bridge.

pub mod codec;
pub mod error;
pub mod models;
pub mod session;
pub mod settings;
pub mod timestamp;
