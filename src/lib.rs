//! Bridge between a BLE-MIDI peripheral and a virtual MIDI output port.
//!
//! - [`domain`]: packet codec, timestamp reconstruction, data model, settings
//! - [`bridge`]: connection supervisor, locator, forwarding sink, event bus
//! - [`infrastructure`]: logging and the platform BLE/MIDI backends

pub mod bridge;
pub mod domain;
pub mod infrastructure;

pub use bridge::{event_bus, BridgeHandle, ConnectionSupervisor, EventStream};
pub use domain::error::{BridgeError, BridgeResult};
pub use domain::models::{AppEvent, BridgeCommand, ConnectionState};
pub use domain::settings::{Configuration, Settings, SettingsService};
