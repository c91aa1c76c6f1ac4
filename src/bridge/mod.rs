//! Bridge layer: the async runtime side of the application.
//!
//! The supervisor drives a [`transport::BleTransport`] through its lifecycle,
//! decodes notifications with the domain codec and hands events to the
//! forwarding sink. Everything reports to the UI through the event bus.

pub mod bus;
pub mod locator;
pub mod simulated;
pub mod sink;
pub mod supervisor;
pub mod transport;

pub use bus::{event_bus, EventBus, EventStream};
pub use sink::{MidiPortOpener, MidiSink};
pub use supervisor::{BridgeHandle, ConnectionSupervisor};
pub use transport::{BleLink, BleTransport, LinkSender, Subscription};
