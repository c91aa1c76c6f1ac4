//! Forwarding Sink Adapter
//!
//! Writes decoded events to the MIDI output port from its own task. Output
//! failures are reported on the bus and retried; they never reach the BLE
//! side of the bridge.

use crate::bridge::bus::EventBus;
use crate::domain::error::SinkError;
use crate::domain::models::{MessageSeverity, MidiEvent};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Minimum time between attempts to reopen a failed port.
pub const REOPEN_INTERVAL: Duration = Duration::from_secs(1);

/// An open MIDI output port accepting raw MIDI bytes.
pub trait MidiSink: Send + 'static {
    fn send(&mut self, bytes: &[u8]) -> Result<(), SinkError>;
}

/// Opens output ports by (partial) name.
pub trait MidiPortOpener: Send + Sync + 'static {
    fn open(&self, port_name: &str) -> Result<Box<dyn MidiSink>, SinkError>;
}

pub struct ForwardingSink {
    opener: Arc<dyn MidiPortOpener>,
    port_name: String,
    port: Option<Box<dyn MidiSink>>,
    last_open_attempt: Option<Instant>,
    last_error: Option<SinkError>,
    bus: EventBus,
}

impl ForwardingSink {
    pub fn new(opener: Arc<dyn MidiPortOpener>, port_name: &str, bus: EventBus) -> Self {
        Self {
            opener,
            port_name: port_name.to_string(),
            port: None,
            last_open_attempt: None,
            last_error: None,
            bus,
        }
    }

    pub fn is_open(&self) -> bool {
        self.port.is_some()
    }

    /// True when the port is closed and the reopen interval has passed.
    pub fn reopen_due(&self) -> bool {
        self.port.is_none()
            && self
                .last_open_attempt
                .map_or(true, |last| last.elapsed() >= REOPEN_INTERVAL)
    }

    /// Open the configured port now.
    pub fn open(&mut self) -> Result<(), SinkError> {
        self.last_open_attempt = Some(Instant::now());
        match self.opener.open(&self.port_name) {
            Ok(port) => {
                info!("Opened MIDI output port: {}", self.port_name);
                self.bus.log(
                    format!("Opened MIDI port: {}", self.port_name),
                    MessageSeverity::Success,
                );
                self.port = Some(port);
                self.last_error = None;
                Ok(())
            }
            Err(e) => {
                self.report(&e);
                Err(e)
            }
        }
    }

    /// Write one event to the port, reopening it first if needed.
    pub fn forward(&mut self, event: &MidiEvent) -> Result<(), SinkError> {
        if self.reopen_due() {
            self.open()?;
        }

        let Some(port) = self.port.as_mut() else {
            return Err(SinkError::Closed);
        };

        match port.send(&event.to_bytes()) {
            Ok(()) => {
                self.last_error = None;
                self.bus.activity(event.summary());
                Ok(())
            }
            Err(e) => {
                self.port = None;
                self.report(&e);
                Err(e)
            }
        }
    }

    /// Report an error once per distinct failure.
    fn report(&mut self, error: &SinkError) {
        if self.last_error.as_ref() == Some(error) {
            debug!("MIDI output still failing: {}", error);
            return;
        }
        warn!("MIDI output error: {}", error);
        self.bus.sink_error(error);
        self.last_error = Some(error.clone());
    }
}

/// Runs a [`ForwardingSink`] on its own task, releasing each event at its
/// delivery instant.
pub struct Forwarder {
    events: mpsc::UnboundedSender<MidiEvent>,
    task: JoinHandle<()>,
}

impl Forwarder {
    pub fn spawn(mut sink: ForwardingSink) -> Self {
        let (events, mut rx) = mpsc::unbounded_channel::<MidiEvent>();

        let task = tokio::spawn(async move {
            let Some(mut sink) = open_blocking(sink).await else {
                return;
            };
            while let Some(event) = rx.recv().await {
                tokio::time::sleep_until(event.timestamp).await;
                if sink.reopen_due() {
                    sink = match open_blocking(sink).await {
                        Some(sink) => sink,
                        None => return,
                    };
                }
                let _ = sink.forward(&event);
            }
            debug!("Forwarder drained, closing MIDI port");
        });

        Self { events, task }
    }

    /// Queue an event. Never blocks.
    pub fn send(&self, event: MidiEvent) -> bool {
        self.events.send(event).is_ok()
    }

    /// Stop accepting events and wait for queued ones to be written.
    pub async fn shutdown(self) {
        drop(self.events);
        let _ = self.task.await;
    }
}

/// Open the port on the blocking pool. System MIDI APIs may stall on open.
async fn open_blocking(mut sink: ForwardingSink) -> Option<ForwardingSink> {
    let opened = tokio::task::spawn_blocking(move || {
        let _ = sink.open();
        sink
    })
    .await;
    match opened {
        Ok(sink) => Some(sink),
        Err(e) => {
            error!("MIDI port open task failed: {}", e);
            None
        }
    }
}
