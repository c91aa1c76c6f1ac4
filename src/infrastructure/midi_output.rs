//! midir backend for the forwarding sink.

use crate::bridge::sink::{MidiPortOpener, MidiSink};
use crate::domain::error::SinkError;
use midir::{MidiOutput, MidiOutputConnection};
use tracing::{debug, info};

/// Opens output ports whose name contains the configured string.
pub struct MidirPortOpener {
    client_name: String,
}

impl MidirPortOpener {
    pub fn new(client_name: &str) -> Self {
        Self {
            client_name: client_name.to_string(),
        }
    }

    /// Names of every output port currently visible.
    pub fn port_names(&self) -> Result<Vec<String>, SinkError> {
        let midi_out =
            MidiOutput::new(&self.client_name).map_err(|e| SinkError::Open(e.to_string()))?;
        Ok(midi_out
            .ports()
            .iter()
            .filter_map(|p| midi_out.port_name(p).ok())
            .collect())
    }
}

impl MidiPortOpener for MidirPortOpener {
    fn open(&self, port_name: &str) -> Result<Box<dyn MidiSink>, SinkError> {
        let midi_out =
            MidiOutput::new(&self.client_name).map_err(|e| SinkError::Open(e.to_string()))?;

        let ports = midi_out.ports();
        let port = ports
            .iter()
            .find(|p| {
                midi_out
                    .port_name(p)
                    .map(|name| name.contains(port_name))
                    .unwrap_or(false)
            })
            .ok_or_else(|| SinkError::PortNotFound(port_name.to_string()))?;

        let full_name = midi_out
            .port_name(port)
            .unwrap_or_else(|_| port_name.to_string());
        debug!("Connecting to MIDI output {:?}", full_name);

        let connection = midi_out
            .connect(port, &self.client_name)
            .map_err(|e| SinkError::Open(e.to_string()))?;
        info!("MIDI output connected: {}", full_name);

        Ok(Box::new(MidirSink { connection }))
    }
}

struct MidirSink {
    connection: MidiOutputConnection,
}

impl MidiSink for MidirSink {
    fn send(&mut self, bytes: &[u8]) -> Result<(), SinkError> {
        self.connection
            .send(bytes)
            .map_err(|e| SinkError::Send(e.to_string()))
    }
}
