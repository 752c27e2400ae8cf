//! MIDI port discovery
//!
//! Ports are matched case-insensitively on a substring of their name.

use midir::{MidiInput, MidiInputPort, MidiOutput, MidiOutputConnection};

#[derive(Debug, thiserror::Error)]
pub enum MidiConnectionError {
    #[error("Failed to initialize MIDI input: {0}")]
    InputInit(String),

    #[error("Failed to initialize MIDI output: {0}")]
    OutputInit(String),

    #[error("No MIDI input ports available")]
    NoInputPorts,

    #[error("No MIDI port found matching pattern: {0}")]
    PortNotFound(String),

    #[error("Failed to connect to MIDI port: {0}")]
    Connection(String),
}

fn matches(name: Result<String, midir::PortInfoError>, pattern: &str) -> bool {
    name.map(|name| name.to_lowercase().contains(pattern))
        .unwrap_or(false)
}

/// Find the first input port matching `port_match`
pub fn find_input_port(port_match: &str) -> Result<(MidiInput, MidiInputPort), MidiConnectionError> {
    let pattern = port_match.to_lowercase();
    let mut midi_in =
        MidiInput::new("rackd-midi-in").map_err(|e| MidiConnectionError::InputInit(e.to_string()))?;
    // Sysex carries the discovery and system requests
    midi_in.ignore(midir::Ignore::TimeAndActiveSense);

    let ports = midi_in.ports();
    if ports.is_empty() {
        return Err(MidiConnectionError::NoInputPorts);
    }
    let port = ports
        .into_iter()
        .find(|port| matches(midi_in.port_name(port), &pattern))
        .ok_or_else(|| MidiConnectionError::PortNotFound(port_match.to_string()))?;

    if let Ok(name) = midi_in.port_name(&port) {
        log::info!("MIDI: Found input port: {}", name);
    }
    Ok((midi_in, port))
}

/// Connect the first output port matching `port_match`
pub fn connect_output(port_match: &str) -> Result<MidiOutputConnection, MidiConnectionError> {
    let pattern = port_match.to_lowercase();
    let midi_out = MidiOutput::new("rackd-midi-out")
        .map_err(|e| MidiConnectionError::OutputInit(e.to_string()))?;

    let port = midi_out
        .ports()
        .into_iter()
        .find(|port| matches(midi_out.port_name(port), &pattern))
        .ok_or_else(|| MidiConnectionError::PortNotFound(port_match.to_string()))?;

    if let Ok(name) = midi_out.port_name(&port) {
        log::info!("MIDI: Found output port: {}", name);
    }
    midi_out
        .connect(&port, "rackd-midi-output")
        .map_err(|e| MidiConnectionError::Connection(e.to_string()))
}

/// Names of all MIDI input ports
pub fn list_input_ports() -> Result<Vec<String>, MidiConnectionError> {
    let midi_in = MidiInput::new("rackd-midi-list")
        .map_err(|e| MidiConnectionError::InputInit(e.to_string()))?;
    Ok(midi_in
        .ports()
        .iter()
        .filter_map(|port| midi_in.port_name(port).ok())
        .collect())
}

/// Names of all MIDI output ports
pub fn list_output_ports() -> Result<Vec<String>, MidiConnectionError> {
    let midi_out = MidiOutput::new("rackd-midi-list")
        .map_err(|e| MidiConnectionError::OutputInit(e.to_string()))?;
    Ok(midi_out
        .ports()
        .iter()
        .filter_map(|port| midi_out.port_name(port).ok())
        .collect())
}
