//! MIDI side of the rack daemon
//!
//! ```text
//! ┌───────────┐  raw bytes  ┌──────────────┐  MidiEvent  ┌─────────────┐
//! │ midir port│────────────►│ input.rs     │────────────►│ MIDI thread │
//! └───────────┘  callback   │ (parse)      │   flume     │ (rackd)     │
//!                           └──────────────┘             └──────┬──────┘
//!                                                               │ report
//!                                                        ┌──────▼──────┐
//!                                                        │ output.rs   │
//!                                                        │ (mutex)     │
//!                                                        └─────────────┘
//! ```

pub mod connection;
pub mod input;
pub mod output;
pub mod protocol;
pub mod report;

pub use connection::{list_input_ports, list_output_ports, MidiConnectionError};
pub use input::MidiInputHandler;
pub use output::{MidiSink, SharedMidiOutput};
pub use protocol::{ChannelMessage, MidiEvent};
pub use report::discovery_report;
