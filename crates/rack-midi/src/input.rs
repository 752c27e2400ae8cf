//! MIDI input
//!
//! The midir callback parses each message and forwards the events the daemon
//! acts on to the MIDI thread through a bounded channel. The callback never
//! blocks: when the channel is full the event is dropped and counted.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use flume::{Receiver, Sender, TrySendError};
use midir::MidiInputConnection;

use crate::connection::{find_input_port, MidiConnectionError};
use crate::protocol::MidiEvent;

/// Events buffered between the callback and the MIDI thread
pub const EVENT_QUEUE_DEPTH: usize = 256;

struct CallbackData {
    events: Sender<MidiEvent>,
    dropped: Arc<AtomicU64>,
}

fn forward(data: &[u8], callback: &CallbackData) {
    let Some(event) = MidiEvent::parse(data) else {
        return;
    };
    log::trace!("[MIDI IN] {:?}", event);
    if let Err(TrySendError::Full(_)) = callback.events.try_send(event) {
        callback.dropped.fetch_add(1, Ordering::Relaxed);
    }
}

/// Live input connection; dropping it closes the port
pub struct MidiInputHandler {
    _connection: MidiInputConnection<CallbackData>,
    dropped: Arc<AtomicU64>,
}

impl MidiInputHandler {
    /// Connect to the port matching `port_match`
    ///
    /// Returns the handler and the receiving end of its event queue.
    pub fn connect(port_match: &str) -> Result<(Self, Receiver<MidiEvent>), MidiConnectionError> {
        let (midi_in, port) = find_input_port(port_match)?;
        let (events, rx) = flume::bounded(EVENT_QUEUE_DEPTH);
        let dropped = Arc::new(AtomicU64::new(0));
        let callback = CallbackData {
            events,
            dropped: Arc::clone(&dropped),
        };

        let connection = midi_in
            .connect(
                &port,
                "rackd-midi-input",
                |_timestamp, data, callback| forward(data, callback),
                callback,
            )
            .map_err(|e| MidiConnectionError::Connection(e.to_string()))?;

        log::info!("MIDI: Input handler connected");
        Ok((
            Self {
                _connection: connection,
                dropped,
            },
            rx,
        ))
    }

    /// Events lost because the MIDI thread fell behind
    pub fn dropped_events(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}
