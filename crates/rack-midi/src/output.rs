//! Shared MIDI output
//!
//! Both the MIDI thread and the audio thread may answer requests, so the
//! connection sits behind a mutex and every message goes out whole.

use std::sync::{Arc, Mutex, PoisonError};

use midir::MidiOutputConnection;

/// Destination for outgoing MIDI bytes
pub trait MidiSink: Send {
    fn send(&mut self, message: &[u8]) -> Result<(), String>;
}

impl MidiSink for MidiOutputConnection {
    fn send(&mut self, message: &[u8]) -> Result<(), String> {
        MidiOutputConnection::send(self, message).map_err(|e| e.to_string())
    }
}

/// Cloneable handle to one output port, or to nothing
#[derive(Clone, Default)]
pub struct SharedMidiOutput {
    sink: Arc<Mutex<Option<Box<dyn MidiSink>>>>,
}

impl SharedMidiOutput {
    pub fn new(sink: Box<dyn MidiSink>) -> Self {
        Self {
            sink: Arc::new(Mutex::new(Some(sink))),
        }
    }

    /// Output that discards everything
    pub fn disconnected() -> Self {
        Self::default()
    }

    pub fn is_connected(&self) -> bool {
        self.sink
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// Send one complete message; failures are logged
    pub fn send(&self, message: &[u8]) -> bool {
        let mut sink = self.sink.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(sink) = sink.as_mut() else {
            log::debug!("MIDI: no output port, dropping {} bytes", message.len());
            return false;
        };
        match sink.send(message) {
            Ok(()) => true,
            Err(e) => {
                log::warn!("MIDI output: Failed to send message: {}", e);
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[derive(Clone, Default)]
    struct Recorder(Arc<Mutex<Vec<Vec<u8>>>>);

    impl MidiSink for Recorder {
        fn send(&mut self, message: &[u8]) -> Result<(), String> {
            self.0.lock().unwrap().push(message.to_vec());
            Ok(())
        }
    }

    #[test]
    fn test_disconnected_output_drops() {
        let out = SharedMidiOutput::disconnected();
        assert!(!out.is_connected());
        assert!(!out.send(&[0xF6]));
    }

    #[test]
    fn test_concurrent_senders_keep_messages_whole() {
        let recorder = Recorder::default();
        let out = SharedMidiOutput::new(Box::new(recorder.clone()));

        let handles: Vec<_> = (0..2u8)
            .map(|n| {
                let out = out.clone();
                thread::spawn(move || {
                    for _ in 0..500 {
                        assert!(out.send(&[0xF0, 0x7D, n, n, n, 0xF7]));
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let sent = recorder.0.lock().unwrap();
        assert_eq!(sent.len(), 1000);
        assert!(sent.iter().all(|m| m[2] == m[3] && m[3] == m[4]));
    }
}
