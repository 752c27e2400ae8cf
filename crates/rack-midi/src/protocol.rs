//! MIDI messages understood by the daemon
//!
//! | Bytes          | Meaning                                   |
//! |----------------|-------------------------------------------|
//! | `Cn pp`        | program change `pp` for the card in slot n |
//! | `8n`..`Bn`, `Dn`, `En` | channel voice message for slot n   |
//! | `F6`           | tune request                              |
//! | `F0 7D 02 F7`  | discovery report request                  |
//! | `F0 7D 03 F7`  | shut the system down                      |
//! | `F0 7D 04 F7`  | restart the system                        |

/// Non-commercial sysex manufacturer id
pub const VENDOR_ID: u8 = 0x7D;

pub const SYSEX_START: u8 = 0xF0;
pub const SYSEX_END: u8 = 0xF7;
pub const TUNE_REQUEST: u8 = 0xF6;

/// Sysex command bytes following [`VENDOR_ID`]
pub const CMD_DISCOVERY_REPORT: u8 = 0x01;
pub const CMD_DISCOVERY_REQUEST: u8 = 0x02;
pub const CMD_SHUTDOWN: u8 = 0x03;
pub const CMD_RESTART: u8 = 0x04;

/// Channel voice message other than program change, kept as raw bytes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelMessage {
    data: [u8; 3],
    len: u8,
}

impl ChannelMessage {
    pub fn channel(&self) -> u8 {
        self.data[0] & 0x0F
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data[..usize::from(self.len)]
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MidiEvent {
    ProgramChange { channel: u8, program: u8 },
    Channel(ChannelMessage),
    TuneRequest,
    DiscoveryRequest,
    ShutdownRequest,
    RestartRequest,
}

/// Data bytes following a channel voice status byte
fn data_len(status: u8) -> Option<usize> {
    match status & 0xF0 {
        0x80 | 0x90 | 0xA0 | 0xB0 | 0xE0 => Some(2),
        0xC0 | 0xD0 => Some(1),
        _ => None,
    }
}

impl MidiEvent {
    /// Parse one complete MIDI message
    ///
    /// Returns `None` for anything the daemon does not act on.
    pub fn parse(data: &[u8]) -> Option<Self> {
        let (&status, rest) = data.split_first()?;
        match status {
            TUNE_REQUEST => Some(Self::TuneRequest),
            SYSEX_START => Self::parse_sysex(rest),
            0x80..=0xEF => {
                let len = data_len(status)?;
                let body = rest.get(..len)?;
                if body.iter().any(|b| b & 0x80 != 0) {
                    return None;
                }
                if status & 0xF0 == 0xC0 {
                    return Some(Self::ProgramChange {
                        channel: status & 0x0F,
                        program: body[0],
                    });
                }
                let mut message = ChannelMessage {
                    data: [status, 0, 0],
                    len: 1 + len as u8,
                };
                message.data[1..=len].copy_from_slice(body);
                Some(Self::Channel(message))
            }
            _ => None,
        }
    }

    fn parse_sysex(body: &[u8]) -> Option<Self> {
        match body {
            [VENDOR_ID, CMD_DISCOVERY_REQUEST, SYSEX_END] => Some(Self::DiscoveryRequest),
            [VENDOR_ID, CMD_SHUTDOWN, SYSEX_END] => Some(Self::ShutdownRequest),
            [VENDOR_ID, CMD_RESTART, SYSEX_END] => Some(Self::RestartRequest),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_program_change() {
        assert_eq!(
            MidiEvent::parse(&[0xC3, 0x05]),
            Some(MidiEvent::ProgramChange {
                channel: 3,
                program: 5
            })
        );
        assert_eq!(MidiEvent::parse(&[0xC3]), None);
        assert_eq!(MidiEvent::parse(&[0xC3, 0x85]), None);
    }

    #[test]
    fn test_channel_messages_keep_bytes() {
        let Some(MidiEvent::Channel(msg)) = MidiEvent::parse(&[0x92, 60, 100]) else {
            panic!("expected channel message");
        };
        assert_eq!(msg.channel(), 2);
        assert_eq!(msg.as_bytes(), &[0x92, 60, 100]);

        let Some(MidiEvent::Channel(msg)) = MidiEvent::parse(&[0xD1, 0x40]) else {
            panic!("expected channel message");
        };
        assert_eq!(msg.as_bytes(), &[0xD1, 0x40]);
    }

    #[test]
    fn test_system_messages() {
        assert_eq!(MidiEvent::parse(&[0xF6]), Some(MidiEvent::TuneRequest));
        assert_eq!(
            MidiEvent::parse(&[0xF0, 0x7D, 0x02, 0xF7]),
            Some(MidiEvent::DiscoveryRequest)
        );
        assert_eq!(
            MidiEvent::parse(&[0xF0, 0x7D, 0x03, 0xF7]),
            Some(MidiEvent::ShutdownRequest)
        );
        assert_eq!(
            MidiEvent::parse(&[0xF0, 0x7D, 0x04, 0xF7]),
            Some(MidiEvent::RestartRequest)
        );
    }

    #[test]
    fn test_ignored_messages() {
        assert_eq!(MidiEvent::parse(&[]), None);
        assert_eq!(MidiEvent::parse(&[0xF8]), None);
        assert_eq!(MidiEvent::parse(&[0xF0, 0x7E, 0x02, 0xF7]), None);
        assert_eq!(MidiEvent::parse(&[0xF0, 0x7D, 0x02, 0x00, 0xF7]), None);
        assert_eq!(MidiEvent::parse(&[0x40, 0x40]), None);
    }
}
