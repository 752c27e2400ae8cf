//! Discovery report sysex
//!
//! `F0 7D 01 [card_id channel_offset device] x 8 F7`, one triple per slot,
//! zeros for empty slots.

use rack_core::bus::SLOT_COUNT;
use rack_core::card::SlotReport;

use crate::protocol::{CMD_DISCOVERY_REPORT, SYSEX_END, SYSEX_START, VENDOR_ID};

pub const REPORT_LEN: usize = 4 + 3 * SLOT_COUNT;

/// Encode the per-slot report
///
/// Values are masked to 7 bits to stay valid sysex data.
pub fn discovery_report(slots: &[SlotReport; SLOT_COUNT]) -> [u8; REPORT_LEN] {
    let mut message = [0u8; REPORT_LEN];
    message[..3].copy_from_slice(&[SYSEX_START, VENDOR_ID, CMD_DISCOVERY_REPORT]);
    for (chunk, slot) in message[3..REPORT_LEN - 1].chunks_exact_mut(3).zip(slots) {
        if slot.card_id > 0x7F {
            log::warn!("MIDI: card id {:#04x} does not fit a sysex byte", slot.card_id);
        }
        chunk.copy_from_slice(&[
            slot.card_id & 0x7F,
            slot.channel_offset & 0x7F,
            slot.device & 0x7F,
        ]);
    }
    message[REPORT_LEN - 1] = SYSEX_END;
    message
}
