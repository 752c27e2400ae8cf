//! Eight-channel unipolar CV card
//!
//! One octal 12-bit DAC, channel N at DAC address N. No expander, nothing
//! to tune.

use rack_core::bus::{BusError, SharedBus, Slot, SpiMode};
use rack_core::calibration::{pack_dac_word, sample_to_code};
use rack_core::card::{CardDriver, CardError, CardProperties, ChannelMemo, DacPort};

pub const CARD_ID: u8 = 0x02;
pub const CHANNELS: usize = 8;

const PROPERTIES: CardProperties = CardProperties {
    channel_count: CHANNELS,
    spi_mode: SpiMode::Mode1,
};

pub struct Cv8Card {
    bus: SharedBus,
    port: DacPort,
    memo: ChannelMemo,
}

impl Cv8Card {
    /// Bring the card up with every output at 0 V
    pub fn new(bus: SharedBus, slot: Slot) -> Result<Self, CardError> {
        let mut card = Self {
            bus,
            port: DacPort {
                slot,
                chip_select: 0,
                mode: PROPERTIES.spi_mode,
            },
            memo: ChannelMemo::new(CHANNELS),
        };
        card.process_samples(&[0; CHANNELS])?;
        Ok(card)
    }
}

impl CardDriver for Cv8Card {
    fn properties(&self) -> CardProperties {
        PROPERTIES
    }

    fn process_samples(&mut self, samples: &[i16]) -> Result<(), BusError> {
        let words = samples
            .iter()
            .take(CHANNELS)
            .enumerate()
            .map(|(ch, &s)| (ch, pack_dac_word(ch as u8, sample_to_code(s))));
        let mut bus = self.bus.lock();
        self.port.write_changed(&mut bus, &mut self.memo, words)?;
        Ok(())
    }

    fn process_program_change(&mut self, program: u8) -> Result<(), BusError> {
        log::debug!("Cards: cv8 in slot {} has no programs, ignoring {}", self.port.slot, program);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rack_core::testing::MockBus;

    fn card(mock: &MockBus, slot: Slot) -> Cv8Card {
        Cv8Card::new(SharedBus::new(mock.host()), slot).unwrap()
    }

    #[test]
    fn test_init_zeroes_outputs() {
        let mock = MockBus::new();
        let _card = card(&mock, 5);
        let writes = mock.spi_writes_for_slot(5);
        assert_eq!(writes.len(), CHANNELS);
        for ch in 0..CHANNELS as u8 {
            assert_eq!(mock.last_dac_word(5, ch), Some(u16::from(ch) << 12));
        }
    }

    #[test]
    fn test_redundant_frame_costs_no_writes() {
        let mock = MockBus::new();
        let mut card = card(&mock, 1);
        let frame = [100, 2000, -5, 32767, 8, 16, 24, 32];

        card.process_samples(&frame).unwrap();
        let after_first = mock.spi_writes().len();
        card.process_samples(&frame).unwrap();
        assert_eq!(mock.spi_writes().len(), after_first);
    }

    #[test]
    fn test_samples_are_packed_and_clamped() {
        let mock = MockBus::new();
        let mut card = card(&mock, 0);
        mock.clear_spi_writes();

        card.process_samples(&[-1000, 8, 0, 0, 0, 0, 0, i16::MAX]).unwrap();
        // Channel 0 clamps to 0, which it already holds
        assert_eq!(mock.spi_writes(), vec![vec![0x10, 0x01], vec![0x7F, 0xFF]]);
    }

    #[test]
    fn test_write_error_is_reported() {
        let mock = MockBus::new();
        let mut card = card(&mock, 0);
        mock.fail_spi_write(true);
        assert!(card.process_samples(&[800; CHANNELS]).is_err());
        mock.fail_spi_write(false);
        card.process_samples(&[800; CHANNELS]).unwrap();
        assert_eq!(mock.last_dac_word(0, 3), Some(0x3000 | 100));
    }
}
