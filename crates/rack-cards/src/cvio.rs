//! Calibrated bipolar CV card
//!
//! Four ±5 V outputs. The card ROM stores the voltage each channel produces
//! at code 0 and code 4095; all channels are scaled to the range every one
//! of them can reach, so equal codes give equal voltages across the card.
//!
//! ROM layout from offset 0x10: per channel `min: f32 LE, max: f32 LE`.

use embedded_hal::i2c::I2c;
use rack_core::bus::{BusError, BusResult, SharedBus, Slot, SpiMode};
use rack_core::calibration::{limit_ranges, range_table, sample_to_code, CorrectionTable, VoltageRange};
use rack_core::card::{CardDriver, CardError, CardProperties, ChannelMemo, DacPort};

pub const CARD_ID: u8 = 0x0A;
pub const CHANNELS: usize = 4;

/// Card ROM of slot N answers at `ROM_BASE + N`
pub const ROM_BASE: u8 = 0x50;
const RANGE_OFFSET: u8 = 0x10;
const RANGE_BYTES: usize = CHANNELS * 8;

pub const NOMINAL_RANGE: VoltageRange = VoltageRange::new(-5.0, 5.0);

/// Sample giving code 2048, the middle of the output range
const MIDSCALE: i16 = 2048 << 3;

const PROPERTIES: CardProperties = CardProperties {
    channel_count: CHANNELS,
    spi_mode: SpiMode::Mode2,
};

fn decode_ranges(raw: &[u8; RANGE_BYTES]) -> [VoltageRange; CHANNELS] {
    std::array::from_fn(|ch| {
        let at = |offset: usize| {
            let mut bytes = [0u8; 4];
            bytes.copy_from_slice(&raw[offset..offset + 4]);
            f32::from_le_bytes(bytes)
        };
        VoltageRange::new(at(ch * 8), at(ch * 8 + 4))
    })
}

pub struct CvioCard {
    bus: SharedBus,
    port: DacPort,
    memo: ChannelMemo,
    output: VoltageRange,
    tables: [CorrectionTable; CHANNELS],
}

impl CvioCard {
    pub fn new(bus: SharedBus, slot: Slot) -> Result<Self, CardError> {
        let ranges = match read_ranges(&bus, ROM_BASE + slot) {
            Ok(ranges) => Some(ranges),
            Err(e) => {
                log::warn!(
                    "Cards: cvio in slot {} calibration unreadable ({}), running uncalibrated",
                    slot,
                    e
                );
                None
            }
        };

        let (output, tables) = match ranges {
            Some(ranges) => {
                let output = limit_ranges(&ranges, NOMINAL_RANGE);
                let tables = std::array::from_fn(|ch| range_table(ranges[ch], output, ch as u8));
                (output, tables)
            }
            None => (
                NOMINAL_RANGE,
                std::array::from_fn(|ch| CorrectionTable::linear(ch as u8)),
            ),
        };
        log::info!(
            "Cards: cvio in slot {} output range {:.3}..{:.3} V",
            slot,
            output.min,
            output.max
        );

        let mut card = Self {
            bus,
            port: DacPort {
                slot,
                chip_select: 0,
                mode: PROPERTIES.spi_mode,
            },
            memo: ChannelMemo::new(CHANNELS),
            output,
            tables,
        };
        card.process_samples(&[MIDSCALE; CHANNELS])?;
        Ok(card)
    }

    /// Voltage range shared by all channels
    pub fn output_range(&self) -> VoltageRange {
        self.output
    }

    pub fn table(&self, channel: usize) -> Option<&CorrectionTable> {
        self.tables.get(channel)
    }
}

fn read_ranges(bus: &SharedBus, address: u8) -> BusResult<[VoltageRange; CHANNELS]> {
    let mut raw = [0u8; RANGE_BYTES];
    bus.lock()
        .i2c()
        .write_read(address, &[RANGE_OFFSET], &mut raw)?;
    Ok(decode_ranges(&raw))
}

impl CardDriver for CvioCard {
    fn properties(&self) -> CardProperties {
        PROPERTIES
    }

    fn process_samples(&mut self, samples: &[i16]) -> Result<(), BusError> {
        let tables = &self.tables;
        let words = samples
            .iter()
            .zip(tables.iter())
            .enumerate()
            .map(|(ch, (&s, table))| (ch, table.lookup(sample_to_code(s))));
        let mut bus = self.bus.lock();
        self.port.write_changed(&mut bus, &mut self.memo, words)?;
        Ok(())
    }

    fn process_program_change(&mut self, program: u8) -> Result<(), BusError> {
        log::debug!(
            "Cards: cvio in slot {} has no programs, ignoring {}",
            self.port.slot,
            program
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rack_core::testing::MockBus;

    fn rom(ranges: &[(f32, f32)]) -> Vec<u8> {
        let mut contents = vec![0u8; usize::from(RANGE_OFFSET)];
        contents[0] = CARD_ID;
        for &(min, max) in ranges {
            contents.extend_from_slice(&min.to_le_bytes());
            contents.extend_from_slice(&max.to_le_bytes());
        }
        contents
    }

    #[test]
    fn test_channels_limited_to_common_range() {
        let mock = MockBus::new();
        mock.set_device(
            ROM_BASE + 1,
            &rom(&[(-5.2, 4.9), (-4.8, 5.1), (-5.0, 5.3), (-5.1, 5.0)]),
        );
        let card = CvioCard::new(SharedBus::new(mock.host()), 1).unwrap();

        assert_eq!(card.output_range(), VoltageRange::new(-4.8, 4.9));
        let table = card.table(0).unwrap();
        assert!((161..=163).contains(&table.code(0)));
        assert!(table.code(4095) >= 4094);
        // Channel 1 already spans the bottom of the common range
        assert_eq!(card.table(1).unwrap().code(0), 0);
    }

    #[test]
    fn test_unreadable_rom_runs_uncalibrated() {
        let mock = MockBus::new();
        let card = CvioCard::new(SharedBus::new(mock.host()), 2).unwrap();
        assert_eq!(card.output_range(), NOMINAL_RANGE);
        assert_eq!(card.table(3), Some(&CorrectionTable::linear(3)));
        assert_eq!(mock.last_dac_word(2, 3), Some(0x3000 | 2048));
    }

    #[test]
    fn test_inconsistent_channel_counts_as_nominal() {
        let mock = MockBus::new();
        mock.set_device(
            ROM_BASE,
            &rom(&[(-5.2, 5.2), (3.0, -3.0), (-5.1, 5.1), (-5.3, 5.3)]),
        );
        let card = CvioCard::new(SharedBus::new(mock.host()), 0).unwrap();
        assert_eq!(card.output_range(), NOMINAL_RANGE);
    }

    #[test]
    fn test_repeated_frame_is_not_rewritten() {
        let mock = MockBus::new();
        let mut card = CvioCard::new(SharedBus::new(mock.host()), 0).unwrap();
        let writes = mock.spi_writes().len();
        card.process_samples(&[MIDSCALE; CHANNELS]).unwrap();
        assert_eq!(mock.spi_writes().len(), writes);
        card.process_samples(&[MIDSCALE, 0, MIDSCALE, MIDSCALE]).unwrap();
        assert_eq!(mock.spi_writes().len(), writes + 1);
    }
}
