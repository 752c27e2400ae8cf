//! DAC write helpers shared by card drivers
//!
//! Wire format: 2 bytes, MSB first. High nibble of byte 0 is the DAC channel
//! address, the remaining 12 bits are the code.

use crate::bus::{BusError, BusHost, Slot, SpiMode};

/// Split a packed DAC word into its big-endian wire bytes
#[inline]
pub fn dac_frame(word: u16) -> [u8; 2] {
    word.to_be_bytes()
}

/// Last word successfully written per channel
///
/// Allocated once at card init; the hot path only reads and updates it.
#[derive(Debug, Clone)]
pub struct ChannelMemo {
    last: Box<[Option<u16>]>,
}

impl ChannelMemo {
    pub fn new(channels: usize) -> Self {
        Self {
            last: vec![None; channels].into_boxed_slice(),
        }
    }

    /// Whether `word` differs from what channel `channel` last received
    #[inline]
    pub fn changed(&self, channel: usize, word: u16) -> bool {
        self.last.get(channel).map_or(false, |last| *last != Some(word))
    }

    #[inline]
    pub fn store(&mut self, channel: usize, word: u16) {
        if let Some(last) = self.last.get_mut(channel) {
            *last = Some(word);
        }
    }

    /// Forget every channel so the next frame is written in full
    pub fn invalidate(&mut self) {
        self.last.iter_mut().for_each(|last| *last = None);
    }

    pub fn last(&self, channel: usize) -> Option<u16> {
        self.last.get(channel).copied().flatten()
    }
}

/// Where a card's DAC lives on the bus
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DacPort {
    pub slot: Slot,
    pub chip_select: u8,
    pub mode: SpiMode,
}

impl DacPort {
    /// Write every changed `(channel, word)` pair
    ///
    /// The slot is selected and SPI configured lazily before the first write,
    /// so an unchanged frame costs no bus traffic at all. A failing select or
    /// configure abandons the call; a failing data write is remembered and
    /// the remaining channels are still written. Returns the number of words
    /// written.
    pub fn write_changed(
        &self,
        bus: &mut BusHost,
        memo: &mut ChannelMemo,
        words: impl IntoIterator<Item = (usize, u16)>,
    ) -> Result<usize, BusError> {
        let mut ready = false;
        let mut written = 0;
        let mut first_error = None;

        for (channel, word) in words {
            if !memo.changed(channel, word) {
                continue;
            }
            if !ready {
                bus.select_slot(self.slot)?;
                bus.configure_spi(self.chip_select, self.mode)?;
                ready = true;
            }
            match bus.spi_write(self.chip_select, &dac_frame(word)) {
                Ok(()) => {
                    memo.store(channel, word);
                    written += 1;
                }
                Err(e) => {
                    first_error.get_or_insert(e);
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(written),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockBus;

    const PORT: DacPort = DacPort {
        slot: 3,
        chip_select: 0,
        mode: SpiMode::Mode1,
    };

    #[test]
    fn test_dac_frame_is_big_endian() {
        assert_eq!(dac_frame(0x3ABC), [0x3A, 0xBC]);
    }

    #[test]
    fn test_memo_tracks_changes() {
        let mut memo = ChannelMemo::new(2);
        assert!(memo.changed(0, 0));
        memo.store(0, 0);
        assert!(!memo.changed(0, 0));
        assert!(memo.changed(0, 1));
        assert!(!memo.changed(5, 1));

        memo.invalidate();
        assert_eq!(memo.last(0), None);
    }

    #[test]
    fn test_write_changed_skips_unchanged() {
        let mock = MockBus::new();
        let mut host = mock.host();
        let mut memo = ChannelMemo::new(2);

        let n = PORT
            .write_changed(&mut host, &mut memo, [(0, 0x0123), (1, 0x1456)])
            .unwrap();
        assert_eq!(n, 2);
        assert_eq!(host.active_slot(), Some(3));
        assert_eq!(mock.spi_writes(), vec![vec![0x01, 0x23], vec![0x14, 0x56]]);

        let n = PORT
            .write_changed(&mut host, &mut memo, [(0, 0x0123), (1, 0x1457)])
            .unwrap();
        assert_eq!(n, 1);
        assert_eq!(mock.spi_writes().len(), 3);
    }

    #[test]
    fn test_write_failure_keeps_going_and_retries() {
        let mock = MockBus::new();
        let mut host = mock.host();
        let mut memo = ChannelMemo::new(2);

        mock.fail_spi_write(true);
        let result = PORT.write_changed(&mut host, &mut memo, [(0, 0x0001), (1, 0x1001)]);
        assert!(result.is_err());
        assert_eq!(memo.last(0), None);
        assert_eq!(memo.last(1), None);

        // Failed words were not memoized, so they go out again
        mock.fail_spi_write(false);
        let n = PORT
            .write_changed(&mut host, &mut memo, [(0, 0x0001), (1, 0x1001)])
            .unwrap();
        assert_eq!(n, 2);
    }
}
