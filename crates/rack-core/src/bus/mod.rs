//! Backplane bus host
//!
//! One SPI controller is shared by all 8 slots. The slot whose DAC sees the
//! chip-select is chosen by three GPIO address lines driving a decoder on the
//! backplane. I2C is a single shared bus; every card answers on its own
//! address (ROM base + slot, expander base + slot, ...).
//!
//! # Caching
//!
//! `BusHost` remembers the selected slot and the mode each chip select was
//! last opened with, so repeated calls from the hot path cost nothing when
//! nothing changes:
//!
//! ```text
//! card A (mode 1) ─┐
//! card B (mode 1) ─┼──► select_slot ──► configure_spi ──► spi_write
//! card C (mode 0) ─┘    (GPIO only      (reopen only
//!                        on change)      on mode change)
//! ```
//!
//! The host performs no implicit selection: a driver must call
//! [`BusHost::select_slot`] and [`BusHost::configure_spi`] before its first
//! write, while holding the [`SharedBus`] lock for the whole sequence.

mod error;

#[cfg(target_os = "linux")]
pub mod linux;

pub use error::{BusError, BusResult};

use embedded_hal::digital::{OutputPin, PinState};
use embedded_hal::i2c::I2c;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Number of physical slots on the backplane
pub const SLOT_COUNT: usize = 8;

/// Number of GPIO address lines used to select a slot
pub const ADDRESS_LINES: usize = 3;

/// Chip selects supported by the SPI controller
pub const MAX_CHIP_SELECTS: usize = 2;

/// Physical backplane position (0..7)
pub type Slot = u8;

/// Injected I2C capability
pub type I2cDevice = dyn I2c<Error = BusError> + Send;

/// Injected GPIO output capability (slot address lines)
pub type AddressPin = dyn OutputPin<Error = BusError> + Send;

/// SPI clock polarity / phase
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub enum SpiMode {
    /// CPOL=0, CPHA=0
    #[default]
    Mode0,
    /// CPOL=0, CPHA=1
    Mode1,
    /// CPOL=1, CPHA=0
    Mode2,
    /// CPOL=1, CPHA=1
    Mode3,
}

impl SpiMode {
    /// Mode number as used by spidev (`SPI_MODE_n`)
    pub fn bits(self) -> u8 {
        match self {
            SpiMode::Mode0 => 0,
            SpiMode::Mode1 => 1,
            SpiMode::Mode2 => 2,
            SpiMode::Mode3 => 3,
        }
    }

    pub fn from_bits(bits: u8) -> Option<Self> {
        match bits {
            0 => Some(SpiMode::Mode0),
            1 => Some(SpiMode::Mode1),
            2 => Some(SpiMode::Mode2),
            3 => Some(SpiMode::Mode3),
            _ => None,
        }
    }
}

/// Injected SPI capability
///
/// Opening a chip select at a new mode is the expensive operation here;
/// `BusHost` calls `open` only when the cached mode differs.
pub trait SpiController: Send {
    /// Open (or reopen) `chip_select` configured for `mode`
    fn open(&mut self, chip_select: u8, mode: SpiMode) -> BusResult<()>;

    /// Close `chip_select` if open
    fn close(&mut self, chip_select: u8);

    /// Write `data` MSB-first on an open chip select
    fn write(&mut self, chip_select: u8, data: &[u8]) -> BusResult<()>;
}

/// Owner of the physical bus handles
pub struct BusHost {
    spi: Box<dyn SpiController>,
    i2c: Box<I2cDevice>,
    address_pins: Vec<Box<AddressPin>>,
    /// Slot currently asserted on the address lines
    active_slot: Option<Slot>,
    /// Mode each chip select was last opened with (None = closed or failed)
    spi_modes: [Option<SpiMode>; MAX_CHIP_SELECTS],
    /// Number of SPI (re)opens performed, for ordering diagnostics
    reconfigurations: u64,
}

impl BusHost {
    /// Create a bus host from injected capabilities
    ///
    /// `address_pins[n]` drives bit `n` of the slot number.
    pub fn new(
        spi: Box<dyn SpiController>,
        i2c: Box<I2cDevice>,
        address_pins: Vec<Box<AddressPin>>,
    ) -> Self {
        if address_pins.len() != ADDRESS_LINES {
            log::warn!(
                "Bus: {} address lines supplied, backplane decoder expects {}",
                address_pins.len(),
                ADDRESS_LINES
            );
        }
        Self {
            spi,
            i2c,
            address_pins,
            active_slot: None,
            spi_modes: [None; MAX_CHIP_SELECTS],
            reconfigurations: 0,
        }
    }

    /// Assert the address lines for `slot`
    ///
    /// No-op when `slot` is already selected. A failing GPIO write is
    /// propagated and leaves the selection unknown, so the next call
    /// rewrites every line.
    pub fn select_slot(&mut self, slot: Slot) -> BusResult<()> {
        if slot as usize >= SLOT_COUNT {
            return Err(BusError::InvalidSlot(slot));
        }
        if self.active_slot == Some(slot) {
            return Ok(());
        }

        for (bit, pin) in self.address_pins.iter_mut().enumerate() {
            let high = (slot >> bit) & 1 == 1;
            if let Err(e) = pin.set_state(PinState::from(high)) {
                self.active_slot = None;
                return Err(e);
            }
        }

        self.active_slot = Some(slot);
        Ok(())
    }

    /// Make `chip_select` ready for writes in `mode`
    ///
    /// Reopens the bus only when the cached mode differs. If opening fails the
    /// cache is invalidated and the error returned; the caller should abandon
    /// the current call but keep running.
    pub fn configure_spi(&mut self, chip_select: u8, mode: SpiMode) -> BusResult<()> {
        let idx = chip_select as usize;
        if idx >= MAX_CHIP_SELECTS {
            return Err(BusError::InvalidChipSelect(chip_select));
        }
        if self.spi_modes[idx] == Some(mode) {
            return Ok(());
        }

        if self.spi_modes[idx].take().is_some() {
            self.spi.close(chip_select);
        }

        match self.spi.open(chip_select, mode) {
            Ok(()) => {
                self.spi_modes[idx] = Some(mode);
                self.reconfigurations += 1;
                Ok(())
            }
            Err(e) => {
                log::error!(
                    "Bus: failed to open SPI chip select {} in {:?}: {}",
                    chip_select,
                    mode,
                    e
                );
                Err(e)
            }
        }
    }

    /// Write raw bytes on a configured chip select
    pub fn spi_write(&mut self, chip_select: u8, data: &[u8]) -> BusResult<()> {
        match self.spi_modes.get(chip_select as usize) {
            Some(Some(_)) => self.spi.write(chip_select, data),
            Some(None) => Err(BusError::NotOpen(chip_select)),
            None => Err(BusError::InvalidChipSelect(chip_select)),
        }
    }

    /// Shared I2C bus
    pub fn i2c(&mut self) -> &mut I2cDevice {
        self.i2c.as_mut()
    }

    /// Read one byte at `offset` from the device at `address`
    pub fn i2c_read_byte(&mut self, address: u8, offset: u8) -> BusResult<u8> {
        let mut buf = [0u8; 1];
        self.i2c.write_read(address, &[offset], &mut buf)?;
        Ok(buf[0])
    }

    pub fn active_slot(&self) -> Option<Slot> {
        self.active_slot
    }

    pub fn spi_mode(&self, chip_select: u8) -> Option<SpiMode> {
        self.spi_modes.get(chip_select as usize).copied().flatten()
    }

    /// Number of SPI opens since creation
    pub fn reconfigurations(&self) -> u64 {
        self.reconfigurations
    }

    /// Close every open chip select
    pub fn close_all(&mut self) {
        for (idx, mode) in self.spi_modes.iter_mut().enumerate() {
            if mode.take().is_some() {
                self.spi.close(idx as u8);
            }
        }
    }
}

impl Drop for BusHost {
    fn drop(&mut self) {
        self.close_all();
    }
}

/// Bus host shared between the audio thread and the MIDI thread
///
/// Every select/configure/write sequence must run under one [`SharedBus::lock`]
/// so that two threads never interleave partial transactions.
#[derive(Clone)]
pub struct SharedBus(Arc<Mutex<BusHost>>);

impl SharedBus {
    pub fn new(host: BusHost) -> Self {
        Self(Arc::new(Mutex::new(host)))
    }

    /// Lock the bus for one transaction sequence
    ///
    /// A poisoned lock is recovered: the cached state is re-validated by the
    /// next select/configure call anyway.
    pub fn lock(&self) -> MutexGuard<'_, BusHost> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{MockBus, SpiEvent};

    #[test]
    fn test_select_slot_drives_address_lines() {
        let mock = MockBus::new();
        let mut host = mock.host();

        host.select_slot(5).unwrap();
        assert_eq!(mock.address_levels(), [true, false, true]);
        assert_eq!(host.active_slot(), Some(5));

        host.select_slot(2).unwrap();
        assert_eq!(mock.address_levels(), [false, true, false]);
    }

    #[test]
    fn test_select_same_slot_is_cached() {
        let mock = MockBus::new();
        let mut host = mock.host();

        host.select_slot(3).unwrap();
        let writes = mock.address_writes();
        host.select_slot(3).unwrap();
        assert_eq!(mock.address_writes(), writes);
    }

    #[test]
    fn test_select_invalid_slot() {
        let mock = MockBus::new();
        let mut host = mock.host();
        assert!(matches!(host.select_slot(8), Err(BusError::InvalidSlot(8))));
    }

    #[test]
    fn test_gpio_failure_invalidates_selection() {
        let mock = MockBus::new();
        let mut host = mock.host();
        host.select_slot(1).unwrap();

        mock.fail_gpio(true);
        assert!(host.select_slot(2).is_err());
        assert_eq!(host.active_slot(), None);

        mock.fail_gpio(false);
        host.select_slot(1).unwrap();
        assert_eq!(host.active_slot(), Some(1));
    }

    #[test]
    fn test_spi_reopened_only_on_mode_change() {
        let mock = MockBus::new();
        let mut host = mock.host();

        host.configure_spi(0, SpiMode::Mode1).unwrap();
        host.configure_spi(0, SpiMode::Mode1).unwrap();
        assert_eq!(host.reconfigurations(), 1);

        host.configure_spi(0, SpiMode::Mode0).unwrap();
        assert_eq!(host.reconfigurations(), 2);
        assert_eq!(
            mock.spi_events(),
            vec![
                SpiEvent::Open(0, SpiMode::Mode1),
                SpiEvent::Close(0),
                SpiEvent::Open(0, SpiMode::Mode0),
            ]
        );
    }

    #[test]
    fn test_spi_open_failure_is_not_cached() {
        let mock = MockBus::new();
        let mut host = mock.host();

        mock.fail_spi_open(true);
        assert!(host.configure_spi(0, SpiMode::Mode2).is_err());
        assert_eq!(host.spi_mode(0), None);
        assert!(matches!(host.spi_write(0, &[0, 0]), Err(BusError::NotOpen(0))));

        mock.fail_spi_open(false);
        host.configure_spi(0, SpiMode::Mode2).unwrap();
        host.spi_write(0, &[0x12, 0x34]).unwrap();
        assert_eq!(mock.spi_writes(), vec![vec![0x12, 0x34]]);
    }
}
