//! Card driver contract
//!
//! Every card type plugged into the backplane is driven through
//! [`CardDriver`]. Drivers are created by the registry from the card id read
//! out of the card's ROM, and live exactly as long as the card is loaded:
//! dropping a driver releases everything it owns.
//!
//! # Tuning sub-protocol
//!
//! ```text
//! tune_save_state ──► ┌─ tune_set_point ──► (frequency capture) ──► tune_measurement ─┐
//!                     └──────────────────────── repeat until Done ───────────────────┘
//!                                       │
//!                                       ▼
//!                              tune_restore_state(completed)
//! ```
//!
//! Any step may report [`TuneStatus::Done`]; the card then takes no further
//! part in the rounds but is still restored.

pub mod dac;
mod registry;

pub use dac::{dac_frame, ChannelMemo, DacPort};
pub use registry::{
    assign_channels, assign_update_order, discover_cards, load_drivers, CardManager,
    ChannelAssignment, ConfigError, DriverEntry, LoadedCard, DetectedCard, SlotReport, MAX_STREAMS,
};

use thiserror::Error;

use crate::bus::{BusError, SpiMode};
use crate::calibration::CalibrationError;

/// Static card metadata used for channel packing and update ordering
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CardProperties {
    /// Audio channels consumed per frame
    pub channel_count: usize,
    /// SPI mode the card's DAC needs
    pub spi_mode: SpiMode,
}

/// Progress reported by tuning calls
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TuneStatus {
    /// Card needs more rounds
    Continue,
    /// Card has finished (or has nothing to tune)
    Done,
}

/// Result of one frequency-counting window for a card's tune pin
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Measurement {
    /// Frequency in Hz (0.0 when the pin never toggled)
    pub frequency: f64,
    /// Low→high transitions in the window
    pub transitions: u32,
    /// Microseconds between the first and last sample
    pub elapsed_us: u32,
}

/// Card lifecycle errors
#[derive(Error, Debug)]
pub enum CardError {
    #[error("card init failed: {0}")]
    Init(#[from] BusError),

    #[error("no driver for card id {0:#04x}")]
    UnknownCard(u8),

    #[error("calibration failed: {0}")]
    Calibration(#[from] CalibrationError),
}

/// Driver for one card instance
///
/// All methods that touch hardware receive their bus handle at construction
/// and must lock it, select their slot and configure SPI before writing.
pub trait CardDriver: Send {
    fn properties(&self) -> CardProperties;

    /// Realtime hot path: write one frame of this card's channels
    ///
    /// `samples` holds exactly `properties().channel_count` values. Must not
    /// block on anything but the bus lock, allocate or log.
    fn process_samples(&mut self, samples: &[i16]) -> Result<(), BusError>;

    /// Raw channel-voice message addressed to this card
    fn process_midi(&mut self, _message: &[u8]) -> Result<(), BusError> {
        Ok(())
    }

    /// MIDI program change addressed to this card
    ///
    /// Unknown program numbers are logged and ignored.
    fn process_program_change(&mut self, program: u8) -> Result<(), BusError>;

    /// Save the state that tuning will disturb
    fn tune_save_state(&mut self) -> Result<TuneStatus, BusError> {
        Ok(TuneStatus::Done)
    }

    /// Drive the next calibration code onto the tune output
    fn tune_set_point(&mut self) -> Result<TuneStatus, BusError> {
        Ok(TuneStatus::Done)
    }

    /// Record the frequency measured for the current calibration code
    fn tune_measurement(&mut self, _measurement: &Measurement) -> Result<TuneStatus, BusError> {
        Ok(TuneStatus::Done)
    }

    /// Restore pre-tuning state, committing new tables when `completed`
    fn tune_restore_state(&mut self, _completed: bool) -> Result<(), BusError> {
        Ok(())
    }
}
