//! Rack Core - backplane bus, card drivers and the audio-to-hardware engine
//!
//! - [`bus`]: SPI / I2C / GPIO host shared by every card
//! - [`card`]: card driver contract, discovery and channel assignment
//! - [`audio`]: capture streams, sample clock and the per-sample tick loop
//! - [`autotune`]: closed-loop frequency calibration
//! - [`calibration`]: DAC packing and correction-table math
//! - [`config`]: YAML configuration helpers
//! - [`testing`]: in-memory hardware used by tests and dry runs

pub mod audio;
pub mod autotune;
pub mod bus;
pub mod calibration;
pub mod card;
pub mod config;
pub mod testing;

pub use bus::{BusError, BusHost, SharedBus, Slot, SpiMode, SLOT_COUNT};
pub use card::{CardDriver, CardError, CardProperties, ConfigError, Measurement, TuneStatus};
