//! Bus error types

use thiserror::Error;

/// Errors reported by the SPI / I2C / GPIO capabilities
#[derive(Error, Debug)]
pub enum BusError {
    /// Read or write on an open bus handle failed
    #[error("bus I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A device node could not be opened or configured
    #[error("failed to open {path}: {source}")]
    Open {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// Slot index outside the 8-slot backplane
    #[error("slot {0} is outside the backplane")]
    InvalidSlot(u8),

    /// Chip select index outside the controller's range
    #[error("SPI chip select {0} is not available")]
    InvalidChipSelect(u8),

    /// Write attempted on a chip select whose last open failed
    #[error("SPI chip select {0} is not open")]
    NotOpen(u8),

    /// I2C device did not acknowledge its address
    #[error("no acknowledge from I2C address {0:#04x}")]
    NoAcknowledge(u8),

    /// GPIO line could not be driven or read
    #[error("GPIO {pin}: {reason}")]
    Gpio { pin: u8, reason: String },
}

impl embedded_hal::i2c::Error for BusError {
    fn kind(&self) -> embedded_hal::i2c::ErrorKind {
        use embedded_hal::i2c::{ErrorKind, NoAcknowledgeSource};
        match self {
            BusError::NoAcknowledge(_) => ErrorKind::NoAcknowledge(NoAcknowledgeSource::Address),
            BusError::Io(_) => ErrorKind::Bus,
            _ => ErrorKind::Other,
        }
    }
}

impl embedded_hal::digital::Error for BusError {
    fn kind(&self) -> embedded_hal::digital::ErrorKind {
        embedded_hal::digital::ErrorKind::Other
    }
}

/// Result type for bus operations
pub type BusResult<T> = Result<T, BusError>;
