//! Capture stream error types

use thiserror::Error;

/// Errors reported by capture devices and the sample clock
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StreamError {
    /// Ring buffer overrun; stream must be re-prepared
    #[error("capture overrun")]
    Xrun,

    /// Device suspended (system sleep)
    #[error("capture device suspended")]
    Suspended,

    /// Device went away or its callback reported an error
    #[error("capture device disconnected: {0}")]
    Disconnected(String),

    /// Not ready yet, try again later
    #[error("resource temporarily unavailable")]
    Again,

    /// Device open or configuration failure
    #[error("capture device error: {0}")]
    Device(String),

    /// Negotiated parameters differ from the requested ones
    #[error("{what}: requested {requested}, device gave {actual}")]
    Mismatch {
        what: &'static str,
        requested: u32,
        actual: u32,
    },
}

/// Result type for stream operations
pub type StreamResult<T> = Result<T, StreamError>;
