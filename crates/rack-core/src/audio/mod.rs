//! Audio capture and the per-sample dispatch engine
//!
//! Control voltages arrive as a multichannel S16 capture stream (one or two
//! USB-audio devices). Every sample period the engine hands the current frame
//! of each stream to every card, in update order, then waits for the sample
//! clock and advances the capture window by however many periods elapsed.
//!
//! ```text
//! ┌──────────────┐  mmap window   ┌──────────────┐ process_samples ┌────────┐
//! │ CaptureDevice│───────────────►│ AudioEngine  │────────────────►│ cards  │
//! │  (1..2)      │◄── commit ─────│  tick loop   │                 └────────┘
//! └──────────────┘                └──────┬───────┘
//!                                        │ wait()
//!                                 ┌──────▼───────┐
//!                                 │ SampleClock  │ periodic timer at sample rate
//!                                 └──────────────┘
//! ```

mod clock;
#[cfg(feature = "cpal-capture")]
mod cpal_capture;
mod engine;
mod error;
mod stats;
mod stream;

pub use clock::SampleClock;
#[cfg(target_os = "linux")]
pub use clock::TimerFdClock;
#[cfg(feature = "cpal-capture")]
pub use cpal_capture::{list_capture_devices, CpalCapture};
pub use engine::AudioEngine;
pub use error::{StreamError, StreamResult};
pub use stats::TickStats;
pub use stream::{open_streams, Stream};

use serde::{Deserialize, Serialize};

/// Default control-voltage sample rate
pub const DEFAULT_SAMPLE_RATE: u32 = 4000;

/// Default frames per capture period
pub const DEFAULT_PERIOD_SIZE: usize = 16;

/// Default capture buffer depth in frames
pub const DEFAULT_BUFFER_SIZE: usize = 512;

/// Default channels per capture device
pub const DEFAULT_CHANNELS: usize = 16;

/// Requested (and after negotiation, actual) capture parameters
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamParams {
    /// Device name (substring match against the host's capture devices)
    pub pcm_device: String,
    pub sample_rate: u32,
    pub period_size: usize,
    pub buffer_size: usize,
    pub channels: usize,
}

impl Default for StreamParams {
    fn default() -> Self {
        Self {
            pcm_device: "default".to_string(),
            sample_rate: DEFAULT_SAMPLE_RATE,
            period_size: DEFAULT_PERIOD_SIZE,
            buffer_size: DEFAULT_BUFFER_SIZE,
            channels: DEFAULT_CHANNELS,
        }
    }
}

/// Capture device state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Unprepared,
    Prepared,
    Running,
    Xrun,
    Suspended,
    Disconnected,
}

/// A memory-mapped capture device
///
/// Frames are read through a window: `mmap_begin` exposes up to `max_frames`
/// captured frames, `frame(i)` reads frame `i` of the window, and
/// `mmap_commit` releases consumed frames back to the device.
pub trait CaptureDevice: Send {
    /// Human-readable device name
    fn name(&self) -> &str;

    /// Apply `params`, returning what the device actually negotiated
    fn configure(&mut self, params: &StreamParams) -> StreamResult<StreamParams>;

    fn state(&self) -> StreamState;

    /// Reset buffers and move to `Prepared`
    fn prepare(&mut self) -> StreamResult<()>;

    /// Start capturing (from `Prepared`)
    fn start(&mut self) -> StreamResult<()>;

    /// Try to leave `Suspended`; `Err(Again)` while still asleep
    fn resume(&mut self) -> StreamResult<()>;

    /// Open a window over up to `max_frames` captured frames
    ///
    /// Returns the number of frames in the window, 0 if none are ready yet.
    fn mmap_begin(&mut self, max_frames: usize) -> StreamResult<usize>;

    /// Frame `index` of the current window
    fn frame(&self, index: usize) -> &[i16];

    /// Release the first `frames` frames of the window
    fn mmap_commit(&mut self, frames: usize) -> StreamResult<()>;
}
