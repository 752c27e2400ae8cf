//! Voltage-range limiting
//!
//! Cards with several analog outputs each store the voltage measured at code
//! 0 and code 4095 for every channel. Writing the same code to all channels
//! must give the same voltage, so every channel is limited to the range that
//! all of them can reach.

use serde::{Deserialize, Serialize};

use super::{clamp_code, CorrectionTable, DAC_MAX};

/// Output voltage at code 0 (`min`) and code 4095 (`max`)
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct VoltageRange {
    pub min: f32,
    pub max: f32,
}

impl VoltageRange {
    pub const fn new(min: f32, max: f32) -> Self {
        Self { min, max }
    }

    pub fn is_valid(&self) -> bool {
        self.min.is_finite() && self.max.is_finite() && self.min < self.max
    }

    pub fn span(&self) -> f32 {
        self.max - self.min
    }
}

/// Common range reachable by every channel
///
/// Channels with inconsistent calibration (`min >= max`) are treated as
/// nominal. If the intersection is empty the nominal range is returned.
pub fn limit_ranges(channels: &[VoltageRange], nominal: VoltageRange) -> VoltageRange {
    let mut common = VoltageRange::new(f32::MIN, f32::MAX);
    for (channel, range) in channels.iter().enumerate() {
        let range = if range.is_valid() {
            *range
        } else {
            log::warn!(
                "Calibration: channel {} range {:.3}..{:.3} V is inconsistent, using nominal",
                channel,
                range.min,
                range.max
            );
            nominal
        };
        common.min = common.min.max(range.min);
        common.max = common.max.min(range.max);
    }

    if channels.is_empty() || !common.is_valid() {
        return nominal;
    }
    common
}

/// Table mapping input codes onto `target` for a channel spanning `channel`
///
/// Input code 0 produces `target.min`, code 4095 produces `target.max`.
pub fn range_table(channel: VoltageRange, target: VoltageRange, address: u8) -> CorrectionTable {
    if !channel.is_valid() {
        return CorrectionTable::linear(address);
    }
    let full = f32::from(DAC_MAX);
    CorrectionTable::from_fn(address, |n| {
        let volts = target.min + target.span() * f32::from(n) / full;
        let code = (volts - channel.min) / channel.span() * full;
        clamp_code(f64::from(code))
    })
}
