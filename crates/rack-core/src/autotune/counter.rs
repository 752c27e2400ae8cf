//! GPIO frequency counter
//!
//! Accumulates timestamped level samples for one measurement window and
//! counts low→high transitions per pin.

use std::time::Duration;

use crate::bus::BusResult;

/// Pins addressable by one sample (one bit per BCM line)
pub const MAX_PINS: usize = 32;

/// Levels of all sampled lines at one instant
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GpioSample {
    /// Microsecond timestamp from a free-running 32-bit counter
    pub tick: u32,
    /// Line levels, bit N = BCM pin N
    pub levels: u32,
}

/// Source of GPIO level samples
///
/// Only one capture is active at a time; the counter is owned by the caller
/// for the duration of the window.
pub trait EdgeSampler: Send {
    /// Sample the lines in `mask` for `window`, feeding every batch to `counter`
    fn capture(
        &mut self,
        mask: u32,
        window: Duration,
        counter: &mut FrequencyCounter,
    ) -> BusResult<()>;
}

/// Per-window transition accumulator
#[derive(Debug, Clone)]
pub struct FrequencyCounter {
    mask: u32,
    transitions: [u32; MAX_PINS],
    previous_levels: Option<u32>,
    first_tick: Option<u32>,
    last_tick: u32,
    wrapped: bool,
    samples: u64,
}

impl FrequencyCounter {
    pub fn new(mask: u32) -> Self {
        Self {
            mask,
            transitions: [0; MAX_PINS],
            previous_levels: None,
            first_tick: None,
            last_tick: 0,
            wrapped: false,
            samples: 0,
        }
    }

    pub fn mask(&self) -> u32 {
        self.mask
    }

    /// Feed a batch of samples in capture order
    pub fn accept(&mut self, samples: &[GpioSample]) {
        for sample in samples {
            match self.first_tick {
                None => self.first_tick = Some(sample.tick),
                Some(_) if sample.tick < self.last_tick => self.wrapped = true,
                Some(_) => {}
            }
            self.last_tick = sample.tick;

            if let Some(previous) = self.previous_levels {
                let mut rising = !previous & sample.levels & self.mask;
                while rising != 0 {
                    let pin = rising.trailing_zeros() as usize;
                    self.transitions[pin] += 1;
                    rising &= rising - 1;
                }
            }
            self.previous_levels = Some(sample.levels);
            self.samples += 1;
        }
    }

    /// The tick counter wrapped inside the window; the window is unusable
    pub fn wrapped(&self) -> bool {
        self.wrapped
    }

    pub fn samples(&self) -> u64 {
        self.samples
    }

    /// Low→high transitions seen on `pin`
    pub fn transitions(&self, pin: u8) -> u32 {
        self.transitions.get(usize::from(pin)).copied().unwrap_or(0)
    }

    /// Microseconds between the first and last sample, `None` if wrapped
    /// or no samples were taken
    pub fn elapsed_micros(&self) -> Option<u32> {
        if self.wrapped {
            return None;
        }
        self.first_tick.map(|first| self.last_tick - first)
    }

    /// Measured frequency on `pin` in Hz
    ///
    /// Zero when nothing toggled or the window is degenerate.
    pub fn frequency(&self, pin: u8) -> f64 {
        match self.elapsed_micros() {
            Some(elapsed) if elapsed > 0 => {
                f64::from(self.transitions(pin)) * 1e6 / f64::from(elapsed)
            }
            _ => 0.0,
        }
    }
}
