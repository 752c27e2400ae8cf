//! Calibration math shared by card drivers
//!
//! - 12-bit DAC word packing (4 address bits + 12 data bits)
//! - Pitch conversions between frequency, octaves and DAC codes
//! - Correction tables built from sparse tune points
//! - Voltage-range limiting for cards with per-channel analog calibration
//!
//! # Correction tables
//!
//! A table maps a nominal input code (what the host asked for) to the code
//! that must be written so the hardware actually produces that pitch. Tune
//! points give pairs of `(target_code written, expected_code observed)`:
//!
//! ```text
//! output ▲                      ●━━━━━━━━ saturate at last point
//!        │                  ●╱
//!        │             ●╱╱
//!        │        ●╱╱          piecewise-linear between points
//!        │    ●╱
//!        │ ╱ ← extended through the slope of the first two points
//!        └──────────────────────────────► input (expected code)
//! ```

mod range;

pub use range::{limit_ranges, range_table, VoltageRange};

use thiserror::Error;

/// Number of codes of a 12-bit DAC
pub const DAC_CODES: usize = 4096;

/// Largest 12-bit DAC code
pub const DAC_MAX: u16 = 4095;

/// DAC codes per octave for a 0..8 V, 1 V/octave output stage
pub const NOMINAL_CODES_PER_OCTAVE: f64 = 512.0;

/// Frequency produced by DAC code 0 on a correctly trimmed oscillator (A0)
pub const REFERENCE_FREQUENCY: f64 = 27.5;

/// Errors while building a correction table
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CalibrationError {
    #[error("need at least 2 usable tune points, got {0}")]
    TooFewPoints(usize),

    #[error("tune point {index} does not increase in pitch")]
    NonMonotonic { index: usize },

    #[error("invalid voltage range {min}..{max}")]
    InvalidRange { min: f32, max: f32 },
}

/// Pack a 12-bit code with a 4-bit DAC address into one wire word
#[inline]
pub fn pack_dac_word(address: u8, code: u16) -> u16 {
    (u16::from(address & 0x0F) << 12) | (code & 0x0FFF)
}

/// Convert a signed 16-bit audio sample to a 12-bit DAC code
///
/// Negative samples clamp to zero; the positive half maps onto 0..4095.
#[inline]
pub fn sample_to_code(sample: i16) -> u16 {
    if sample <= 0 {
        0
    } else {
        (sample as u16) >> 3
    }
}

/// Octaves of `frequency` above `reference`
pub fn frequency_to_octave(frequency: f64, reference: f64) -> f64 {
    (frequency / reference).log2()
}

/// Frequency `octave` octaves above `reference`
pub fn octave_to_frequency(octave: f64, reference: f64) -> f64 {
    reference * octave.exp2()
}

/// Round and clamp a floating point code into the DAC range
#[inline]
pub fn clamp_code(code: f64) -> u16 {
    if code.is_nan() || code <= 0.0 {
        0
    } else if code >= f64::from(DAC_MAX) {
        DAC_MAX
    } else {
        code.round() as u16
    }
}

/// DAC code that nominally produces `octave`
pub fn octave_to_dac(octave: f64, codes_per_octave: f64) -> u16 {
    clamp_code(octave * codes_per_octave)
}

/// Nominal pitch law of an oscillator output stage
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PitchScale {
    /// Frequency at code 0
    pub reference: f64,
    /// Codes per octave
    pub codes_per_octave: f64,
}

impl Default for PitchScale {
    fn default() -> Self {
        Self {
            reference: REFERENCE_FREQUENCY,
            codes_per_octave: NOMINAL_CODES_PER_OCTAVE,
        }
    }
}

impl PitchScale {
    /// Nominal (fractional) input code for a measured frequency
    pub fn expected_code(&self, frequency: f64) -> f64 {
        frequency_to_octave(frequency, self.reference) * self.codes_per_octave
    }

    /// Frequency a perfect stage produces for `code`
    pub fn frequency(&self, code: f64) -> f64 {
        octave_to_frequency(code / self.codes_per_octave, self.reference)
    }
}

/// One calibration measurement
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TunePoint {
    /// Code written to the DAC
    pub target_code: u16,
    /// Frequency measured at the GPIO
    pub measured_frequency: f64,
    /// Nominal code the measured frequency corresponds to
    pub expected_code: f64,
}

impl TunePoint {
    pub fn new(target_code: u16, measured_frequency: f64, scale: &PitchScale) -> Self {
        Self {
            target_code,
            measured_frequency,
            expected_code: scale.expected_code(measured_frequency),
        }
    }

    fn is_usable(&self) -> bool {
        self.measured_frequency > 0.0 && self.expected_code.is_finite()
    }
}

/// Nominal input code → pre-packed output word
///
/// Always holds exactly [`DAC_CODES`] entries; built completely before it is
/// handed to a driver, so the audio path never sees a partial table.
#[derive(Clone, PartialEq, Eq)]
pub struct CorrectionTable {
    entries: Box<[u16]>,
}

impl std::fmt::Debug for CorrectionTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CorrectionTable")
            .field("first", &self.entries[0])
            .field("last", &self.entries[DAC_CODES - 1])
            .finish()
    }
}

impl CorrectionTable {
    /// Build a table from a per-code function returning unpacked codes
    pub fn from_fn(address: u8, mut code_for: impl FnMut(u16) -> u16) -> Self {
        let entries = (0..DAC_CODES as u16)
            .map(|n| pack_dac_word(address, code_for(n)))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self { entries }
    }

    /// Identity (uncorrected) table
    pub fn linear(address: u8) -> Self {
        Self::from_fn(address, |n| n)
    }

    /// Build a correction table from measured tune points
    ///
    /// Points are sorted by target code and must rise in pitch. Inputs below
    /// the first point follow the slope measured between the first two
    /// points, through the corrected zero intercept. Inputs at or above the
    /// last point saturate at that point's code.
    pub fn from_points(
        points: &[TunePoint],
        scale: &PitchScale,
        address: u8,
    ) -> Result<Self, CalibrationError> {
        let mut usable: Vec<TunePoint> = points.iter().copied().filter(TunePoint::is_usable).collect();
        if usable.len() < 2 {
            return Err(CalibrationError::TooFewPoints(usable.len()));
        }
        usable.sort_by_key(|p| p.target_code);

        for (index, pair) in usable.windows(2).enumerate() {
            if pair[1].expected_code <= pair[0].expected_code {
                return Err(CalibrationError::NonMonotonic { index: index + 1 });
            }
        }

        let first = usable[0];
        let second = usable[1];
        let last = usable[usable.len() - 1];

        // Actual codes per octave from the first two points
        let octave_first = first.expected_code / scale.codes_per_octave;
        let octave_second = second.expected_code / scale.codes_per_octave;
        let actual_per_octave = (f64::from(second.target_code) - f64::from(first.target_code))
            / (octave_second - octave_first);
        let zero = f64::from(first.target_code) - octave_first * actual_per_octave;

        let mut segment = 0;
        let table = Self::from_fn(address, |n| {
            let input = f64::from(n);
            if input <= first.expected_code {
                return clamp_code(zero + input / scale.codes_per_octave * actual_per_octave);
            }
            if input >= last.expected_code {
                return last.target_code;
            }
            while usable[segment + 1].expected_code < input {
                segment += 1;
            }
            let lo = usable[segment];
            let hi = usable[segment + 1];
            let t = (input - lo.expected_code) / (hi.expected_code - lo.expected_code);
            clamp_code(
                f64::from(lo.target_code)
                    + t * (f64::from(hi.target_code) - f64::from(lo.target_code)),
            )
        });

        Ok(table)
    }

    /// Packed output word for a 12-bit input code
    #[inline]
    pub fn lookup(&self, code: u16) -> u16 {
        self.entries[usize::from(code.min(DAC_MAX))]
    }

    /// Output code (address bits stripped) for a 12-bit input code
    pub fn code(&self, code: u16) -> u16 {
        self.lookup(code) & 0x0FFF
    }

    pub fn as_slice(&self) -> &[u16] {
        &self.entries
    }
}

/// Default calibration points: every octave from 0 to 7, plus full scale
pub fn default_test_codes() -> Vec<u16> {
    (0..8u16)
        .map(|octave| octave * NOMINAL_CODES_PER_OCTAVE as u16)
        .chain(std::iter::once(DAC_MAX))
        .collect()
}

/// Per-channel calibration progress during one autotune run
#[derive(Debug, Clone)]
pub struct TuningSession {
    codes: Vec<u16>,
    tuning_index: usize,
    points: Vec<TunePoint>,
    scale: PitchScale,
}

impl TuningSession {
    pub fn new(codes: Vec<u16>, scale: PitchScale) -> Self {
        let capacity = codes.len();
        Self {
            codes,
            tuning_index: 0,
            points: Vec::with_capacity(capacity),
            scale,
        }
    }

    /// Start over: index back to 0, points cleared
    pub fn reset(&mut self) {
        self.tuning_index = 0;
        self.points.clear();
    }

    /// Code to drive for the next measurement, `None` once complete
    pub fn next_code(&self) -> Option<u16> {
        self.codes.get(self.tuning_index).copied()
    }

    /// Record the frequency measured for the current code
    ///
    /// Returns `true` once every calibration code has been measured.
    pub fn record(&mut self, frequency: f64) -> bool {
        if let Some(code) = self.next_code() {
            self.points.push(TunePoint::new(code, frequency, &self.scale));
            self.tuning_index += 1;
        }
        self.is_complete()
    }

    pub fn is_complete(&self) -> bool {
        self.tuning_index >= self.codes.len()
    }

    pub fn tuning_index(&self) -> usize {
        self.tuning_index
    }

    pub fn points(&self) -> &[TunePoint] {
        &self.points
    }

    /// Build the correction table from the recorded points
    pub fn build_table(&self, address: u8) -> Result<CorrectionTable, CalibrationError> {
        CorrectionTable::from_points(&self.points, &self.scale, address)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn ideal_points(codes: &[u16]) -> Vec<TunePoint> {
        let scale = PitchScale::default();
        codes
            .iter()
            .map(|&c| TunePoint::new(c, scale.frequency(f64::from(c)), &scale))
            .collect()
    }

    #[test]
    fn test_pack_dac_word() {
        assert_eq!(pack_dac_word(0x3, 0x0ABC), 0x3ABC);
        assert_eq!(pack_dac_word(0x1F, 0xFFFF), 0xFFFF);
        assert_eq!(pack_dac_word(0, 0), 0);
    }

    #[test]
    fn test_sample_to_code() {
        assert_eq!(sample_to_code(i16::MIN), 0);
        assert_eq!(sample_to_code(-1), 0);
        assert_eq!(sample_to_code(0), 0);
        assert_eq!(sample_to_code(8), 1);
        assert_eq!(sample_to_code(i16::MAX), DAC_MAX);
    }

    #[test]
    fn test_octave_conversions() {
        assert!((frequency_to_octave(55.0, 27.5) - 1.0).abs() < 1e-12);
        assert!((octave_to_frequency(2.0, 27.5) - 110.0).abs() < 1e-9);
        assert_eq!(octave_to_dac(1.0, NOMINAL_CODES_PER_OCTAVE), 512);
        assert_eq!(octave_to_dac(-1.0, NOMINAL_CODES_PER_OCTAVE), 0);
        assert_eq!(octave_to_dac(9.0, NOMINAL_CODES_PER_OCTAVE), DAC_MAX);
    }

    #[test]
    fn test_default_test_codes() {
        assert_eq!(
            default_test_codes(),
            vec![0, 512, 1024, 1536, 2048, 2560, 3072, 3584, 4095]
        );
    }

    #[test]
    fn test_ideal_dac_yields_identity_table() {
        let points = ideal_points(&default_test_codes());
        let table = CorrectionTable::from_points(&points, &PitchScale::default(), 0x2).unwrap();

        for n in 0..DAC_CODES as u16 {
            let out = table.code(n);
            assert!(
                (i32::from(out) - i32::from(n)).abs() <= 1,
                "input {} mapped to {}",
                n,
                out
            );
            assert_eq!(table.lookup(n) >> 12, 0x2);
        }
    }

    #[test]
    fn test_flat_stage_is_stretched() {
        // Stage produces only 0.9 octave per nominal octave → needs more codes
        let scale = PitchScale::default();
        let points: Vec<TunePoint> = default_test_codes()
            .into_iter()
            .map(|c| {
                let octave = 0.9 * f64::from(c) / scale.codes_per_octave;
                TunePoint::new(c, octave_to_frequency(octave, scale.reference), &scale)
            })
            .collect();
        let table = CorrectionTable::from_points(&points, &scale, 0).unwrap();

        // Nominal octave 1 needs 1/0.9 octaves worth of codes
        let expected = (512.0 / 0.9_f64).round() as i32;
        assert!((i32::from(table.code(512)) - expected).abs() <= 1);
        // Beyond the last measured pitch the table saturates
        let last_expected = points.last().unwrap().expected_code.ceil() as u16;
        assert_eq!(table.code(last_expected), 4095);
        assert_eq!(table.code(DAC_MAX), 4095);
    }

    #[test]
    fn test_offset_stage_uses_zero_intercept() {
        // Oscillator runs a quarter octave sharp at every code
        let scale = PitchScale::default();
        let codes = [512u16, 1024, 2048, 3072];
        let points: Vec<TunePoint> = codes
            .iter()
            .map(|&c| {
                let octave = f64::from(c) / scale.codes_per_octave + 0.25;
                TunePoint::new(c, octave_to_frequency(octave, scale.reference), &scale)
            })
            .collect();
        let table = CorrectionTable::from_points(&points, &scale, 0).unwrap();

        // Input n needs output n - 128 below the first point too
        assert_eq!(table.code(640), 512);
        assert_eq!(table.code(400), 272);
        assert_eq!(table.code(100), 0);
    }

    #[test]
    fn test_zero_frequency_points_are_skipped() {
        let mut points = ideal_points(&[0, 1024, 2048]);
        points.push(TunePoint::new(3072, 0.0, &PitchScale::default()));
        let table = CorrectionTable::from_points(&points, &PitchScale::default(), 0).unwrap();
        assert_eq!(table.code(2048), 2048);
        assert_eq!(table.code(3000), 2048);
    }

    #[test]
    fn test_too_few_points() {
        let points = ideal_points(&[1024]);
        assert_eq!(
            CorrectionTable::from_points(&points, &PitchScale::default(), 0),
            Err(CalibrationError::TooFewPoints(1))
        );
    }

    #[test]
    fn test_non_monotonic_points_rejected() {
        let scale = PitchScale::default();
        let points = vec![
            TunePoint::new(0, 27.5, &scale),
            TunePoint::new(512, 110.0, &scale),
            TunePoint::new(1024, 60.0, &scale),
        ];
        assert_eq!(
            CorrectionTable::from_points(&points, &scale, 0),
            Err(CalibrationError::NonMonotonic { index: 2 })
        );
    }

    #[test]
    fn test_tuning_session_progress() {
        let mut session = TuningSession::new(vec![0, 2048, 4095], PitchScale::default());
        assert_eq!(session.next_code(), Some(0));
        assert!(!session.record(27.5));
        assert_eq!(session.tuning_index(), 1);
        assert_eq!(session.next_code(), Some(2048));
        assert!(!session.record(440.0));
        assert!(session.record(7040.0));
        assert_eq!(session.next_code(), None);
        assert_eq!(session.points().len(), 3);

        session.reset();
        assert_eq!(session.tuning_index(), 0);
        assert!(session.points().is_empty());
    }

    proptest! {
        #[test]
        fn prop_table_saturates_above_last_point(
            codes in proptest::collection::btree_set(0u16..4096, 2..10),
            stretch in 0.8f64..1.2,
            offset in -0.5f64..0.5,
        ) {
            let scale = PitchScale::default();
            let codes: Vec<u16> = codes.into_iter().collect();
            let points: Vec<TunePoint> = codes
                .iter()
                .map(|&c| {
                    let octave = stretch * f64::from(c) / scale.codes_per_octave + offset;
                    TunePoint::new(c, octave_to_frequency(octave, scale.reference), &scale)
                })
                .collect();
            let table = CorrectionTable::from_points(&points, &scale, 0).unwrap();
            prop_assert_eq!(table.as_slice().len(), DAC_CODES);

            let last = points.last().unwrap();
            let start = last.expected_code.max(0.0).ceil() as usize;
            for n in start..DAC_CODES {
                prop_assert_eq!(table.code(n as u16), last.target_code);
            }
        }
    }
}
