//! Simulated backplane for running the daemon without hardware
//!
//! Slot 0 holds a cv8, slot 1 a vco, slot 2 a cvio. Capture streams produce
//! slow per-channel triangle waves and the edge sampler derives the vco's
//! oscillator frequency from the codes last written to its DAC, so `--dry-run`
//! exercises dispatch and autotune end to end.

use rack_cards::{cv8, cvio, expander, vco};
use rack_core::audio::{CaptureDevice, StreamParams};
use rack_core::bus::{Slot, SLOT_COUNT};
use rack_core::testing::{MockBus, ScriptedCapture, ScriptedSampler};

const CV8_SLOT: Slot = 0;
const VCO_SLOT: Slot = 1;
const CVIO_SLOT: Slot = 2;

/// Output range stored in the simulated cvio ROM, per channel
const CVIO_RANGES: [(f32, f32); cvio::CHANNELS] =
    [(-5.1, 5.05), (-4.95, 5.1), (-5.05, 4.97), (-5.0, 5.0)];

fn cvio_rom() -> Vec<u8> {
    let mut rom = vec![0u8; 0x10];
    rom[0] = cvio::CARD_ID;
    for (min, max) in CVIO_RANGES {
        rom.extend_from_slice(&min.to_le_bytes());
        rom.extend_from_slice(&max.to_le_bytes());
    }
    rom
}

/// Mock bus populated with the simulated cards, keeping no write history
pub fn backplane(rom_base: u8) -> MockBus {
    let mock = MockBus::without_history();
    mock.set_device(rom_base + CV8_SLOT, &[cv8::CARD_ID]);
    mock.set_device(rom_base + VCO_SLOT, &[vco::CARD_ID]);
    mock.set_device(expander::BASE_ADDRESS + VCO_SLOT, &[]);
    // cvio reads its calibration from the same ROM it is discovered by
    if rom_base == cvio::ROM_BASE {
        mock.set_device(rom_base + CVIO_SLOT, &cvio_rom());
    } else {
        mock.set_device(rom_base + CVIO_SLOT, &[cvio::CARD_ID]);
    }
    mock
}

/// Triangle wave in the positive half range, a few seconds per cycle
fn triangle(frame: u64, channel: usize) -> i16 {
    let period = 8000 + 1000 * channel as u64;
    let phase = frame % period;
    let half = period / 2;
    let rising = if phase < half { phase } else { period - phase };
    (rising * i16::MAX as u64 / half) as i16
}

pub fn capture_devices(params: &[StreamParams]) -> Vec<Box<dyn CaptureDevice>> {
    params
        .iter()
        .map(|p| {
            let capture = ScriptedCapture::new(p.channels);
            capture.set_generator(triangle);
            Box::new(capture) as Box<dyn CaptureDevice>
        })
        .collect()
}

/// vco oscillators 3% sharp, everything else silent
pub fn edge_sampler(mock: &MockBus, tune_gpio: [u8; SLOT_COUNT]) -> ScriptedSampler {
    let observer = mock.clone();
    let pin = tune_gpio[usize::from(VCO_SLOT)];
    let expander_address = expander::BASE_ADDRESS + VCO_SLOT;
    ScriptedSampler::new(Box::new(move |p| {
        if p != pin {
            return 0.0;
        }
        let Some(channel) = observer.register(expander_address, 0x03).and_then(vco::tune_channel) else {
            return 0.0;
        };
        let code = observer
            .last_dac_word(VCO_SLOT, channel as u8)
            .map_or(0, |word| word & 0x0FFF);
        27.5 * 2f64.powf(f64::from(code) / 512.0 * 1.03)
    }))
}
