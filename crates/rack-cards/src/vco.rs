//! Dual-VCO voice card
//!
//! ```text
//!  ch 0  pitch A ──► DAC addr 0 ──► correction table A
//!  ch 1  pitch B ──► DAC addr 1 ──► correction table B
//!  ch 2  PW A    ──► DAC addr 2
//!  ch 3  PW B    ──► DAC addr 3
//!
//!  PCA9555 port 0: [7] mute  [5] sub A  [4] sync  [3:2] wave B  [1:0] wave A
//!  PCA9555 port 1: [1:0] tune route (0 off, 1 osc A, 2 osc B)
//! ```
//!
//! Both pitch channels are tuned one after the other through the single
//! tune output of the slot.

use rack_core::bus::{BusError, BusResult, SharedBus, Slot, SpiMode};
use rack_core::calibration::{
    default_test_codes, pack_dac_word, sample_to_code, CorrectionTable, PitchScale, TuningSession,
};
use rack_core::card::{
    dac_frame, CardDriver, CardError, CardProperties, ChannelMemo, DacPort, Measurement,
    TuneStatus,
};

use crate::expander::{Pca9555, PortOp, BASE_ADDRESS};

pub const CARD_ID: u8 = 0x06;
pub const CHANNELS: usize = 4;
pub const PITCH_CHANNELS: usize = 2;

const PROPERTIES: CardProperties = CardProperties {
    channel_count: CHANNELS,
    spi_mode: SpiMode::Mode0,
};

const MUTE: u8 = 0x80;
const ROUTE_MASK: u8 = 0x03;
const ROUTE_OFF: u8 = 0x00;
const ROUTE_A: u8 = 0x01;
const ROUTE_B: u8 = 0x02;

/// Expander state after init: outputs muted, tune output off
const INITIAL_PORT: [u8; 2] = [MUTE, ROUTE_OFF];

/// Program change N applies `PROGRAMS[N]`
static PROGRAMS: &[PortOp] = &[
    // 0-3: oscillator A waveform (saw, square, triangle, sine)
    PortOp::new(0, 0x03, 0x00),
    PortOp::new(0, 0x03, 0x01),
    PortOp::new(0, 0x03, 0x02),
    PortOp::new(0, 0x03, 0x03),
    // 4-7: oscillator B waveform
    PortOp::new(0, 0x0C, 0x00),
    PortOp::new(0, 0x0C, 0x04),
    PortOp::new(0, 0x0C, 0x08),
    PortOp::new(0, 0x0C, 0x0C),
    // 8-9: hard sync B to A
    PortOp::new(0, 0x10, 0x10),
    PortOp::new(0, 0x10, 0x00),
    // 10-11: output unmute / mute
    PortOp::new(0, MUTE, 0x00),
    PortOp::new(0, MUTE, MUTE),
    // 12-13: sub-oscillator on A
    PortOp::new(0, 0x20, 0x20),
    PortOp::new(0, 0x20, 0x00),
    // 14-15: B one octave down
    PortOp::new(1, 0x08, 0x08),
    PortOp::new(1, 0x08, 0x00),
];

/// Pitch channel routed to the tune output by expander port 1, if any
pub fn tune_channel(port1: u8) -> Option<usize> {
    match port1 & ROUTE_MASK {
        ROUTE_A => Some(0),
        ROUTE_B => Some(1),
        _ => None,
    }
}

fn route_op(route: u8) -> PortOp {
    PortOp::new(1, ROUTE_MASK, route)
}

fn linear_tables() -> [CorrectionTable; PITCH_CHANNELS] {
    std::array::from_fn(|ch| CorrectionTable::linear(ch as u8))
}

struct Tuning {
    saved_port: [u8; 2],
    sessions: [TuningSession; PITCH_CHANNELS],
    /// Pitch channel being measured
    channel: usize,
    /// An expander write failed at some point during the run
    failed: bool,
}

impl Tuning {
    fn new(saved_port: [u8; 2]) -> Self {
        Self {
            saved_port,
            sessions: std::array::from_fn(|_| {
                TuningSession::new(default_test_codes(), PitchScale::default())
            }),
            channel: 0,
            failed: false,
        }
    }
}

pub struct VcoCard {
    bus: SharedBus,
    port: DacPort,
    memo: ChannelMemo,
    expander: Pca9555,
    tables: [CorrectionTable; PITCH_CHANNELS],
    tuning: Option<Tuning>,
}

impl VcoCard {
    pub fn new(bus: SharedBus, slot: Slot) -> Result<Self, CardError> {
        let mut card = Self {
            bus,
            port: DacPort {
                slot,
                chip_select: 0,
                mode: PROPERTIES.spi_mode,
            },
            memo: ChannelMemo::new(CHANNELS),
            expander: Pca9555::new(BASE_ADDRESS + slot, INITIAL_PORT),
            tables: linear_tables(),
            tuning: None,
        };
        {
            let mut bus = card.bus.lock();
            card.expander.init(&mut bus)?;
        }
        card.process_samples(&[0; CHANNELS])?;
        Ok(card)
    }

    /// Shadow of the expander output ports
    pub fn pca9555_port(&self) -> [u8; 2] {
        self.expander.port()
    }

    pub fn pitch_table(&self, channel: usize) -> Option<&CorrectionTable> {
        self.tables.get(channel)
    }

    fn write_raw(&mut self, channel: usize, code: u16) -> BusResult<()> {
        let word = pack_dac_word(channel as u8, code);
        let mut bus = self.bus.lock();
        bus.select_slot(self.port.slot)?;
        bus.configure_spi(self.port.chip_select, self.port.mode)?;
        bus.spi_write(self.port.chip_select, &dac_frame(word))
    }
}

impl CardDriver for VcoCard {
    fn properties(&self) -> CardProperties {
        PROPERTIES
    }

    fn process_samples(&mut self, samples: &[i16]) -> Result<(), BusError> {
        let tables = &self.tables;
        let words = samples.iter().take(CHANNELS).enumerate().map(|(ch, &s)| {
            let code = sample_to_code(s);
            let word = match tables.get(ch) {
                Some(table) => table.lookup(code),
                None => pack_dac_word(ch as u8, code),
            };
            (ch, word)
        });
        let mut bus = self.bus.lock();
        self.port.write_changed(&mut bus, &mut self.memo, words)?;
        Ok(())
    }

    fn process_program_change(&mut self, program: u8) -> Result<(), BusError> {
        let Some(op) = PROGRAMS.get(usize::from(program)) else {
            log::warn!(
                "Cards: vco in slot {} has no program {}, ignoring",
                self.port.slot,
                program
            );
            return Ok(());
        };
        let mut bus = self.bus.lock();
        self.expander.update(&mut bus, *op)
    }

    fn tune_save_state(&mut self) -> Result<TuneStatus, BusError> {
        let mut tuning = Tuning::new(self.expander.port());
        let routed = {
            let mut bus = self.bus.lock();
            self.expander.update(&mut bus, route_op(ROUTE_A))
        };
        tuning.failed = routed.is_err();
        self.tuning = Some(tuning);
        routed.map(|()| TuneStatus::Continue)
    }

    fn tune_set_point(&mut self) -> Result<TuneStatus, BusError> {
        let Some(tuning) = self.tuning.as_ref() else {
            return Ok(TuneStatus::Done);
        };
        let channel = tuning.channel;
        let Some(code) = tuning.sessions.get(channel).and_then(TuningSession::next_code) else {
            return Ok(TuneStatus::Done);
        };
        self.write_raw(channel, code)?;
        Ok(TuneStatus::Continue)
    }

    fn tune_measurement(&mut self, measurement: &Measurement) -> Result<TuneStatus, BusError> {
        let Some(tuning) = self.tuning.as_mut() else {
            return Ok(TuneStatus::Done);
        };
        let Some(session) = tuning.sessions.get_mut(tuning.channel) else {
            return Ok(TuneStatus::Done);
        };
        log::debug!(
            "Tune: vco slot {} osc {} code {:?} → {:.2} Hz",
            self.port.slot,
            tuning.channel,
            session.next_code(),
            measurement.frequency
        );
        if !session.record(measurement.frequency) {
            return Ok(TuneStatus::Continue);
        }

        tuning.channel += 1;
        let route = match tuning.channel {
            1 => ROUTE_B,
            _ => ROUTE_OFF,
        };
        let routed = {
            let mut bus = self.bus.lock();
            self.expander.update(&mut bus, route_op(route))
        };
        if routed.is_err() {
            tuning.failed = true;
        }
        routed?;

        if tuning.channel >= PITCH_CHANNELS {
            Ok(TuneStatus::Done)
        } else {
            Ok(TuneStatus::Continue)
        }
    }

    fn tune_restore_state(&mut self, completed: bool) -> Result<(), BusError> {
        let Some(tuning) = self.tuning.take() else {
            return Ok(());
        };
        // Only the tune route goes back; program changes made meanwhile stay
        let restored = {
            let mut bus = self.bus.lock();
            self.expander
                .update(&mut bus, route_op(tuning.saved_port[1] & ROUTE_MASK))
        };
        // Pitch outputs hold calibration codes; resend everything next frame
        self.memo.invalidate();

        if tuning.failed || restored.is_err() {
            log::warn!(
                "Cards: vco in slot {} tuning failed, using linear pitch tables",
                self.port.slot
            );
            self.tables = linear_tables();
        } else if completed {
            for (ch, session) in tuning.sessions.iter().enumerate() {
                self.tables[ch] = match session.build_table(ch as u8) {
                    Ok(table) => table,
                    Err(e) => {
                        log::warn!(
                            "Cards: vco in slot {} osc {} table rejected ({}), using linear",
                            self.port.slot,
                            ch,
                            e
                        );
                        CorrectionTable::linear(ch as u8)
                    }
                };
            }
            log::info!("Cards: vco in slot {} tuned", self.port.slot);
        }
        restored
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rack_core::autotune::{Autotuner, TuneConfig, TuneOutcome};
    use rack_core::card::{CardManager, DetectedCard};
    use rack_core::testing::{MockBus, ScriptedSampler};
    use std::sync::{Arc, Mutex};
    use std::thread;

    const PINS: [u8; 8] = [4, 5, 6, 7, 8, 9, 10, 11];

    fn setup(slot: Slot) -> (MockBus, VcoCard) {
        let mock = MockBus::new();
        mock.set_device(BASE_ADDRESS + slot, &[]);
        let card = VcoCard::new(SharedBus::new(mock.host()), slot).unwrap();
        (mock, card)
    }

    fn detected(slot: Slot, card: VcoCard) -> DetectedCard {
        DetectedCard {
            slot,
            card_id: CARD_ID,
            name: "vco",
            properties: card.properties(),
            driver: Box::new(card),
        }
    }

    /// Oscillator 10% flat per octave, routed by the expander's tune bits
    fn flat_oscillator(mock: &MockBus, slot: Slot) -> ScriptedSampler {
        let observer = mock.clone();
        let pin = PINS[usize::from(slot)];
        ScriptedSampler::new(Box::new(move |p| {
            if p != pin {
                return 0.0;
            }
            let port1 = observer.register(BASE_ADDRESS + slot, 0x03).unwrap_or(0);
            let Some(channel) = tune_channel(port1) else {
                return 0.0;
            };
            let code = observer.last_dac_word(slot, channel as u8).map_or(0, |w| w & 0x0FFF);
            27.5 * 2f64.powf(f64::from(code) / 512.0 * 0.9)
        }))
    }

    #[test]
    fn test_init_mutes_and_configures_outputs() {
        let (mock, card) = setup(3);
        assert_eq!(card.pca9555_port(), INITIAL_PORT);
        assert_eq!(mock.register(0x23, 0x02), Some(MUTE));
        assert_eq!(mock.register(0x23, 0x06), Some(0x00));
        assert_eq!(mock.register(0x23, 0x07), Some(0x00));
        assert_eq!(mock.spi_writes_for_slot(3).len(), CHANNELS);
    }

    #[test]
    fn test_missing_expander_fails_init() {
        let mock = MockBus::new();
        assert!(VcoCard::new(SharedBus::new(mock.host()), 0).is_err());
    }

    #[test]
    fn test_program_change_updates_port() {
        let (mock, mut card) = setup(0);
        card.process_program_change(10).unwrap();
        card.process_program_change(2).unwrap();
        card.process_program_change(7).unwrap();
        assert_eq!(card.pca9555_port(), [0x0E, 0x00]);
        assert_eq!(mock.register(0x20, 0x02), Some(0x0E));

        let writes = mock.i2c_writes(0x20).len();
        card.process_program_change(100).unwrap();
        assert_eq!(mock.i2c_writes(0x20).len(), writes);
    }

    #[test]
    fn test_concurrent_midi_and_audio_keep_port_shadow() {
        let (mock, card) = setup(1);
        let card = Arc::new(Mutex::new(card));
        let programs: Vec<u8> = (0..5000u32).map(|i| ((i * 7) % 16) as u8).collect();

        let audio = {
            let card = Arc::clone(&card);
            thread::spawn(move || {
                for i in 0..5000i16 {
                    let frame = [i, i.wrapping_mul(3), -i, i / 2];
                    card.lock().unwrap().process_samples(&frame).unwrap();
                }
            })
        };
        let midi = {
            let card = Arc::clone(&card);
            let programs = programs.clone();
            thread::spawn(move || {
                for program in programs {
                    card.lock().unwrap().process_program_change(program).unwrap();
                }
            })
        };
        audio.join().unwrap();
        midi.join().unwrap();

        let expected = programs.iter().fold(INITIAL_PORT, |mut port, &p| {
            let op = PROGRAMS[usize::from(p)];
            port[usize::from(op.port)] = op.apply(port[usize::from(op.port)]);
            port
        });
        let card = card.lock().unwrap();
        assert_eq!(card.pca9555_port(), expected);
        assert_eq!(mock.register(0x21, 0x02), Some(expected[0]));
        assert_eq!(mock.register(0x21, 0x03), Some(expected[1]));
    }

    #[test]
    fn test_autotune_builds_correcting_tables() {
        let slot = 2;
        let (mock, mut card) = setup(slot);
        card.process_program_change(12).unwrap();
        let port_before = card.pca9555_port();

        let sampler = flat_oscillator(&mock, slot);
        let manager = CardManager::assemble(vec![detected(slot, card)], &[8]).unwrap();
        let mut tuner = Autotuner::new(Box::new(sampler), PINS, TuneConfig::default());
        let report = tuner.run(manager.cards());

        assert_eq!(report.outcome(slot), Some(TuneOutcome::Tuned));
        assert_eq!(report.rounds, 2 * default_test_codes().len() as u32);
        assert_eq!(mock.register(0x22, 0x02), Some(port_before[0]));
        assert_eq!(mock.register(0x22, 0x03), Some(port_before[1]));

        // Code 1024 on a 10% flat stage lands near 1138 once corrected
        let card = &manager.cards()[0];
        card.driver().process_samples(&[1024 << 3, 1024 << 3, 0, 0]).unwrap();
        for channel in 0..PITCH_CHANNELS as u8 {
            let code = mock.last_dac_word(slot, channel).unwrap() & 0x0FFF;
            assert!((1100..=1180).contains(&code), "osc {} got {}", channel, code);
        }
    }

    #[test]
    fn test_program_change_during_tuning_survives_restore() {
        let slot = 5;
        let (mock, mut card) = setup(slot);
        card.tune_save_state().unwrap();
        assert_eq!(card.pca9555_port(), [MUTE, ROUTE_A]);

        // Unmute and drop B an octave while osc A is routed out
        card.process_program_change(10).unwrap();
        card.process_program_change(14).unwrap();
        card.tune_restore_state(false).unwrap();

        assert_eq!(card.pca9555_port(), [0x00, 0x08 | ROUTE_OFF]);
        assert_eq!(mock.register(0x25, 0x02), Some(0x00));
        assert_eq!(mock.register(0x25, 0x03), Some(0x08));
    }

    #[test]
    fn test_failed_capture_run_keeps_previous_tables() {
        let slot = 6;
        let (mock, card) = setup(slot);
        let manager = CardManager::assemble(vec![detected(slot, card)], &[8]).unwrap();
        let mut tuner =
            Autotuner::new(Box::new(flat_oscillator(&mock, slot)), PINS, TuneConfig::default());
        assert_eq!(tuner.run(manager.cards()).outcome(slot), Some(TuneOutcome::Tuned));

        let config = TuneConfig {
            max_rounds: 3,
            ..TuneConfig::default()
        };
        let sampler = flat_oscillator(&mock, slot).fail_next(u32::MAX);
        let mut tuner = Autotuner::new(Box::new(sampler), PINS, config);
        let report = tuner.run(manager.cards());
        assert_eq!(report.outcome(slot), Some(TuneOutcome::Incomplete));
        assert_eq!(report.windows, 3);
        assert_eq!(mock.register(BASE_ADDRESS + slot, 0x03), Some(ROUTE_OFF));

        // Still corrected by the tables from the first run
        let card = &manager.cards()[0];
        card.driver().process_samples(&[1024 << 3, 1024 << 3, 0, 0]).unwrap();
        for channel in 0..PITCH_CHANNELS as u8 {
            let code = mock.last_dac_word(slot, channel).unwrap() & 0x0FFF;
            assert!((1100..=1180).contains(&code), "osc {} got {}", channel, code);
        }
    }

    #[test]
    fn test_failed_save_falls_back_to_linear() {
        let slot = 4;
        let (mock, mut card) = setup(slot);
        mock.fail_i2c(true);
        assert!(card.tune_save_state().is_err());
        mock.fail_i2c(false);
        card.tune_restore_state(false).unwrap();

        assert_eq!(card.pitch_table(0), Some(&CorrectionTable::linear(0)));
        assert_eq!(card.pitch_table(1), Some(&CorrectionTable::linear(1)));
        assert_eq!(card.pca9555_port(), INITIAL_PORT);
    }

    #[test]
    fn test_incomplete_run_keeps_previous_tables() {
        let slot = 0;
        let (_mock, mut card) = setup(slot);
        card.tune_save_state().unwrap();
        card.tune_set_point().unwrap();
        card.tune_measurement(&Measurement {
            frequency: 30.0,
            transitions: 15,
            elapsed_us: 500_000,
        })
        .unwrap();
        card.tune_restore_state(false).unwrap();
        assert_eq!(card.pitch_table(0), Some(&CorrectionTable::linear(0)));
        assert_eq!(card.pca9555_port(), INITIAL_PORT);
    }
}
