//! Audio thread: the tick loop plus the work that must pause it
//!
//! Stats dumps and autotune runs are requested through [`RuntimeFlags`] and
//! executed here between ticks, so tuning never races sample dispatch on
//! the streams or the clock.

use std::io;
use std::thread::{self, JoinHandle};

use rack_core::audio::AudioEngine;
use rack_core::autotune::{Autotuner, TuneOutcome};

use crate::config::RealtimeConfig;
use crate::context::AppContext;

pub struct AudioWorker {
    engine: AudioEngine,
    tuner: Option<Autotuner>,
    ctx: AppContext,
}

impl AudioWorker {
    pub fn new(engine: AudioEngine, tuner: Option<Autotuner>, ctx: AppContext) -> Self {
        Self { engine, tuner, ctx }
    }

    /// Handle pending requests, then run one tick
    pub fn step(&mut self) {
        if self.ctx.flags.take_stats_request() {
            self.engine.stats().log_summary();
        }
        if self.ctx.flags.take_tune_request() {
            self.autotune();
            self.ctx.flags.finish_tune();
        }
        self.engine.tick();
    }

    fn autotune(&mut self) {
        let Some(tuner) = self.tuner.as_mut() else {
            log::warn!("Tune: no edge sampler available, request ignored");
            return;
        };

        let report = tuner.run(self.ctx.cards.cards());
        for (slot, outcome) in &report.outcomes {
            match outcome {
                TuneOutcome::Tuned => log::info!("Tune: slot {} tuned", slot),
                TuneOutcome::Failed => {
                    log::error!("Tune: slot {} failed, using linear tables", slot)
                }
                TuneOutcome::Incomplete | TuneOutcome::NotTunable => {}
            }
        }
        self.engine.resync();
    }

    /// Tick until shutdown is requested
    pub fn run(mut self) {
        log::info!(
            "Audio: dispatching to {} cards on {} streams",
            self.engine.dispatched_cards(),
            self.engine.stream_count()
        );
        while self.ctx.flags.is_running() {
            self.step();
        }
        self.engine.stats().log_summary();
        log::info!("Audio: thread stopped");
    }

    pub fn engine(&self) -> &AudioEngine {
        &self.engine
    }
}

/// Start the audio thread, promoting it to real-time first
pub fn spawn(worker: AudioWorker, realtime: RealtimeConfig) -> io::Result<JoinHandle<()>> {
    thread::Builder::new()
        .name("rack-audio".into())
        .spawn(move || {
            crate::rt::promote_current_thread(&realtime);
            worker.run();
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rack_cards::cv8;
    use rack_core::audio::{open_streams, CaptureDevice, StreamParams};
    use rack_core::autotune::TuneConfig;
    use rack_core::bus::SharedBus;
    use rack_core::card::{discover_cards, load_drivers, CardManager};
    use rack_core::testing::{MockBus, ScriptedCapture, ScriptedClock, ScriptedSampler};
    use rack_midi::SharedMidiOutput;
    use std::collections::HashMap;

    use crate::config::SystemConfig;

    const ROM_BASE: u8 = 0x50;

    struct Rig {
        mock: MockBus,
        clock: ScriptedClock,
        capture: ScriptedCapture,
        worker: AudioWorker,
    }

    fn rig(with_tuner: bool) -> Rig {
        let mock = MockBus::new();
        mock.set_device(ROM_BASE, &[cv8::CARD_ID]);
        let bus = SharedBus::new(mock.host());
        let ids = discover_cards(&bus, ROM_BASE);
        let cards = CardManager::assemble(load_drivers(&ids, &bus, rack_cards::KNOWN_CARDS), &[8])
            .unwrap();

        let capture = ScriptedCapture::new(8);
        let params = StreamParams {
            channels: 8,
            ..StreamParams::default()
        };
        let devices: Vec<Box<dyn CaptureDevice>> = vec![Box::new(capture.clone())];
        let streams = open_streams(devices, &[params]).unwrap();
        let clock = ScriptedClock::new();
        let engine = AudioEngine::new(streams, Box::new(clock.clone()), &cards);

        let tuner = with_tuner.then(|| {
            Autotuner::new(
                Box::new(ScriptedSampler::constant(HashMap::new())),
                [4, 5, 6, 7, 8, 9, 10, 11],
                TuneConfig::default(),
            )
        });
        let ctx = AppContext::new(cards, SharedMidiOutput::disconnected(), SystemConfig::default());
        Rig {
            mock,
            clock,
            capture,
            worker: AudioWorker::new(engine, tuner, ctx),
        }
    }

    #[test]
    fn test_steps_drive_samples_to_the_card() {
        let mut rig = rig(false);
        rig.mock.clear_spi_writes();
        for _ in 0..64 {
            rig.worker.step();
        }
        assert_eq!(rig.worker.engine().stats().ticks, 64);
        assert!(rig.capture.committed() > 0);
        assert!(!rig.mock.spi_writes_for_slot(0).is_empty());
    }

    #[test]
    fn test_tune_request_resyncs_and_clears_flag() {
        let mut rig = rig(true);
        let flags = rig.worker.ctx.flags.clone();
        assert!(flags.request_tune());

        rig.worker.step();
        assert!(!flags.tune_in_progress());
        assert!(rig.clock.rearms() >= 1);
        assert!(flags.request_tune());
    }

    #[test]
    fn test_tune_without_sampler_still_clears_flag() {
        let mut rig = rig(false);
        let flags = rig.worker.ctx.flags.clone();
        flags.request_tune();
        let rearms = rig.clock.rearms();

        rig.worker.step();
        assert!(!flags.tune_in_progress());
        assert_eq!(rig.clock.rearms(), rearms);
    }

    #[test]
    fn test_run_returns_after_shutdown() {
        let rig = rig(false);
        rig.worker.ctx.flags.request_shutdown();
        rig.worker.run();
    }
}
