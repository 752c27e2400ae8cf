//! Per-sample dispatch engine
//!
//! One [`AudioEngine::tick`] presents one frame per stream to every card and
//! then sleeps until the next sample deadline:
//!
//! 1. drive each stream towards `Running`
//! 2. open a capture window where the previous one is used up
//! 3. call `process_samples` on every card in update order
//! 4. wait on the sample clock, learning how many periods elapsed
//! 5. advance every stream cursor by that many frames
//! 6. record timing statistics
//!
//! All cards on a stream see the same frame within a tick, and frame N is
//! delivered to every card before frame N+1 is fetched.

use std::sync::Arc;
use std::time::Instant;

use super::stats::LogThrottle;
use super::{SampleClock, Stream, StreamState, TickStats};
use crate::card::{CardManager, LoadedCard};

struct Dispatch {
    card: Arc<LoadedCard>,
    errors: LogThrottle,
}

pub struct AudioEngine {
    streams: Vec<Stream>,
    clock: Box<dyn SampleClock>,
    dispatch: Vec<Dispatch>,
    clock_errors: LogThrottle,
    stats: TickStats,
}

impl AudioEngine {
    /// Build an engine over opened streams and the loaded cards
    ///
    /// Cards assigned to a stream that does not exist are left out.
    pub fn new(streams: Vec<Stream>, clock: Box<dyn SampleClock>, cards: &CardManager) -> Self {
        let dispatch = cards
            .cards()
            .iter()
            .filter(|card| {
                let fits = streams.get(card.assignment.stream).map_or(false, |stream| {
                    card.channels().end <= stream.params().channels
                });
                if !fits {
                    log::error!(
                        "Audio: {} in slot {} has no room on stream {}, not dispatched",
                        card.name,
                        card.slot,
                        card.assignment.stream
                    );
                }
                fits
            })
            .map(|card| Dispatch {
                card: Arc::clone(card),
                errors: LogThrottle::default(),
            })
            .collect();

        Self {
            streams,
            clock,
            dispatch,
            clock_errors: LogThrottle::default(),
            stats: TickStats::default(),
        }
    }

    /// Run one sample period
    pub fn tick(&mut self) {
        for stream in &mut self.streams {
            // Failures are logged by the stream and retried next tick
            let _ = stream.ensure_running(&mut self.stats);
        }

        for stream in &mut self.streams {
            if !stream.ensure_window(&mut self.stats) {
                self.stats.starved_ticks += 1;
            }
        }

        for entry in &mut self.dispatch {
            let card = &entry.card;
            let Some(frame) = self.streams[card.assignment.stream].frame() else {
                continue;
            };
            let Some(samples) = frame.get(card.channels()) else {
                continue;
            };
            if let Err(e) = card.driver().process_samples(samples) {
                self.stats.card_errors += 1;
                if let Some(suppressed) = entry.errors.allow() {
                    log::error!(
                        "Audio: {} in slot {} write failed: {} ({} more since last report)",
                        card.name,
                        card.slot,
                        e,
                        suppressed
                    );
                }
            }
        }

        let idle_start = Instant::now();
        let expirations = match self.clock.wait() {
            Ok(n) => n,
            Err(e) => {
                if let Some(suppressed) = self.clock_errors.allow() {
                    log::error!(
                        "Audio: sample clock read failed: {} ({} more since last report)",
                        e,
                        suppressed
                    );
                }
                1
            }
        };
        self.stats.idle += idle_start.elapsed();

        let frames = usize::try_from(expirations).unwrap_or(usize::MAX);
        for stream in &mut self.streams {
            stream.advance(frames, &mut self.stats);
        }
        self.stats.record_expirations(expirations);
    }

    /// Restart streams and clock after a long synchronous pause
    ///
    /// Tuning blocks the tick loop for seconds; the capture rings overflow and
    /// the clock builds a backlog. Both are reset here instead of being
    /// handled as an xrun.
    pub fn resync(&mut self) {
        for stream in &mut self.streams {
            if let Err(e) = stream.restart() {
                log::error!("Audio: {} restart failed: {}", stream.name(), e);
            }
        }
        if let Err(e) = self.clock.rearm() {
            log::error!("Audio: sample clock rearm failed: {}", e);
        }
        log::info!("Audio: streams resynchronised");
    }

    pub fn stats(&self) -> &TickStats {
        &self.stats
    }

    pub fn stream_state(&self, index: usize) -> Option<StreamState> {
        self.streams.get(index).map(Stream::state)
    }

    pub fn stream_count(&self) -> usize {
        self.streams.len()
    }

    /// Number of cards receiving samples
    pub fn dispatched_cards(&self) -> usize {
        self.dispatch.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::StreamParams;
    use crate::bus::{BusError, SpiMode};
    use crate::card::{CardDriver, CardProperties, DetectedCard};
    use crate::testing::{ScriptedCapture, ScriptedClock};
    use std::sync::Mutex;

    type Log = Arc<Mutex<Vec<(u8, Vec<i16>)>>>;

    struct RecordingCard {
        slot: u8,
        channels: usize,
        log: Log,
        fail: bool,
    }

    impl CardDriver for RecordingCard {
        fn properties(&self) -> CardProperties {
            CardProperties {
                channel_count: self.channels,
                spi_mode: SpiMode::Mode0,
            }
        }
        fn process_samples(&mut self, samples: &[i16]) -> Result<(), BusError> {
            self.log.lock().unwrap().push((self.slot, samples.to_vec()));
            if self.fail {
                return Err(BusError::NotOpen(0));
            }
            Ok(())
        }
        fn process_program_change(&mut self, _program: u8) -> Result<(), BusError> {
            Ok(())
        }
    }

    fn detected(slot: u8, channels: usize, log: &Log, fail: bool) -> DetectedCard {
        let driver = RecordingCard {
            slot,
            channels,
            log: Arc::clone(log),
            fail,
        };
        DetectedCard {
            slot,
            card_id: 1,
            name: "recorder",
            properties: driver.properties(),
            driver: Box::new(driver),
        }
    }

    fn stream(capture: &ScriptedCapture, channels: usize) -> Stream {
        let params = StreamParams {
            period_size: 4,
            channels,
            ..StreamParams::default()
        };
        Stream::new(Box::new(capture.clone()), params)
    }

    #[test]
    fn test_cards_share_frame_within_tick() {
        let log: Log = Arc::default();
        let capture = ScriptedCapture::new(8);
        let manager = CardManager::assemble(
            vec![detected(0, 4, &log, false), detected(1, 2, &log, false)],
            &[8],
        )
        .unwrap();
        let clock = ScriptedClock::new();
        let mut engine = AudioEngine::new(
            vec![stream(&capture, 8)],
            Box::new(clock.clone()),
            &manager,
        );

        engine.tick();
        engine.tick();

        let log = log.lock().unwrap();
        assert_eq!(log.len(), 4);
        // Slot 0 gets channels 0..4, slot 1 channels 4..6, same frame
        assert_eq!(log[0], (0, vec![0, 1000, 2000, 3000]));
        assert_eq!(log[1], (1, vec![4000, 5000]));
        assert_eq!(log[2], (0, vec![1, 1001, 2001, 3001]));
        assert_eq!(log[3], (1, vec![4001, 5001]));
        assert_eq!(engine.stats().ticks, 2);
        assert_eq!(engine.stats().on_time, 2);
        assert_eq!(clock.waits(), 2);
    }

    #[test]
    fn test_card_error_does_not_stop_others() {
        let log: Log = Arc::default();
        let capture = ScriptedCapture::new(4);
        let manager = CardManager::assemble(
            vec![detected(0, 2, &log, true), detected(1, 2, &log, false)],
            &[4],
        )
        .unwrap();
        let mut engine = AudioEngine::new(
            vec![stream(&capture, 4)],
            Box::new(ScriptedClock::new()),
            &manager,
        );

        for _ in 0..3 {
            engine.tick();
        }
        assert_eq!(engine.stats().card_errors, 3);
        let log = log.lock().unwrap();
        assert_eq!(log.iter().filter(|(slot, _)| *slot == 1).count(), 3);
    }

    #[test]
    fn test_missed_deadlines_advance_cursor() {
        let log: Log = Arc::default();
        let capture = ScriptedCapture::new(2);
        let manager = CardManager::assemble(vec![detected(0, 2, &log, false)], &[2]).unwrap();
        let clock = ScriptedClock::new();
        clock.push(&[1, 3, 1, 12]);
        let mut engine = AudioEngine::new(
            vec![stream(&capture, 2)],
            Box::new(clock.clone()),
            &manager,
        );

        for _ in 0..5 {
            engine.tick();
        }

        let frames: Vec<i16> = log.lock().unwrap().iter().map(|(_, s)| s[0]).collect();
        assert_eq!(frames, vec![0, 1, 4, 5, 17]);
        let stats = engine.stats();
        assert_eq!(stats.on_time, 3);
        assert_eq!(stats.missed_few, 1);
        assert_eq!(stats.missed_many, 1);
    }

    #[test]
    fn test_xrun_round_trip_through_engine() {
        let log: Log = Arc::default();
        let capture = ScriptedCapture::new(2);
        let manager = CardManager::assemble(vec![detected(0, 2, &log, false)], &[2]).unwrap();
        let mut engine = AudioEngine::new(
            vec![stream(&capture, 2)],
            Box::new(ScriptedClock::new()),
            &manager,
        );

        for _ in 0..4 {
            engine.tick();
        }
        capture.fail_next_begin(crate::audio::StreamError::Xrun);
        for _ in 0..4 {
            engine.tick();
        }

        let frames: Vec<i16> = log.lock().unwrap().iter().map(|(_, s)| s[0]).collect();
        assert_eq!(frames, (0..8).collect::<Vec<i16>>());
        assert_eq!(engine.stats().xruns, 1);
        assert_eq!(engine.stream_state(0), Some(StreamState::Running));
    }

    #[test]
    fn test_resync_rearms_clock() {
        let log: Log = Arc::default();
        let capture = ScriptedCapture::new(2);
        let manager = CardManager::assemble(vec![detected(0, 2, &log, false)], &[2]).unwrap();
        let clock = ScriptedClock::new();
        let mut engine = AudioEngine::new(
            vec![stream(&capture, 2)],
            Box::new(clock.clone()),
            &manager,
        );
        engine.tick();
        engine.resync();
        assert_eq!(clock.rearms(), 1);
        assert_eq!(engine.stream_state(0), Some(StreamState::Running));
        assert_eq!(capture.prepares(), 2);
    }

    #[test]
    fn test_card_without_room_is_not_dispatched() {
        let log: Log = Arc::default();
        let capture = ScriptedCapture::new(2);
        let manager = CardManager::assemble(vec![detected(0, 4, &log, false)], &[4]).unwrap();
        let engine = AudioEngine::new(
            vec![stream(&capture, 2)],
            Box::new(ScriptedClock::new()),
            &manager,
        );
        assert_eq!(engine.dispatched_cards(), 0);
    }
}
