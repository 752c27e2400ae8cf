//! Closed-loop calibration of tunable cards
//!
//! Each tunable card routes an oscillator output to a GPIO pin chosen by its
//! slot. One run looks like this:
//!
//! ```text
//!   save ──► round 1 ──► round 2 ──► ... ──► round N ──► restore
//!              │
//!              ├─ tune_set_point on every pending card
//!              ├─ count edges on the OR of their pins for one window
//!              └─ tune_measurement with each card's frequency
//! ```
//!
//! Rounds continue while any card is still pending, up to `max_rounds`. A
//! window whose timestamps wrapped is thrown away and captured again.

mod counter;

pub use counter::{EdgeSampler, FrequencyCounter, GpioSample, MAX_PINS};

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::bus::{Slot, SLOT_COUNT};
use crate::card::{LoadedCard, Measurement, TuneStatus};

/// Autotune timing parameters
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TuneConfig {
    /// Frequency counting window per round
    pub window_ms: u64,
    /// Rounds before unfinished cards are given up on
    pub max_rounds: u32,
    /// Extra captures allowed per round after a wrapped window
    pub capture_retries: u32,
}

impl Default for TuneConfig {
    fn default() -> Self {
        Self {
            window_ms: 500,
            max_rounds: 32,
            capture_retries: 3,
        }
    }
}

impl TuneConfig {
    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }
}

/// How one card's session ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TuneOutcome {
    /// Driver reported completion; new tables were committed
    Tuned,
    /// Round cap reached first; previous tables kept
    Incomplete,
    /// Save, set point, measurement or restore failed
    Failed,
    /// Card has nothing to tune
    NotTunable,
}

/// Summary of one autotune run
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TuneReport {
    pub outcomes: Vec<(Slot, TuneOutcome)>,
    pub rounds: u32,
    /// Capture windows taken
    pub windows: u32,
    /// Windows discarded because the tick counter wrapped
    pub discarded_windows: u32,
}

impl TuneReport {
    pub fn outcome(&self, slot: Slot) -> Option<TuneOutcome> {
        self.outcomes
            .iter()
            .find(|(s, _)| *s == slot)
            .map(|(_, outcome)| *outcome)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Pending,
    Done,
    Failed,
    NotTunable,
}

struct Session<'a> {
    card: &'a LoadedCard,
    pin: Option<u8>,
    phase: Phase,
}

impl Session<'_> {
    fn fail(&mut self, step: &str, err: impl std::fmt::Display) {
        log::error!(
            "Tune: {} in slot {} failed at {}: {}",
            self.card.name,
            self.card.slot,
            step,
            err
        );
        self.phase = Phase::Failed;
    }

    fn apply(&mut self, step: &str, status: Result<TuneStatus, crate::bus::BusError>) {
        match status {
            Ok(TuneStatus::Continue) => {}
            Ok(TuneStatus::Done) => self.phase = Phase::Done,
            Err(e) => self.fail(step, e),
        }
    }

    fn mask(&self) -> u32 {
        match (self.phase, self.pin) {
            (Phase::Pending, Some(pin)) => 1 << pin,
            _ => 0,
        }
    }
}

/// Runs tuning sessions over the loaded cards
pub struct Autotuner {
    sampler: Box<dyn EdgeSampler>,
    /// Tune pin per slot
    pins: [u8; SLOT_COUNT],
    config: TuneConfig,
}

impl Autotuner {
    pub fn new(sampler: Box<dyn EdgeSampler>, pins: [u8; SLOT_COUNT], config: TuneConfig) -> Self {
        Self {
            sampler,
            pins,
            config,
        }
    }

    pub fn config(&self) -> &TuneConfig {
        &self.config
    }

    /// Tune every card in `cards`
    ///
    /// Blocks for roughly `rounds * window`. Every card is restored at the
    /// end whatever happened during the rounds.
    pub fn run(&mut self, cards: &[Arc<LoadedCard>]) -> TuneReport {
        let mut report = TuneReport::default();
        let mut sessions: Vec<Session<'_>> = cards
            .iter()
            .map(|card| Session {
                card,
                pin: self
                    .pins
                    .get(usize::from(card.slot))
                    .copied()
                    .filter(|&pin| usize::from(pin) < MAX_PINS),
                phase: Phase::Pending,
            })
            .collect();

        log::info!("Tune: starting with {} cards", sessions.len());

        for session in &mut sessions {
            let status = session.card.driver().tune_save_state();
            match status {
                Ok(TuneStatus::Continue) if session.pin.is_none() => {
                    session.fail("save", "no tune pin for slot");
                }
                Ok(TuneStatus::Continue) => {}
                Ok(TuneStatus::Done) => session.phase = Phase::NotTunable,
                Err(e) => session.fail("save", e),
            }
        }

        while report.rounds < self.config.max_rounds
            && sessions.iter().any(|s| s.phase == Phase::Pending)
        {
            report.rounds += 1;
            self.round(&mut sessions, &mut report);
        }

        for session in &mut sessions {
            let completed = session.phase == Phase::Done;
            if let Err(e) = session.card.driver().tune_restore_state(completed) {
                session.fail("restore", e);
            }
            let outcome = match session.phase {
                Phase::Done => TuneOutcome::Tuned,
                Phase::Pending => TuneOutcome::Incomplete,
                Phase::Failed => TuneOutcome::Failed,
                Phase::NotTunable => TuneOutcome::NotTunable,
            };
            if outcome == TuneOutcome::Incomplete {
                log::warn!(
                    "Tune: {} in slot {} not finished after {} rounds, keeping previous tables",
                    session.card.name,
                    session.card.slot,
                    report.rounds
                );
            }
            report.outcomes.push((session.card.slot, outcome));
        }

        log::info!(
            "Tune: finished after {} rounds ({} windows, {} discarded)",
            report.rounds,
            report.windows,
            report.discarded_windows
        );
        report
    }

    fn round(&mut self, sessions: &mut [Session<'_>], report: &mut TuneReport) {
        for session in sessions.iter_mut().filter(|s| s.phase == Phase::Pending) {
            let status = session.card.driver().tune_set_point();
            session.apply("set point", status);
        }

        let mask = sessions.iter().fold(0, |mask, s| mask | s.mask());
        if mask == 0 {
            return;
        }

        let Some(counter) = self.measure(mask, report) else {
            return;
        };
        let elapsed_us = counter.elapsed_micros().unwrap_or(0);

        for session in sessions.iter_mut() {
            let Some(pin) = session.pin.filter(|_| session.phase == Phase::Pending) else {
                continue;
            };
            let measurement = Measurement {
                frequency: counter.frequency(pin),
                transitions: counter.transitions(pin),
                elapsed_us,
            };
            if measurement.transitions == 0 {
                log::warn!(
                    "Tune: no edges on GPIO {} for {} in slot {}",
                    pin,
                    session.card.name,
                    session.card.slot
                );
            }
            let status = session.card.driver().tune_measurement(&measurement);
            session.apply("measurement", status);
        }
    }

    /// Capture one usable window, retrying wrapped ones
    fn measure(&mut self, mask: u32, report: &mut TuneReport) -> Option<FrequencyCounter> {
        for _ in 0..=self.config.capture_retries {
            let mut counter = FrequencyCounter::new(mask);
            report.windows += 1;
            if let Err(e) = self.sampler.capture(mask, self.config.window(), &mut counter) {
                log::error!("Tune: edge capture failed: {}", e);
                return None;
            }
            if !counter.wrapped() {
                return Some(counter);
            }
            report.discarded_windows += 1;
            log::warn!("Tune: tick counter wrapped during window, capturing again");
        }
        log::error!("Tune: no usable window this round");
        None
    }
}
