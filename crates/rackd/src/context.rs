//! State shared by the daemon's threads

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use rack_core::card::CardManager;
use rack_midi::SharedMidiOutput;

use crate::config::SystemConfig;

/// Cross-thread requests, all lock-free
#[derive(Debug)]
pub struct RuntimeFlags {
    running: AtomicBool,
    dump_stats: AtomicBool,
    tune_requested: AtomicBool,
    tune_in_progress: AtomicBool,
}

impl Default for RuntimeFlags {
    fn default() -> Self {
        Self {
            running: AtomicBool::new(true),
            dump_stats: AtomicBool::new(false),
            tune_requested: AtomicBool::new(false),
            tune_in_progress: AtomicBool::new(false),
        }
    }
}

impl RuntimeFlags {
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn request_shutdown(&self) {
        self.running.store(false, Ordering::Release);
    }

    pub fn request_stats(&self) {
        self.dump_stats.store(true, Ordering::Release);
    }

    pub fn take_stats_request(&self) -> bool {
        self.dump_stats.swap(false, Ordering::AcqRel)
    }

    /// Ask the audio thread for a tuning run
    ///
    /// Returns `false` when one is already pending or running.
    pub fn request_tune(&self) -> bool {
        if self.tune_in_progress.load(Ordering::Acquire) {
            return false;
        }
        !self.tune_requested.swap(true, Ordering::AcqRel)
    }

    /// Claim a pending tune request, marking the run as in progress
    pub fn take_tune_request(&self) -> bool {
        if self.tune_requested.swap(false, Ordering::AcqRel) {
            self.tune_in_progress.store(true, Ordering::Release);
            true
        } else {
            false
        }
    }

    pub fn finish_tune(&self) {
        self.tune_in_progress.store(false, Ordering::Release);
    }

    pub fn tune_in_progress(&self) -> bool {
        self.tune_in_progress.load(Ordering::Acquire)
    }
}

/// Everything the audio and MIDI threads share
#[derive(Clone)]
pub struct AppContext {
    pub flags: Arc<RuntimeFlags>,
    pub cards: Arc<CardManager>,
    pub midi_out: SharedMidiOutput,
    pub system: SystemConfig,
}

impl AppContext {
    pub fn new(cards: CardManager, midi_out: SharedMidiOutput, system: SystemConfig) -> Self {
        Self {
            flags: Arc::new(RuntimeFlags::default()),
            cards: Arc::new(cards),
            midi_out,
            system,
        }
    }
}
