//! MIDI thread: turns parsed events into card calls and replies

use std::io;
use std::process::Command;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use flume::{Receiver, RecvTimeoutError};
use rack_midi::{discovery_report, MidiEvent};

use crate::context::AppContext;

/// How often the thread wakes to check for shutdown
const POLL_INTERVAL: Duration = Duration::from_millis(100);

pub struct MidiDispatcher {
    ctx: AppContext,
}

impl MidiDispatcher {
    pub fn new(ctx: AppContext) -> Self {
        Self { ctx }
    }

    pub fn handle(&self, event: MidiEvent) {
        match event {
            MidiEvent::ProgramChange { channel, program } => {
                let Some(card) = self.ctx.cards.card_in_slot(channel) else {
                    log::debug!("MIDI: program change for empty slot {}", channel);
                    return;
                };
                if let Err(e) = card.driver().process_program_change(program) {
                    log::warn!("MIDI: {} slot {} program {}: {}", card.name, channel, program, e);
                }
            }
            MidiEvent::Channel(message) => {
                let slot = message.channel();
                let Some(card) = self.ctx.cards.card_in_slot(slot) else {
                    return;
                };
                if let Err(e) = card.driver().process_midi(message.as_bytes()) {
                    log::warn!("MIDI: {} slot {}: {}", card.name, slot, e);
                }
            }
            MidiEvent::TuneRequest => {
                if self.ctx.flags.request_tune() {
                    log::info!("MIDI: tune requested");
                } else {
                    log::info!("MIDI: tune already in progress, request ignored");
                }
            }
            MidiEvent::DiscoveryRequest => {
                let report = discovery_report(&self.ctx.cards.report());
                if self.ctx.midi_out.send(&report) {
                    log::debug!("MIDI: discovery report sent");
                }
            }
            MidiEvent::ShutdownRequest => {
                log::info!("MIDI: system shutdown requested");
                run_command(&self.ctx.system.shutdown_command);
                self.ctx.flags.request_shutdown();
            }
            MidiEvent::RestartRequest => {
                log::info!("MIDI: system restart requested");
                run_command(&self.ctx.system.restart_command);
                self.ctx.flags.request_shutdown();
            }
        }
    }

    /// Dispatch events until shutdown or until the input side goes away
    pub fn run(self, events: Receiver<MidiEvent>) {
        while self.ctx.flags.is_running() {
            match events.recv_timeout(POLL_INTERVAL) {
                Ok(event) => self.handle(event),
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => {
                    log::warn!("MIDI: input closed");
                    break;
                }
            }
        }
        log::info!("MIDI: thread stopped");
    }
}

fn run_command(argv: &[String]) {
    let Some((program, args)) = argv.split_first() else {
        log::warn!("MIDI: no system command configured");
        return;
    };
    match Command::new(program).args(args).status() {
        Ok(status) if status.success() => log::info!("MIDI: `{}` done", argv.join(" ")),
        Ok(status) => log::error!("MIDI: `{}` exited with {}", argv.join(" "), status),
        Err(e) => log::error!("MIDI: failed to run `{}`: {}", argv.join(" "), e),
    }
}

pub fn spawn(dispatcher: MidiDispatcher, events: Receiver<MidiEvent>) -> io::Result<JoinHandle<()>> {
    thread::Builder::new()
        .name("rack-midi".into())
        .spawn(move || dispatcher.run(events))
}
