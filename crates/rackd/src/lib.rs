//! rackd - backplane daemon
//!
//! Startup order:
//!
//! 1. load the YAML configuration
//! 2. open the bus (or the simulated backplane with `--dry-run`)
//! 3. discover cards and load their drivers
//! 4. open the capture streams and pack cards onto them
//! 5. open the sample clock, the tune sampler and the MIDI ports
//! 6. run the audio and MIDI threads until a signal or a system request
//!
//! Faults in steps 1-4 and the sample clock abort startup. A missing tune
//! sampler disables autotune; missing MIDI ports leave the daemon running
//! without remote control.

pub mod audio_thread;
pub mod config;
pub mod context;
pub mod dry_run;
pub mod midi_thread;
pub mod rt;
pub mod signals;

use std::path::PathBuf;

/// Command line options
#[derive(Debug, Clone)]
pub struct Options {
    pub config_path: PathBuf,
    /// Simulated backplane and capture instead of hardware
    pub dry_run: bool,
    /// Print capture devices and MIDI ports, then exit
    pub list_devices: bool,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            config_path: config::default_config_path(),
            dry_run: false,
            list_devices: false,
        }
    }
}

pub fn list_devices() {
    println!("Capture devices:");
    for name in rack_core::audio::list_capture_devices() {
        println!("  {}", name);
    }
    match rack_midi::list_input_ports() {
        Ok(ports) => {
            println!("MIDI inputs:");
            for port in ports {
                println!("  {}", port);
            }
        }
        Err(e) => println!("MIDI inputs unavailable: {}", e),
    }
    match rack_midi::list_output_ports() {
        Ok(ports) => {
            println!("MIDI outputs:");
            for port in ports {
                println!("  {}", port);
            }
        }
        Err(e) => println!("MIDI outputs unavailable: {}", e),
    }
}

#[cfg(target_os = "linux")]
pub use daemon::run;

#[cfg(not(target_os = "linux"))]
pub fn run(options: &Options) -> anyhow::Result<()> {
    if options.list_devices {
        list_devices();
        return Ok(());
    }
    anyhow::bail!("rackd drives Linux spidev, i2c-dev and timerfd; this platform is not supported")
}

#[cfg(target_os = "linux")]
mod daemon {
    use std::thread;
    use std::time::Duration;

    use anyhow::{anyhow, Context};
    use rack_core::audio::{open_streams, AudioEngine, CaptureDevice, CpalCapture, TimerFdClock};
    use rack_core::autotune::{Autotuner, EdgeSampler};
    use rack_core::bus::linux::{LinuxI2c, SpidevController, SysfsEdgeSampler, SysfsOutputPin};
    use rack_core::bus::{AddressPin, BusHost, SharedBus};
    use rack_core::card::{discover_cards, load_drivers, CardManager};
    use rack_midi::connection::connect_output;
    use rack_midi::{MidiEvent, MidiInputHandler, SharedMidiOutput};

    use crate::audio_thread::{self, AudioWorker};
    use crate::config::{self, BusConfig, RackConfig};
    use crate::context::AppContext;
    use crate::midi_thread::{self, MidiDispatcher};
    use crate::{dry_run, signals, Options};

    const SIGNAL_POLL: Duration = Duration::from_millis(100);

    type MidiInput = (MidiInputHandler, flume::Receiver<MidiEvent>);

    /// Hardware the daemon runs against
    struct Hardware {
        bus: SharedBus,
        capture: Vec<Box<dyn CaptureDevice>>,
        sampler: Option<Box<dyn EdgeSampler>>,
    }

    fn open_bus(config: &BusConfig) -> anyhow::Result<SharedBus> {
        let spi = SpidevController::new(config.spi_bus, config.spi_speed_hz);
        let i2c = LinuxI2c::open(&config.i2c_device)
            .with_context(|| format!("opening {}", config.i2c_device))?;
        let pins = config
            .address_gpio
            .iter()
            .map(|&pin| SysfsOutputPin::open(pin).map(|p| Box::new(p) as Box<AddressPin>))
            .collect::<Result<Vec<_>, _>>()
            .context("opening slot address GPIO")?;
        Ok(SharedBus::new(BusHost::new(Box::new(spi), Box::new(i2c), pins)))
    }

    fn open_hardware(config: &RackConfig) -> anyhow::Result<Hardware> {
        let bus = open_bus(&config.bus)?;
        let capture = config
            .streams
            .iter()
            .map(|params| {
                CpalCapture::new(&params.pcm_device)
                    .map(|c| Box::new(c) as Box<dyn CaptureDevice>)
                    .with_context(|| format!("opening capture device {}", params.pcm_device))
            })
            .collect::<anyhow::Result<Vec<_>>>()?;
        let sampler = match SysfsEdgeSampler::open(&config.bus.tune_gpio) {
            Ok(sampler) => Some(Box::new(sampler) as Box<dyn EdgeSampler>),
            Err(e) => {
                log::warn!("Tune: GPIO sampler unavailable, autotune disabled: {}", e);
                None
            }
        };
        Ok(Hardware {
            bus,
            capture,
            sampler,
        })
    }

    fn simulated_hardware(config: &RackConfig) -> Hardware {
        log::info!("Bus: dry run on a simulated backplane");
        let mock = dry_run::backplane(config.bus.rom_base_address);
        let sampler = dry_run::edge_sampler(&mock, config.bus.tune_gpio);
        Hardware {
            bus: SharedBus::new(mock.host()),
            capture: dry_run::capture_devices(&config.streams),
            sampler: Some(Box::new(sampler)),
        }
    }

    fn open_midi(port_match: &str) -> (Option<MidiInput>, SharedMidiOutput) {
        let input = match MidiInputHandler::connect(port_match) {
            Ok(input) => Some(input),
            Err(e) => {
                log::warn!("MIDI: no input ({}), running without remote control", e);
                None
            }
        };
        let output = match connect_output(port_match) {
            Ok(conn) => SharedMidiOutput::new(Box::new(conn)),
            Err(e) => {
                log::warn!("MIDI: no output ({}), discovery reports disabled", e);
                SharedMidiOutput::disconnected()
            }
        };
        (input, output)
    }

    pub fn run(options: &Options) -> anyhow::Result<()> {
        if options.list_devices {
            crate::list_devices();
            return Ok(());
        }

        log::info!("Config: loading {:?}", options.config_path);
        let config = config::load(&options.config_path);

        let hardware = if options.dry_run {
            simulated_hardware(&config)
        } else {
            open_hardware(&config)?
        };
        let Hardware {
            bus,
            capture,
            sampler,
        } = hardware;

        let ids = discover_cards(&bus, config.bus.rom_base_address);
        let detected = load_drivers(&ids, &bus, rack_cards::KNOWN_CARDS);
        log::info!("Cards: {} loaded", detected.len());

        let streams = open_streams(capture, &config.streams).context("opening capture streams")?;
        let capacities: Vec<usize> = streams.iter().map(|s| s.params().channels).collect();
        let sample_rate = streams
            .first()
            .map(|s| s.params().sample_rate)
            .ok_or_else(|| anyhow!("no capture streams"))?;

        let cards = CardManager::assemble(detected, &capacities).context("assigning card channels")?;
        for card in cards.cards() {
            log::info!(
                "Cards: slot {} {} on stream {} channels {:?}",
                card.slot,
                card.name,
                card.assignment.stream,
                card.channels()
            );
        }

        let clock = TimerFdClock::new(sample_rate).context("creating sample clock")?;
        let tuner = sampler.map(|s| Autotuner::new(s, config.bus.tune_gpio, config.tuning.clone()));

        let (midi_input, midi_out) = open_midi(&config.midi.port_match);
        let ctx = AppContext::new(cards, midi_out, config.system.clone());
        let engine = AudioEngine::new(streams, Box::new(clock), &ctx.cards);

        signals::install().context("installing signal handlers")?;

        let audio = audio_thread::spawn(
            AudioWorker::new(engine, tuner, ctx.clone()),
            config.realtime.clone(),
        )
        .context("starting audio thread")?;

        let (midi_handler, midi) = match midi_input {
            Some((handler, events)) => {
                let thread = midi_thread::spawn(MidiDispatcher::new(ctx.clone()), events)
                    .context("starting MIDI thread")?;
                (Some(handler), Some(thread))
            }
            None => (None, None),
        };

        log::info!("rackd running");
        while ctx.flags.is_running() {
            signals::forward(&ctx.flags);
            if audio.is_finished() {
                log::error!("Audio: thread exited unexpectedly");
                ctx.flags.request_shutdown();
                break;
            }
            thread::sleep(SIGNAL_POLL);
        }

        audio.join().map_err(|_| anyhow!("audio thread panicked"))?;
        if let Some(midi) = midi {
            midi.join().map_err(|_| anyhow!("MIDI thread panicked"))?;
        }
        if let Some(handler) = midi_handler {
            let dropped = handler.dropped_events();
            if dropped > 0 {
                log::warn!("MIDI: {} events dropped on a full queue", dropped);
            }
        }

        let mut host = bus.lock();
        log::info!("Bus: {} SPI reconfigurations", host.reconfigurations());
        host.close_all();
        drop(host);
        log::info!("rackd stopped");
        Ok(())
    }
}
