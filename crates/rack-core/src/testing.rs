//! In-memory stand-ins for the hardware capabilities
//!
//! Used by the unit tests of every crate in the workspace and by
//! `rackd --dry-run`. All handles are cheap clones over shared state, so a
//! test can keep one handle for inspection while the code under test owns
//! another.

use std::collections::{HashMap, VecDeque};
use std::io;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use embedded_hal::digital::{ErrorType as DigitalErrorType, OutputPin};
use embedded_hal::i2c::{ErrorType as I2cErrorType, I2c, Operation, SevenBitAddress};

use crate::audio::{CaptureDevice, SampleClock, StreamError, StreamParams, StreamResult, StreamState};
use crate::autotune::{EdgeSampler, FrequencyCounter, GpioSample};
use crate::bus::{
    AddressPin, BusError, BusHost, BusResult, Slot, SpiController, SpiMode, ADDRESS_LINES,
};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn scripted_io_error(what: &str) -> io::Error {
    io::Error::other(format!("scripted {} failure", what))
}

/// SPI open/close observed by the mock controller
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpiEvent {
    Open(u8, SpiMode),
    Close(u8),
}

/// One SPI write with the slot selected at the time
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpiWrite {
    pub slot: Slot,
    pub chip_select: u8,
    pub data: Vec<u8>,
}

struct I2cTarget {
    registers: [u8; 256],
    pointer: u8,
}

#[derive(Default)]
struct BusState {
    address_levels: [bool; ADDRESS_LINES],
    address_writes: usize,
    fail_gpio: bool,
    spi_events: Vec<SpiEvent>,
    spi_writes: Vec<SpiWrite>,
    fail_spi_open: bool,
    fail_spi_write: bool,
    i2c_targets: HashMap<u8, I2cTarget>,
    i2c_writes: Vec<(u8, Vec<u8>)>,
    fail_i2c: bool,
    /// Keep every SPI and I2C write; off for long-running simulations
    record_history: bool,
    /// Latest 16-bit word per (slot, DAC address nibble)
    last_words: HashMap<(Slot, u8), u16>,
}

impl BusState {
    fn selected_slot(&self) -> Slot {
        self.address_levels
            .iter()
            .enumerate()
            .fold(0, |slot, (bit, &high)| slot | (u8::from(high) << bit))
    }
}

/// Recording backplane: SPI controller, I2C bus and address pins
#[derive(Clone)]
pub struct MockBus {
    state: Arc<Mutex<BusState>>,
}

impl Default for MockBus {
    fn default() -> Self {
        Self::new()
    }
}

impl MockBus {
    /// Mock that records the full write history
    pub fn new() -> Self {
        let bus = Self {
            state: Arc::default(),
        };
        lock(&bus.state).record_history = true;
        bus
    }

    /// Mock that keeps register contents and the last DAC word per channel
    /// but no write history, so its memory stays bounded
    pub fn without_history() -> Self {
        Self {
            state: Arc::default(),
        }
    }

    /// A bus host wired to this mock
    pub fn host(&self) -> BusHost {
        let pins: Vec<Box<AddressPin>> = (0..ADDRESS_LINES)
            .map(|line| {
                Box::new(MockPin {
                    line,
                    state: Arc::clone(&self.state),
                }) as Box<AddressPin>
            })
            .collect();
        BusHost::new(
            Box::new(MockSpi {
                state: Arc::clone(&self.state),
            }),
            Box::new(MockI2c {
                state: Arc::clone(&self.state),
            }),
            pins,
        )
    }

    pub fn address_levels(&self) -> [bool; ADDRESS_LINES] {
        lock(&self.state).address_levels
    }

    /// Total GPIO writes on the address lines
    pub fn address_writes(&self) -> usize {
        lock(&self.state).address_writes
    }

    pub fn selected_slot(&self) -> Slot {
        lock(&self.state).selected_slot()
    }

    pub fn fail_gpio(&self, fail: bool) {
        lock(&self.state).fail_gpio = fail;
    }

    pub fn fail_spi_open(&self, fail: bool) {
        lock(&self.state).fail_spi_open = fail;
    }

    pub fn fail_spi_write(&self, fail: bool) {
        lock(&self.state).fail_spi_write = fail;
    }

    pub fn fail_i2c(&self, fail: bool) {
        lock(&self.state).fail_i2c = fail;
    }

    /// Successful opens and closes, in order
    pub fn spi_events(&self) -> Vec<SpiEvent> {
        lock(&self.state).spi_events.clone()
    }

    /// Data of every successful SPI write, in order
    pub fn spi_writes(&self) -> Vec<Vec<u8>> {
        lock(&self.state)
            .spi_writes
            .iter()
            .map(|w| w.data.clone())
            .collect()
    }

    /// Data of the SPI writes made while `slot` was selected
    pub fn spi_writes_for_slot(&self, slot: Slot) -> Vec<Vec<u8>> {
        lock(&self.state)
            .spi_writes
            .iter()
            .filter(|w| w.slot == slot)
            .map(|w| w.data.clone())
            .collect()
    }

    /// Most recent 16-bit word written to `slot` whose top nibble is `address`
    pub fn last_dac_word(&self, slot: Slot, address: u8) -> Option<u16> {
        lock(&self.state)
            .last_words
            .get(&(slot, address & 0x0F))
            .copied()
    }

    /// Number of SPI writes held in the history
    pub fn recorded_spi_writes(&self) -> usize {
        lock(&self.state).spi_writes.len()
    }

    pub fn clear_spi_writes(&self) {
        let mut state = lock(&self.state);
        state.spi_writes.clear();
        state.last_words.clear();
    }

    /// Attach an I2C target whose registers start with `contents`
    pub fn set_device(&self, address: u8, contents: &[u8]) {
        let mut registers = [0u8; 256];
        for (reg, byte) in registers.iter_mut().zip(contents) {
            *reg = *byte;
        }
        lock(&self.state).i2c_targets.insert(
            address,
            I2cTarget {
                registers,
                pointer: 0,
            },
        );
    }

    /// Register contents of an attached target
    pub fn register(&self, address: u8, offset: u8) -> Option<u8> {
        lock(&self.state)
            .i2c_targets
            .get(&address)
            .map(|t| t.registers[usize::from(offset)])
    }

    /// Write payloads sent to `address`, in order
    pub fn i2c_writes(&self, address: u8) -> Vec<Vec<u8>> {
        lock(&self.state)
            .i2c_writes
            .iter()
            .filter(|(a, _)| *a == address)
            .map(|(_, data)| data.clone())
            .collect()
    }
}

struct MockPin {
    line: usize,
    state: Arc<Mutex<BusState>>,
}

impl MockPin {
    fn drive(&mut self, high: bool) -> BusResult<()> {
        let mut state = lock(&self.state);
        if state.fail_gpio {
            return Err(BusError::Gpio {
                pin: self.line as u8,
                reason: "scripted failure".to_string(),
            });
        }
        state.address_levels[self.line] = high;
        state.address_writes += 1;
        Ok(())
    }
}

impl DigitalErrorType for MockPin {
    type Error = BusError;
}

impl OutputPin for MockPin {
    fn set_low(&mut self) -> Result<(), Self::Error> {
        self.drive(false)
    }

    fn set_high(&mut self) -> Result<(), Self::Error> {
        self.drive(true)
    }
}

struct MockSpi {
    state: Arc<Mutex<BusState>>,
}

impl SpiController for MockSpi {
    fn open(&mut self, chip_select: u8, mode: SpiMode) -> BusResult<()> {
        let mut state = lock(&self.state);
        if state.fail_spi_open {
            return Err(BusError::Open {
                path: format!("mock-spi.{}", chip_select),
                source: scripted_io_error("open"),
            });
        }
        if state.record_history {
            state.spi_events.push(SpiEvent::Open(chip_select, mode));
        }
        Ok(())
    }

    fn close(&mut self, chip_select: u8) {
        let mut state = lock(&self.state);
        if state.record_history {
            state.spi_events.push(SpiEvent::Close(chip_select));
        }
    }

    fn write(&mut self, chip_select: u8, data: &[u8]) -> BusResult<()> {
        let mut state = lock(&self.state);
        if state.fail_spi_write {
            return Err(BusError::Io(scripted_io_error("write")));
        }
        let slot = state.selected_slot();
        if let [high, low] = *data {
            let word = u16::from_be_bytes([high, low]);
            state.last_words.insert((slot, (word >> 12) as u8), word);
        }
        if state.record_history {
            state.spi_writes.push(SpiWrite {
                slot,
                chip_select,
                data: data.to_vec(),
            });
        }
        Ok(())
    }
}

struct MockI2c {
    state: Arc<Mutex<BusState>>,
}

impl I2cErrorType for MockI2c {
    type Error = BusError;
}

impl I2c<SevenBitAddress> for MockI2c {
    fn transaction(
        &mut self,
        address: SevenBitAddress,
        operations: &mut [Operation<'_>],
    ) -> Result<(), Self::Error> {
        let mut guard = lock(&self.state);
        let state = &mut *guard;
        if state.fail_i2c {
            return Err(BusError::Io(scripted_io_error("i2c")));
        }
        let target = state
            .i2c_targets
            .get_mut(&address)
            .ok_or(BusError::NoAcknowledge(address))?;

        for op in operations.iter_mut() {
            match op {
                Operation::Write(data) => {
                    if let Some((&offset, payload)) = data.split_first() {
                        target.pointer = offset;
                        for &byte in payload {
                            target.registers[usize::from(target.pointer)] = byte;
                            target.pointer = target.pointer.wrapping_add(1);
                        }
                    }
                    if state.record_history {
                        state.i2c_writes.push((address, data.to_vec()));
                    }
                }
                Operation::Read(buf) => {
                    for byte in buf.iter_mut() {
                        *byte = target.registers[usize::from(target.pointer)];
                        target.pointer = target.pointer.wrapping_add(1);
                    }
                }
            }
        }
        Ok(())
    }
}

/// Sample generator for [`ScriptedCapture`]: `(frame number, channel) -> sample`
pub type SampleGenerator = fn(u64, usize) -> i16;

fn default_generator(frame: u64, channel: usize) -> i16 {
    (frame as i16).wrapping_add((channel as i16).wrapping_mul(1000))
}

struct CaptureScript {
    state: StreamState,
    /// Frames committed so far; the next window starts here
    committed: u64,
    /// Frames handed out in the open window and not yet committed
    outstanding: usize,
    available: Option<usize>,
    faults: VecDeque<StreamError>,
    suspend_remaining: u32,
    resume_attempts: u32,
    prepares: u32,
    generator: SampleGenerator,
}

/// Capture device producing numbered frames with scriptable faults
///
/// By default channel `c` of frame `n` holds `n + 1000 * c`.
#[derive(Clone)]
pub struct ScriptedCapture {
    script: Arc<Mutex<CaptureScript>>,
    channels: usize,
    window: Vec<i16>,
}

impl ScriptedCapture {
    pub fn new(channels: usize) -> Self {
        Self {
            script: Arc::new(Mutex::new(CaptureScript {
                state: StreamState::Unprepared,
                committed: 0,
                outstanding: 0,
                available: None,
                faults: VecDeque::new(),
                suspend_remaining: 0,
                resume_attempts: 0,
                prepares: 0,
                generator: default_generator,
            })),
            channels,
            window: Vec::new(),
        }
    }

    pub fn set_generator(&self, generator: SampleGenerator) {
        lock(&self.script).generator = generator;
    }

    /// Make the next `mmap_begin` fail and move the device to the matching state
    pub fn fail_next_begin(&self, fault: StreamError) {
        lock(&self.script).faults.push_back(fault);
    }

    pub fn set_state(&self, state: StreamState) {
        lock(&self.script).state = state;
    }

    /// Suspend; the first `attempts` resume calls report `Again`
    pub fn suspend(&self, attempts: u32) {
        let mut script = lock(&self.script);
        script.state = StreamState::Suspended;
        script.suspend_remaining = attempts;
    }

    /// Cap the frames a window may expose (`None` = unlimited)
    pub fn limit_available(&self, frames: Option<usize>) {
        lock(&self.script).available = frames;
    }

    pub fn committed(&self) -> u64 {
        lock(&self.script).committed
    }

    pub fn prepares(&self) -> u32 {
        lock(&self.script).prepares
    }

    pub fn resume_attempts(&self) -> u32 {
        lock(&self.script).resume_attempts
    }
}

impl CaptureDevice for ScriptedCapture {
    fn name(&self) -> &str {
        "scripted"
    }

    fn configure(&mut self, params: &StreamParams) -> StreamResult<StreamParams> {
        Ok(StreamParams {
            channels: self.channels,
            ..params.clone()
        })
    }

    fn state(&self) -> StreamState {
        lock(&self.script).state
    }

    fn prepare(&mut self) -> StreamResult<()> {
        let mut script = lock(&self.script);
        // A reset ring loses whatever was not committed
        script.committed += script.outstanding as u64;
        script.outstanding = 0;
        script.state = StreamState::Prepared;
        script.prepares += 1;
        Ok(())
    }

    fn start(&mut self) -> StreamResult<()> {
        let mut script = lock(&self.script);
        if script.state != StreamState::Prepared {
            return Err(StreamError::Device(format!("start in {:?}", script.state)));
        }
        script.state = StreamState::Running;
        Ok(())
    }

    fn resume(&mut self) -> StreamResult<()> {
        let mut script = lock(&self.script);
        script.resume_attempts += 1;
        if script.suspend_remaining > 0 {
            script.suspend_remaining -= 1;
            return Err(StreamError::Again);
        }
        script.state = StreamState::Prepared;
        Ok(())
    }

    fn mmap_begin(&mut self, max_frames: usize) -> StreamResult<usize> {
        let mut script = lock(&self.script);
        if let Some(fault) = script.faults.pop_front() {
            script.state = match fault {
                StreamError::Xrun => StreamState::Xrun,
                StreamError::Suspended => StreamState::Suspended,
                StreamError::Disconnected(_) => StreamState::Disconnected,
                _ => script.state,
            };
            return Err(fault);
        }
        match script.state {
            StreamState::Running => {}
            StreamState::Xrun => return Err(StreamError::Xrun),
            StreamState::Suspended => return Err(StreamError::Suspended),
            StreamState::Disconnected => {
                return Err(StreamError::Disconnected("scripted".to_string()))
            }
            _ => return Err(StreamError::Again),
        }

        let frames = script.available.map_or(max_frames, |cap| cap.min(max_frames));
        let start = script.committed;
        let generator = script.generator;
        self.window.clear();
        for n in 0..frames as u64 {
            for channel in 0..self.channels {
                self.window.push(generator(start + n, channel));
            }
        }
        script.outstanding = frames;
        Ok(frames)
    }

    fn frame(&self, index: usize) -> &[i16] {
        let start = index * self.channels;
        &self.window[start..start + self.channels]
    }

    fn mmap_commit(&mut self, frames: usize) -> StreamResult<()> {
        let mut script = lock(&self.script);
        script.committed += frames as u64;
        script.outstanding = script.outstanding.saturating_sub(frames);
        Ok(())
    }
}

#[derive(Default)]
struct ClockScript {
    expirations: VecDeque<u64>,
    rearms: u32,
    waits: u64,
}

/// Sample clock returning scripted expiration counts (1 when the script is empty)
#[derive(Clone, Default)]
pub struct ScriptedClock {
    script: Arc<Mutex<ClockScript>>,
}

impl ScriptedClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, expirations: &[u64]) {
        lock(&self.script).expirations.extend(expirations);
    }

    pub fn rearms(&self) -> u32 {
        lock(&self.script).rearms
    }

    pub fn waits(&self) -> u64 {
        lock(&self.script).waits
    }
}

impl SampleClock for ScriptedClock {
    fn wait(&mut self) -> io::Result<u64> {
        let mut script = lock(&self.script);
        script.waits += 1;
        Ok(script.expirations.pop_front().unwrap_or(1))
    }

    fn rearm(&mut self) -> io::Result<()> {
        let mut script = lock(&self.script);
        script.rearms += 1;
        script.expirations.clear();
        Ok(())
    }
}

/// Frequency on a GPIO pin, queried once per capture window
pub type FrequencySource = Box<dyn FnMut(u8) -> f64 + Send>;

/// Edge sampler synthesising square waves from a frequency source
pub struct ScriptedSampler {
    source: FrequencySource,
    tick: u32,
    step_us: u32,
    wrap_next: u32,
    fail_next: u32,
}

impl ScriptedSampler {
    pub fn new(source: FrequencySource) -> Self {
        Self {
            source,
            tick: 0,
            step_us: 5,
            wrap_next: 0,
            fail_next: 0,
        }
    }

    /// Constant frequency per pin
    pub fn constant(frequencies: HashMap<u8, f64>) -> Self {
        Self::new(Box::new(move |pin| frequencies.get(&pin).copied().unwrap_or(0.0)))
    }

    /// The next `windows` captures straddle a tick counter wrap
    pub fn wrap_next(mut self, windows: u32) -> Self {
        self.wrap_next = windows;
        self
    }

    /// The next `windows` captures fail
    pub fn fail_next(mut self, windows: u32) -> Self {
        self.fail_next = windows;
        self
    }
}

impl EdgeSampler for ScriptedSampler {
    fn capture(
        &mut self,
        mask: u32,
        window: Duration,
        counter: &mut FrequencyCounter,
    ) -> BusResult<()> {
        if self.fail_next > 0 {
            self.fail_next -= 1;
            return Err(BusError::Gpio {
                pin: 0,
                reason: "scripted capture failure".to_string(),
            });
        }
        let window_us = u32::try_from(window.as_micros()).unwrap_or(u32::MAX);
        if self.wrap_next > 0 {
            self.wrap_next -= 1;
            self.tick = u32::MAX - window_us / 2;
        }

        let waves: Vec<(u32, f64)> = (0..32u8)
            .filter(|pin| mask & (1 << pin) != 0)
            .map(|pin| (1u32 << pin, (self.source)(pin)))
            .collect();

        let mut batch = Vec::with_capacity(64);
        let mut t = 0u32;
        while t < window_us {
            let levels = waves.iter().fold(0u32, |levels, &(bit, frequency)| {
                let phase = f64::from(t) * frequency / 1e6;
                if phase.fract() >= 0.5 {
                    levels | bit
                } else {
                    levels
                }
            });
            batch.push(GpioSample {
                tick: self.tick.wrapping_add(t),
                levels,
            });
            if batch.len() == 64 {
                counter.accept(&batch);
                batch.clear();
            }
            t += self.step_us;
        }
        counter.accept(&batch);
        self.tick = self.tick.wrapping_add(window_us);
        Ok(())
    }
}
