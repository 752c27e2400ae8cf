//! CPAL capture backend
//!
//! USB-audio capture through CPAL (ALSA on the Pi). CPAL streams cannot move
//! between threads, so each device gets an owner thread that builds and holds
//! the stream; the audio thread only sees the consumer end of a lock-free
//! ring:
//!
//! ```text
//! ┌────────────────────┐  S16 frames   ┌─────────────┐  read_chunk  ┌─────────────┐
//! │ CPAL input callback│──────────────►│ rtrb ring   │─────────────►│ CpalCapture │
//! │ (owner thread)     │   push/drop   │ (SPSC)      │  into window │ (audio thr) │
//! └────────────────────┘               └─────────────┘              └─────────────┘
//!          │ ring full → XRUN, stream error → DISCONNECTED
//!          ▼
//!     shared atomics
//! ```

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{BufferSize, SampleFormat, SampleRate, StreamConfig};
use rtrb::{Consumer, Producer, RingBuffer};

use super::{CaptureDevice, StreamError, StreamParams, StreamResult, StreamState};

const STATE_UNPREPARED: u8 = 0;
const STATE_PREPARED: u8 = 1;
const STATE_RUNNING: u8 = 2;
const STATE_XRUN: u8 = 3;
const STATE_DISCONNECTED: u8 = 4;

fn decode_state(raw: u8) -> StreamState {
    match raw {
        STATE_PREPARED => StreamState::Prepared,
        STATE_RUNNING => StreamState::Running,
        STATE_XRUN => StreamState::Xrun,
        STATE_DISCONNECTED => StreamState::Disconnected,
        _ => StreamState::Unprepared,
    }
}

/// State visible to both the CPAL callback and the audio thread
struct Shared {
    state: AtomicU8,
    last_error: Mutex<Option<String>>,
}

impl Shared {
    fn set(&self, state: u8) {
        self.state.store(state, Ordering::Release);
    }

    /// Move to `to` unless the stream already faulted
    fn set_unless_faulted(&self, to: u8) {
        let _ = self
            .state
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                (current != STATE_XRUN && current != STATE_DISCONNECTED).then_some(to)
            });
    }
}

type Reply<T> = flume::Sender<StreamResult<T>>;

enum Control {
    Configure(StreamParams, Reply<StreamParams>),
    Build(Producer<i16>, Reply<()>),
    Play(Reply<()>),
    Shutdown,
}

/// Capture device backed by a CPAL input stream
pub struct CpalCapture {
    name: String,
    params: Option<StreamParams>,
    shared: Arc<Shared>,
    control: flume::Sender<Control>,
    owner: Option<JoinHandle<()>>,
    consumer: Option<Consumer<i16>>,
    window: Vec<i16>,
}

impl CpalCapture {
    /// Spawn the owner thread for a device matching `name`
    ///
    /// The device itself is resolved by [`CaptureDevice::configure`].
    pub fn new(name: &str) -> StreamResult<Self> {
        let shared = Arc::new(Shared {
            state: AtomicU8::new(STATE_UNPREPARED),
            last_error: Mutex::new(None),
        });
        let (control, rx) = flume::unbounded();
        let owner_shared = Arc::clone(&shared);
        let owner = std::thread::Builder::new()
            .name(format!("capture-{}", name))
            .spawn(move || owner_loop(rx, owner_shared))
            .map_err(|e| StreamError::Device(format!("failed to spawn capture thread: {}", e)))?;

        Ok(Self {
            name: name.to_string(),
            params: None,
            shared,
            control,
            owner: Some(owner),
            consumer: None,
            window: Vec::new(),
        })
    }

    fn request<T>(&self, build: impl FnOnce(Reply<T>) -> Control) -> StreamResult<T> {
        let (tx, rx) = flume::bounded(1);
        self.control
            .send(build(tx))
            .map_err(|_| StreamError::Disconnected("capture thread gone".to_string()))?;
        rx.recv()
            .map_err(|_| StreamError::Disconnected("capture thread gone".to_string()))?
    }

    /// Last error reported by the CPAL stream callback
    pub fn last_error(&self) -> Option<String> {
        self.shared
            .last_error
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn channels(&self) -> usize {
        self.params.as_ref().map_or(1, |p| p.channels.max(1))
    }
}

impl CaptureDevice for CpalCapture {
    fn name(&self) -> &str {
        &self.name
    }

    fn configure(&mut self, params: &StreamParams) -> StreamResult<StreamParams> {
        let actual = self.request(|reply| Control::Configure(params.clone(), reply))?;
        self.params = Some(actual.clone());
        Ok(actual)
    }

    fn state(&self) -> StreamState {
        decode_state(self.shared.state.load(Ordering::Acquire))
    }

    fn prepare(&mut self) -> StreamResult<()> {
        let params = self
            .params
            .clone()
            .ok_or_else(|| StreamError::Device("prepare before configure".to_string()))?;
        let samples = params.buffer_size.max(params.period_size) * params.channels;
        let (producer, consumer) = RingBuffer::<i16>::new(samples);

        self.request(|reply| Control::Build(producer, reply))?;
        self.consumer = Some(consumer);
        self.window = Vec::with_capacity(params.period_size * params.channels);
        self.shared.set(STATE_PREPARED);
        Ok(())
    }

    fn start(&mut self) -> StreamResult<()> {
        if self.state() != StreamState::Prepared {
            return Err(StreamError::Device(format!("start in {:?}", self.state())));
        }
        self.request(Control::Play)?;
        self.shared.set_unless_faulted(STATE_RUNNING);
        Ok(())
    }

    fn resume(&mut self) -> StreamResult<()> {
        // CPAL has no suspend state of its own; prepare rebuilds the stream
        Ok(())
    }

    fn mmap_begin(&mut self, max_frames: usize) -> StreamResult<usize> {
        match self.state() {
            StreamState::Running => {}
            StreamState::Xrun => return Err(StreamError::Xrun),
            StreamState::Disconnected => {
                return Err(StreamError::Disconnected(
                    self.last_error().unwrap_or_default(),
                ))
            }
            _ => return Err(StreamError::Again),
        }

        let channels = self.channels();
        let consumer = self.consumer.as_mut().ok_or(StreamError::Again)?;
        let frames = (consumer.slots() / channels).min(max_frames);
        self.window.clear();
        if frames == 0 {
            return Ok(0);
        }

        let chunk = consumer
            .read_chunk(frames * channels)
            .map_err(|_| StreamError::Again)?;
        let (first, second) = chunk.as_slices();
        self.window.extend_from_slice(first);
        self.window.extend_from_slice(second);
        chunk.commit_all();
        Ok(frames)
    }

    fn frame(&self, index: usize) -> &[i16] {
        let channels = self.channels();
        let start = index * channels;
        self.window.get(start..start + channels).unwrap_or(&[])
    }

    fn mmap_commit(&mut self, _frames: usize) -> StreamResult<()> {
        // Samples left the ring when the window was copied out
        Ok(())
    }
}

impl Drop for CpalCapture {
    fn drop(&mut self) {
        let _ = self.control.send(Control::Shutdown);
        if let Some(owner) = self.owner.take() {
            let _ = owner.join();
        }
    }
}

/// Find a capture device whose name contains `pattern` (case-insensitive)
fn find_device(host: &cpal::Host, pattern: &str) -> StreamResult<cpal::Device> {
    if pattern.is_empty() || pattern == "default" {
        return host
            .default_input_device()
            .ok_or_else(|| StreamError::Device("no default capture device".to_string()));
    }
    let needle = pattern.to_lowercase();
    let devices = host
        .input_devices()
        .map_err(|e| StreamError::Device(e.to_string()))?;
    for device in devices {
        match device.name() {
            Ok(name) if name.to_lowercase().contains(&needle) => return Ok(device),
            _ => continue,
        }
    }
    Err(StreamError::Device(format!(
        "no capture device matching {:?}",
        pattern
    )))
}

/// Pick an S16 configuration close to `params`
fn negotiate(device: &cpal::Device, params: &StreamParams) -> StreamResult<(StreamConfig, StreamParams)> {
    let ranges: Vec<_> = device
        .supported_input_configs()
        .map_err(|e| StreamError::Device(e.to_string()))?
        .filter(|range| range.sample_format() == SampleFormat::I16)
        .collect();

    let rate_ok = |range: &cpal::SupportedStreamConfigRange| {
        params.sample_rate >= range.min_sample_rate().0
            && params.sample_rate <= range.max_sample_rate().0
    };
    let range = ranges
        .iter()
        .filter(|r| rate_ok(r))
        .find(|r| usize::from(r.channels()) == params.channels)
        .or_else(|| {
            ranges
                .iter()
                .filter(|r| rate_ok(r))
                .max_by_key(|r| r.channels())
        })
        .ok_or(StreamError::Mismatch {
            what: "sample rate",
            requested: params.sample_rate,
            actual: 0,
        })?;

    let config = StreamConfig {
        channels: range.channels(),
        sample_rate: SampleRate(params.sample_rate),
        buffer_size: BufferSize::Fixed(params.period_size as u32),
    };
    let actual = StreamParams {
        channels: usize::from(range.channels()),
        ..params.clone()
    };
    Ok((config, actual))
}

fn build_stream(
    device: &cpal::Device,
    config: &StreamConfig,
    mut producer: Producer<i16>,
    shared: Arc<Shared>,
) -> StreamResult<cpal::Stream> {
    let data_shared = Arc::clone(&shared);
    let stream = device
        .build_input_stream(
            config,
            move |data: &[i16], _info: &cpal::InputCallbackInfo| {
                if producer.slots() < data.len() {
                    // Ring full: the reader fell behind
                    data_shared.set_unless_faulted(STATE_XRUN);
                    return;
                }
                for &sample in data {
                    let _ = producer.push(sample);
                }
            },
            move |err| {
                *shared.last_error.lock().unwrap_or_else(PoisonError::into_inner) =
                    Some(err.to_string());
                shared.set(STATE_DISCONNECTED);
            },
            None,
        )
        .map_err(|e| StreamError::Device(e.to_string()))?;
    Ok(stream)
}

fn owner_loop(rx: flume::Receiver<Control>, shared: Arc<Shared>) {
    let host = cpal::default_host();
    let mut device: Option<(cpal::Device, StreamConfig)> = None;
    let mut stream: Option<cpal::Stream> = None;

    while let Ok(control) = rx.recv() {
        match control {
            Control::Configure(params, reply) => {
                let result = find_device(&host, &params.pcm_device).and_then(|d| {
                    let (config, actual) = negotiate(&d, &params)?;
                    device = Some((d, config));
                    Ok(actual)
                });
                let _ = reply.send(result);
            }
            Control::Build(producer, reply) => {
                stream = None;
                let result = match &device {
                    Some((d, config)) => {
                        build_stream(d, config, producer, Arc::clone(&shared)).map(|s| {
                            // Built streams may start on their own; wait for Play
                            let _ = s.pause();
                            stream = Some(s);
                        })
                    }
                    None => Err(StreamError::Device("not configured".to_string())),
                };
                let _ = reply.send(result);
            }
            Control::Play(reply) => {
                let result = match &stream {
                    Some(s) => s.play().map_err(|e| StreamError::Device(e.to_string())),
                    None => Err(StreamError::Device("no stream built".to_string())),
                };
                let _ = reply.send(result);
            }
            Control::Shutdown => break,
        }
    }
    drop(stream);
    log::debug!("Audio: capture owner thread exiting");
}

/// Names of every capture device on the default host
pub fn list_capture_devices() -> Vec<String> {
    let host = cpal::default_host();
    match host.input_devices() {
        Ok(devices) => devices.filter_map(|d| d.name().ok()).collect(),
        Err(e) => {
            log::warn!("Audio: could not enumerate capture devices: {}", e);
            Vec::new()
        }
    }
}
