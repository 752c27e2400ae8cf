//! One capture stream: state-machine recovery and the mmap cursor
//!
//! ```text
//! UNPREPARED ──prepare──► PREPARED ──start──► RUNNING
//!                             ▲                 │ overrun / disconnect
//!                             │                 ▼
//!                             └────prepare──── XRUN
//!                             ▲
//!                             └──prepare── resume loop ◄── SUSPENDED
//! ```
//!
//! The cursor walks a window of captured frames one tick at a time. When a
//! tick consumes more frames than the window holds, the window is committed
//! and the excess is skipped at the start of the next window, so lateness
//! never replays or loses position.

use std::time::Duration;

use super::stats::LogThrottle;
use super::{CaptureDevice, StreamError, StreamParams, StreamResult, StreamState, TickStats};
use crate::card::{ConfigError, MAX_STREAMS};

/// Resume attempts before giving up on a suspended device this tick
const RESUME_ATTEMPTS: u32 = 10;

/// Sleep between resume attempts
const RESUME_BACKOFF: Duration = Duration::from_millis(100);

pub struct Stream {
    device: Box<dyn CaptureDevice>,
    params: StreamParams,
    /// Frames in the open window (0 = no window)
    window_len: usize,
    /// Cursor inside the window
    pos: usize,
    /// Frames to drop at the start of the next window
    skip: usize,
    resume_backoff: Duration,
    errors: LogThrottle,
}

impl Stream {
    /// Wrap a configured device
    pub fn new(device: Box<dyn CaptureDevice>, params: StreamParams) -> Self {
        Self {
            device,
            params,
            window_len: 0,
            pos: 0,
            skip: 0,
            resume_backoff: RESUME_BACKOFF,
            errors: LogThrottle::default(),
        }
    }

    pub fn with_resume_backoff(mut self, backoff: Duration) -> Self {
        self.resume_backoff = backoff;
        self
    }

    /// Negotiated parameters
    pub fn params(&self) -> &StreamParams {
        &self.params
    }

    pub fn name(&self) -> &str {
        self.device.name()
    }

    pub fn state(&self) -> StreamState {
        self.device.state()
    }

    /// Drive the device towards `Running`
    pub fn ensure_running(&mut self, stats: &mut TickStats) -> StreamResult<()> {
        let result = match self.device.state() {
            StreamState::Running => return Ok(()),
            StreamState::Prepared => self.device.start(),
            StreamState::Unprepared => self.device.prepare().and_then(|_| self.device.start()),
            StreamState::Xrun => self.recover(StreamError::Xrun, stats),
            StreamState::Disconnected => {
                self.recover(StreamError::Disconnected(String::new()), stats)
            }
            StreamState::Suspended => self.recover(StreamError::Suspended, stats),
        };
        if let Err(e) = &result {
            self.log_failure("start", e);
        }
        result
    }

    /// Recover from a device fault
    ///
    /// Suspends are resumed with a bounded backoff first; every fault then
    /// re-prepares and restarts the device with a fresh window.
    pub fn recover(&mut self, fault: StreamError, stats: &mut TickStats) -> StreamResult<()> {
        match &fault {
            StreamError::Xrun | StreamError::Disconnected(_) | StreamError::Suspended => {
                stats.xruns += 1;
                if let Some(suppressed) = self.errors.allow() {
                    log::warn!(
                        "Audio: {} {} ({} more since last report), recovering",
                        self.device.name(),
                        fault,
                        suppressed
                    );
                }
            }
            _ => {}
        }

        if fault == StreamError::Suspended {
            self.resume()?;
        }

        self.reset_window();
        self.device.prepare()?;
        self.device.start()?;
        stats.recoveries += 1;
        Ok(())
    }

    fn resume(&mut self) -> StreamResult<()> {
        for _ in 0..RESUME_ATTEMPTS {
            match self.device.resume() {
                Ok(()) => return Ok(()),
                Err(StreamError::Again) => std::thread::sleep(self.resume_backoff),
                // Device can't resume in place; prepare restarts it instead
                Err(_) => return Ok(()),
            }
        }
        Err(StreamError::Suspended)
    }

    /// Restart from a clean state, used after long synchronous pauses
    pub fn restart(&mut self) -> StreamResult<()> {
        self.reset_window();
        self.device.prepare()?;
        self.device.start()
    }

    fn reset_window(&mut self) {
        self.window_len = 0;
        self.pos = 0;
        self.skip = 0;
    }

    /// Make sure a frame is available at the cursor
    ///
    /// Opens a new window when the current one is used up. A failing open
    /// triggers one recovery and one retry. Returns `false` when the stream
    /// has nothing to deliver this tick.
    pub fn ensure_window(&mut self, stats: &mut TickStats) -> bool {
        if self.pos < self.window_len {
            return true;
        }
        if self.device.state() != StreamState::Running {
            return false;
        }
        match self.open_window() {
            Ok(ready) => ready,
            Err(fault) => {
                if let Err(e) = self.recover(fault, stats) {
                    self.log_failure("recovery", &e);
                    return false;
                }
                match self.open_window() {
                    Ok(ready) => ready,
                    Err(e) => {
                        self.log_failure("window", &e);
                        false
                    }
                }
            }
        }
    }

    fn open_window(&mut self) -> StreamResult<bool> {
        loop {
            let frames = match self.device.mmap_begin(self.params.period_size) {
                Err(StreamError::Again) => 0,
                other => other?,
            };
            if frames == 0 {
                // Caught up with the device, nothing left to skip
                self.skip = 0;
                return Ok(false);
            }
            if self.skip < frames {
                self.window_len = frames;
                self.pos = self.skip;
                self.skip = 0;
                return Ok(true);
            }
            self.device.mmap_commit(frames)?;
            self.skip -= frames;
        }
    }

    /// Frame at the cursor, if a window is open
    pub fn frame(&self) -> Option<&[i16]> {
        (self.pos < self.window_len).then(|| self.device.frame(self.pos))
    }

    /// Move the cursor forward by `frames` sample periods
    pub fn advance(&mut self, frames: usize, stats: &mut TickStats) {
        let mut remaining = frames;
        if self.pos >= self.window_len {
            // Starved: nothing was delivered, nothing to skip
            return;
        }
        while remaining > 0 && self.pos < self.window_len {
            let left = self.window_len - self.pos;
            if remaining < left {
                self.pos += remaining;
                return;
            }
            remaining -= left;
            let consumed = self.window_len;
            self.window_len = 0;
            self.pos = 0;
            if let Err(fault) = self.device.mmap_commit(consumed) {
                if let Err(e) = self.recover(fault, stats) {
                    self.log_failure("recovery", &e);
                }
                return;
            }
        }
        self.skip = self.skip.saturating_add(remaining);
    }

    fn log_failure(&mut self, what: &str, err: &StreamError) {
        if let Some(suppressed) = self.errors.allow() {
            log::error!(
                "Audio: {} {} failed: {} ({} more since last report)",
                self.device.name(),
                what,
                err,
                suppressed
            );
        }
    }
}

/// Configure every capture device and check that the streams agree
///
/// Two streams must share sample rate, period size and channel count; any
/// difference is a configuration fault.
pub fn open_streams(
    devices: Vec<Box<dyn CaptureDevice>>,
    params: &[StreamParams],
) -> Result<Vec<Stream>, ConfigError> {
    if params.is_empty() {
        return Err(ConfigError::NoStreams);
    }
    if params.len() > MAX_STREAMS {
        return Err(ConfigError::TooManyStreams(params.len()));
    }
    if devices.len() != params.len() {
        return Err(ConfigError::StreamMismatch(format!(
            "{} devices for {} stream configurations",
            devices.len(),
            params.len()
        )));
    }

    let mut streams = Vec::with_capacity(devices.len());
    for (mut device, requested) in devices.into_iter().zip(params) {
        let actual = device.configure(requested)?;
        if actual.channels != requested.channels {
            log::warn!(
                "Audio: {} opened with {} channels ({} requested)",
                device.name(),
                actual.channels,
                requested.channels
            );
        }
        log::info!(
            "Audio: {} at {} Hz, period {}, buffer {}, {} channels",
            device.name(),
            actual.sample_rate,
            actual.period_size,
            actual.buffer_size,
            actual.channels
        );
        device.prepare()?;
        streams.push(Stream::new(device, actual));
    }

    if let [first, second] = streams.as_slice() {
        let (a, b) = (first.params(), second.params());
        if a.sample_rate != b.sample_rate {
            return Err(ConfigError::StreamMismatch(format!(
                "sample rate {} vs {}",
                a.sample_rate, b.sample_rate
            )));
        }
        if a.period_size != b.period_size {
            return Err(ConfigError::StreamMismatch(format!(
                "period size {} vs {}",
                a.period_size, b.period_size
            )));
        }
        if a.channels != b.channels {
            return Err(ConfigError::StreamMismatch(format!(
                "channel count {} vs {}",
                a.channels, b.channels
            )));
        }
    }

    Ok(streams)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ScriptedCapture;

    fn params(channels: usize) -> StreamParams {
        StreamParams {
            pcm_device: "test".to_string(),
            period_size: 4,
            channels,
            ..StreamParams::default()
        }
    }

    fn running(capture: &ScriptedCapture) -> Stream {
        let mut stream = Stream::new(Box::new(capture.clone()), params(2))
            .with_resume_backoff(Duration::ZERO);
        stream.ensure_running(&mut TickStats::default()).unwrap();
        stream
    }

    /// Deliver `ticks` frames advancing one period per tick; returns the
    /// first channel of every delivered frame
    fn run(stream: &mut Stream, ticks: usize, stats: &mut TickStats) -> Vec<i16> {
        let mut seen = Vec::new();
        for _ in 0..ticks {
            stream.ensure_running(stats).ok();
            if stream.ensure_window(stats) {
                if let Some(frame) = stream.frame() {
                    seen.push(frame[0]);
                }
            }
            stream.advance(1, stats);
        }
        seen
    }

    #[test]
    fn test_frames_delivered_in_order() {
        let capture = ScriptedCapture::new(2);
        let mut stream = running(&capture);
        let seen = run(&mut stream, 10, &mut TickStats::default());
        assert_eq!(seen, (0..10).collect::<Vec<i16>>());
        assert_eq!(capture.committed(), 8);
    }

    #[test]
    fn test_xrun_recovery_resumes_at_next_frame() {
        let capture = ScriptedCapture::new(2);
        let mut stream = running(&capture);
        let mut stats = TickStats::default();

        let mut seen = run(&mut stream, 4, &mut stats);
        capture.fail_next_begin(StreamError::Xrun);
        seen.extend(run(&mut stream, 4, &mut stats));

        assert_eq!(seen, (0..8).collect::<Vec<i16>>());
        assert_eq!(stats.xruns, 1);
        assert_eq!(stats.recoveries, 1);
        assert_eq!(stream.state(), StreamState::Running);
        assert_eq!(capture.prepares(), 2);
    }

    #[test]
    fn test_disconnect_between_ticks_recovers() {
        let capture = ScriptedCapture::new(2);
        let mut stream = running(&capture);
        let mut stats = TickStats::default();

        let mut seen = run(&mut stream, 2, &mut stats);
        capture.set_state(StreamState::Disconnected);
        seen.extend(run(&mut stream, 2, &mut stats));

        assert_eq!(stats.recoveries, 1);
        assert_eq!(stream.state(), StreamState::Running);
        // The rest of the interrupted window is lost with the device reset
        assert_eq!(seen, vec![0, 1, 4, 5]);
    }

    #[test]
    fn test_suspend_resumes_then_prepares() {
        let capture = ScriptedCapture::new(2);
        let mut stream = running(&capture);
        let mut stats = TickStats::default();

        capture.suspend(3);
        stream.ensure_running(&mut stats).unwrap();
        assert_eq!(capture.resume_attempts(), 4);
        assert_eq!(stream.state(), StreamState::Running);
        assert_eq!(stats.recoveries, 1);
    }

    #[test]
    fn test_late_tick_skips_without_duplicates() {
        let capture = ScriptedCapture::new(2);
        let mut stream = running(&capture);
        let mut stats = TickStats::default();

        assert!(stream.ensure_window(&mut stats));
        assert_eq!(stream.frame().map(|f| f[0]), Some(0));
        // Six periods late: window of 4 committed, 2 skipped in the next one
        stream.advance(6, &mut stats);
        assert!(stream.ensure_window(&mut stats));
        assert_eq!(stream.frame().map(|f| f[0]), Some(6));
        stream.advance(1, &mut stats);
        assert!(stream.ensure_window(&mut stats));
        assert_eq!(stream.frame().map(|f| f[0]), Some(7));
    }

    #[test]
    fn test_huge_lateness_saturates_skip() {
        let capture = ScriptedCapture::new(2);
        let mut stream = running(&capture);
        let mut stats = TickStats::default();

        assert!(stream.ensure_window(&mut stats));
        capture.limit_available(Some(0));
        stream.advance(usize::MAX, &mut stats);
        stream.advance(usize::MAX, &mut stats);
        assert_eq!(capture.committed(), 4);

        // An empty window means the device is drained and the skip is dropped
        assert!(!stream.ensure_window(&mut stats));
        capture.limit_available(None);
        assert!(stream.ensure_window(&mut stats));
        assert_eq!(stream.frame().map(|f| f[0]), Some(4));
    }

    #[test]
    fn test_starved_stream_delivers_nothing() {
        let capture = ScriptedCapture::new(2);
        let mut stream = running(&capture);
        let mut stats = TickStats::default();

        capture.limit_available(Some(0));
        assert!(!stream.ensure_window(&mut stats));
        stream.advance(3, &mut stats);

        capture.limit_available(None);
        assert!(stream.ensure_window(&mut stats));
        assert_eq!(stream.frame().map(|f| f[0]), Some(0));
    }

    #[test]
    fn test_open_streams_checks_agreement() {
        let a = ScriptedCapture::new(8);
        let b = ScriptedCapture::new(8);
        let streams = open_streams(
            vec![Box::new(a.clone()), Box::new(b.clone())],
            &[params(8), params(8)],
        )
        .unwrap();
        assert_eq!(streams.len(), 2);
        assert_eq!(streams[0].state(), StreamState::Prepared);

        let c = ScriptedCapture::new(8);
        let d = ScriptedCapture::new(4);
        let err = open_streams(vec![Box::new(c), Box::new(d)], &[params(8), params(8)])
            .err()
            .unwrap();
        assert!(matches!(err, ConfigError::StreamMismatch(_)));

        assert_eq!(
            open_streams(Vec::new(), &[]).err(),
            Some(ConfigError::NoStreams)
        );
    }
}
