//! Sample clock
//!
//! A periodic timer armed at the stream's sample rate paces the tick loop.
//! `wait` blocks until at least one period has elapsed and returns the number
//! of periods since the previous call.

use std::io;

/// Periodic tick source
pub trait SampleClock: Send {
    /// Block until the next deadline; returns the number of elapsed periods
    fn wait(&mut self) -> io::Result<u64>;

    /// Restart the cadence from now, dropping any backlog
    fn rearm(&mut self) -> io::Result<()>;
}

/// `timerfd` periodic timer
#[cfg(target_os = "linux")]
pub struct TimerFdClock {
    fd: std::os::fd::OwnedFd,
    period_ns: u64,
}

#[cfg(target_os = "linux")]
impl TimerFdClock {
    pub fn new(sample_rate: u32) -> io::Result<Self> {
        use std::os::fd::FromRawFd;

        if sample_rate == 0 {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "sample rate is zero"));
        }
        // SAFETY: plain syscall, the returned descriptor is checked below
        let raw = unsafe { libc::timerfd_create(libc::CLOCK_MONOTONIC, libc::TFD_CLOEXEC) };
        if raw < 0 {
            return Err(io::Error::last_os_error());
        }
        // SAFETY: `raw` is a freshly created descriptor owned by nobody else
        let fd = unsafe { std::os::fd::OwnedFd::from_raw_fd(raw) };

        let mut clock = Self {
            fd,
            period_ns: 1_000_000_000 / u64::from(sample_rate),
        };
        clock.rearm()?;
        log::debug!(
            "Audio: sample clock armed at {} Hz ({} ns)",
            sample_rate,
            clock.period_ns
        );
        Ok(clock)
    }
}

#[cfg(target_os = "linux")]
impl SampleClock for TimerFdClock {
    fn wait(&mut self) -> io::Result<u64> {
        use std::os::fd::AsRawFd;

        let mut expirations: u64 = 0;
        loop {
            // SAFETY: reading 8 bytes into a live u64 from an open timerfd
            let n = unsafe {
                libc::read(
                    self.fd.as_raw_fd(),
                    (&mut expirations as *mut u64).cast(),
                    std::mem::size_of::<u64>(),
                )
            };
            if n == std::mem::size_of::<u64>() as isize {
                return Ok(expirations);
            }
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::Interrupted {
                return Err(err);
            }
        }
    }

    fn rearm(&mut self) -> io::Result<()> {
        use std::os::fd::AsRawFd;

        let period = libc::timespec {
            tv_sec: (self.period_ns / 1_000_000_000) as libc::time_t,
            tv_nsec: (self.period_ns % 1_000_000_000) as libc::c_long,
        };
        let spec = libc::itimerspec {
            it_interval: period,
            it_value: period,
        };
        // SAFETY: `spec` is a valid itimerspec; old value is not requested
        let rc = unsafe {
            libc::timerfd_settime(self.fd.as_raw_fd(), 0, &spec, std::ptr::null_mut())
        };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
}
