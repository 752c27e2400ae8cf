//! Process signals
//!
//! SIGHUP, SIGINT and SIGTERM request shutdown; SIGUSR1 requests a stats
//! dump. Handlers only store to atomics; the main thread forwards them to
//! [`RuntimeFlags`] with [`forward`].

use std::sync::atomic::{AtomicBool, Ordering};

use crate::context::RuntimeFlags;

static SHUTDOWN: AtomicBool = AtomicBool::new(false);
static STATS: AtomicBool = AtomicBool::new(false);

#[cfg(target_os = "linux")]
extern "C" fn on_shutdown(_signal: libc::c_int) {
    SHUTDOWN.store(true, Ordering::Release);
}

#[cfg(target_os = "linux")]
extern "C" fn on_stats(_signal: libc::c_int) {
    STATS.store(true, Ordering::Release);
}

#[cfg(target_os = "linux")]
fn install_handler(signal: libc::c_int, handler: extern "C" fn(libc::c_int)) -> std::io::Result<()> {
    // SAFETY: the handler only touches atomics, which is async-signal-safe,
    // and `action` is fully initialised before being passed to sigaction.
    unsafe {
        let mut action: libc::sigaction = std::mem::zeroed();
        action.sa_sigaction = handler as libc::sighandler_t;
        action.sa_flags = libc::SA_RESTART;
        libc::sigemptyset(&mut action.sa_mask);
        if libc::sigaction(signal, &action, std::ptr::null_mut()) != 0 {
            return Err(std::io::Error::last_os_error());
        }
    }
    Ok(())
}

/// Install the daemon's signal handlers
#[cfg(target_os = "linux")]
pub fn install() -> std::io::Result<()> {
    for signal in [libc::SIGHUP, libc::SIGINT, libc::SIGTERM] {
        install_handler(signal, on_shutdown)?;
    }
    install_handler(libc::SIGUSR1, on_stats)?;
    log::debug!("Signals: handlers installed");
    Ok(())
}

#[cfg(not(target_os = "linux"))]
pub fn install() -> std::io::Result<()> {
    log::warn!("Signals: not supported on this platform");
    Ok(())
}

/// Move pending signal requests into `flags`
pub fn forward(flags: &RuntimeFlags) {
    if SHUTDOWN.swap(false, Ordering::AcqRel) {
        log::info!("Signals: shutdown requested");
        flags.request_shutdown();
    }
    if STATS.swap(false, Ordering::AcqRel) {
        flags.request_stats();
    }
}
