//! Real-time promotion of the audio thread
//!
//! With the `embedded-rt` feature on Linux the calling thread is moved to
//! `SCHED_FIFO` and, optionally, all current and future pages are locked.
//! Every failure is logged and the thread keeps running at normal priority.

use crate::config::RealtimeConfig;

/// Promote the calling thread according to `config`
///
/// Returns `true` when the scheduler change took effect.
#[cfg(all(target_os = "linux", feature = "embedded-rt"))]
pub fn promote_current_thread(config: &RealtimeConfig) -> bool {
    if !config.enabled {
        log::info!("RT: disabled by configuration");
        return false;
    }

    if config.lock_memory {
        // SAFETY: mlockall takes only flags and touches no Rust-managed memory
        let rc = unsafe { libc::mlockall(libc::MCL_CURRENT | libc::MCL_FUTURE) };
        if rc != 0 {
            log::warn!("RT: mlockall failed: {}", std::io::Error::last_os_error());
        } else {
            log::debug!("RT: memory locked");
        }
    }

    // SAFETY: pure queries on a constant policy
    let (min, max) = unsafe {
        (
            libc::sched_get_priority_min(libc::SCHED_FIFO),
            libc::sched_get_priority_max(libc::SCHED_FIFO),
        )
    };
    let priority = config.priority.clamp(min, max);
    if priority != config.priority {
        log::warn!(
            "RT: priority {} outside {}..={}, using {}",
            config.priority,
            min,
            max,
            priority
        );
    }

    let param = libc::sched_param {
        sched_priority: priority,
    };
    // SAFETY: `param` outlives the call and pthread_self is always valid
    let rc = unsafe { libc::pthread_setschedparam(libc::pthread_self(), libc::SCHED_FIFO, &param) };
    if rc != 0 {
        log::warn!(
            "RT: SCHED_FIFO {} refused: {}",
            priority,
            std::io::Error::from_raw_os_error(rc)
        );
        return false;
    }
    log::info!("RT: audio thread running SCHED_FIFO priority {}", priority);
    true
}

#[cfg(not(all(target_os = "linux", feature = "embedded-rt")))]
pub fn promote_current_thread(config: &RealtimeConfig) -> bool {
    if config.enabled {
        log::info!("RT: real-time promotion not built in, running at normal priority");
    }
    false
}
