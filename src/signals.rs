//! Process-wide signal latches and the monitor's signal handlers.
//!
//! Handlers never perform I/O and never allocate. Each one optionally arms a
//! short one-shot alarm (when the main flow is blocked on the PID file lock) and
//! then sets exactly one flag. The main flow consumes and clears the flags.
use std::{
    ptr,
    sync::atomic::{AtomicBool, Ordering},
    time::Duration,
};

use libc::c_int;
use nix::{
    errno::Errno,
    sys::signal::{self, SaFlags, SigAction, SigHandler, SigSet, Signal},
};

use crate::constants::NUDGE_ALARM;

/// Signals handled by the monitor itself. SIGALRM is added by the lock primitive.
pub const HANDLED_SIGNALS: [Signal; 3] = [Signal::SIGINT, Signal::SIGTERM, Signal::SIGUSR1];

/// Flags shared between signal handlers and the main flow.
#[derive(Debug)]
pub struct SignalState {
    terminated: AtomicBool,
    reload_requested: AtomicBool,
    timer_fired: AtomicBool,
    waiting: AtomicBool,
}

static STATE: SignalState = SignalState::new();

/// Returns the process-wide signal state.
pub fn state() -> &'static SignalState {
    &STATE
}

impl SignalState {
    const fn new() -> Self {
        Self {
            terminated: AtomicBool::new(false),
            reload_requested: AtomicBool::new(false),
            timer_fired: AtomicBool::new(false),
            waiting: AtomicBool::new(false),
        }
    }

    /// Returns `true` once SIGINT or SIGTERM has been received.
    pub fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::SeqCst)
    }

    /// Returns `true` if SIGUSR1 asked for a configuration reload.
    pub fn reload_requested(&self) -> bool {
        self.reload_requested.load(Ordering::SeqCst)
    }

    /// Consumes a pending reload request.
    pub fn take_reload_request(&self) -> bool {
        self.reload_requested.swap(false, Ordering::SeqCst)
    }

    /// Latches termination. Called from signal context.
    pub fn request_termination(&self) {
        self.terminated.store(true, Ordering::SeqCst);
    }

    /// Latches a reload request. Called from signal context.
    pub fn request_reload(&self) {
        self.reload_requested.store(true, Ordering::SeqCst);
    }

    pub(crate) fn timer_fired(&self) -> bool {
        self.timer_fired.load(Ordering::SeqCst)
    }

    pub(crate) fn set_timer_fired(&self, fired: bool) {
        self.timer_fired.store(fired, Ordering::SeqCst);
    }

    pub(crate) fn is_waiting(&self) -> bool {
        self.waiting.load(Ordering::SeqCst)
    }

    pub(crate) fn set_waiting(&self, waiting: bool) {
        self.waiting.store(waiting, Ordering::SeqCst);
    }

    #[cfg(test)]
    pub(crate) fn reset(&self) {
        self.terminated.store(false, Ordering::SeqCst);
        self.reload_requested.store(false, Ordering::SeqCst);
        self.timer_fired.store(false, Ordering::SeqCst);
        self.waiting.store(false, Ordering::SeqCst);
    }
}

/// Builds the set of signals handled by the monitor.
pub fn handled_set() -> SigSet {
    let mut set = SigSet::empty();
    for signal in HANDLED_SIGNALS {
        set.add(signal);
    }
    set
}

/// Programs the one-shot real-time interval timer. A zero duration disarms it.
///
/// Async-signal-safe: only `setitimer(2)` is called.
pub(crate) fn set_alarm(duration: Duration) -> Result<(), Errno> {
    let value = libc::itimerval {
        it_interval: libc::timeval {
            tv_sec: 0,
            tv_usec: 0,
        },
        it_value: timer_value(duration),
    };

    // SAFETY: `value` is a valid itimerval and the old value is not requested.
    let rc = unsafe { libc::setitimer(libc::ITIMER_REAL, &value, ptr::null_mut()) };
    if rc == 0 { Ok(()) } else { Err(Errno::last()) }
}

/// Converts `duration` for `setitimer`, saturating seconds at `time_t::MAX`.
fn timer_value(duration: Duration) -> libc::timeval {
    libc::timeval {
        tv_sec: libc::time_t::try_from(duration.as_secs()).unwrap_or(libc::time_t::MAX),
        // Always below 1_000_000, which fits every suseconds_t.
        tv_usec: duration.subsec_micros() as libc::suseconds_t,
    }
}

/// Arms the short alarm if the main flow is blocked on the lock, so that the
/// blocking call is interrupted even when this signal raced the mask change.
pub(crate) fn nudge() {
    if STATE.is_waiting() {
        let _ = set_alarm(NUDGE_ALARM);
    }
}

extern "C" fn handle_terminate(_signal: c_int) {
    nudge();
    STATE.request_termination();
}

extern "C" fn handle_reload(_signal: c_int) {
    nudge();
    STATE.request_reload();
}

/// Installs handlers for SIGINT, SIGTERM and SIGUSR1.
///
/// `mask` is blocked while any handler runs, so handlers cannot interrupt each
/// other. No `SA_RESTART`: blocking calls must fail with `EINTR`.
pub fn install_handlers(mask: &SigSet) -> Result<(), Errno> {
    let handlers: [(Signal, extern "C" fn(c_int)); 3] = [
        (Signal::SIGINT, handle_terminate),
        (Signal::SIGTERM, handle_terminate),
        (Signal::SIGUSR1, handle_reload),
    ];

    for (signal, handler) in handlers {
        let action = SigAction::new(SigHandler::Handler(handler), SaFlags::empty(), *mask);
        // SAFETY: the handlers only touch atomics and call setitimer.
        unsafe { signal::sigaction(signal, &action) }?;
    }

    Ok(())
}

/// Ignores SIGPIPE so a vanished control endpoint surfaces as `EPIPE`.
pub fn ignore_sigpipe() -> Result<(), Errno> {
    // SAFETY: installing SIG_IGN has no handler code to run.
    unsafe { signal::signal(Signal::SIGPIPE, SigHandler::SigIgn) }?;
    Ok(())
}
