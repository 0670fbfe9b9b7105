//! Alarm-interruptible read lock on a PID file.
//!
//! The owner of a PID file holds its write lock until it exits, so a granted
//! read lock proves the owner is gone. [`PidLock::acquire_read_lock`] blocks in
//! `F_SETLKW` with the handled signals unblocked and a one-shot `ITIMER_REAL`
//! bounding the wait.
//!
//! `fcntl(2)` cannot unblock signals and start waiting atomically. A signal that
//! lands between the mask change and the start of the wait would not interrupt
//! it, so every handler that sees the main flow waiting arms a 1 ms alarm whose
//! delivery does interrupt the call.
use std::{
    mem,
    os::fd::AsRawFd,
    time::{Duration, Instant},
};

use libc::c_int;
use nix::{
    errno::Errno,
    fcntl::{FcntlArg, fcntl},
    sys::signal::{self, SaFlags, SigAction, SigHandler, SigSet, SigmaskHow, Signal},
};
use tracing::{trace, warn};

use crate::{
    constants::NUDGE_ALARM,
    error::LockError,
    pidfile::{PidFile, lock_request},
    signals,
};

/// What the lock primitive should do after a wake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WakeAction {
    /// Keep going: report success or error, or retry after an interruption.
    Continue,
    /// Stop waiting and report [`LockError::Cancelled`].
    Cancel,
}

/// Hook invoked every time the blocking lock call returns.
pub trait LockWaitHook {
    /// Receives the raw result of the lock call.
    fn on_wake(&mut self, result: &Result<(), Errno>) -> WakeAction;
}

impl<F> LockWaitHook for F
where
    F: FnMut(&Result<(), Errno>) -> WakeAction,
{
    fn on_wake(&mut self, result: &Result<(), Errno>) -> WakeAction {
        self(result)
    }
}

extern "C" fn handle_alarm(_signal: c_int) {
    signals::nudge();
    signals::state().set_timer_fired(true);
}

/// Prepares the process for lock waits.
///
/// Adds SIGALRM to `mask`, installs the SIGALRM handler (blocking `mask` while
/// it runs) and makes `mask` the signal mask of the calling thread. Call once,
/// before any [`PidLock::acquire_read_lock`].
pub fn init_lock_subsystem(mask: &mut SigSet) -> Result<(), Errno> {
    mask.add(Signal::SIGALRM);

    let action = SigAction::new(SigHandler::Handler(handle_alarm), SaFlags::empty(), *mask);
    // SAFETY: the handler only touches atomics and calls setitimer.
    unsafe { signal::sigaction(Signal::SIGALRM, &action) }?;

    signal::pthread_sigmask(SigmaskHow::SIG_SETMASK, Some(&*mask), None)
}

/// Returns `true` if a SIGALRM is pending for the calling thread or process.
pub fn sigalrm_pending() -> bool {
    // SAFETY: `set` is initialised by sigemptyset before use.
    unsafe {
        let mut set: libc::sigset_t = mem::zeroed();
        libc::sigemptyset(&mut set);
        if libc::sigpending(&mut set) != 0 {
            return false;
        }
        libc::sigismember(&set, libc::SIGALRM) == 1
    }
}

/// Consumes every pending SIGALRM. SIGALRM must be blocked.
fn drain_pending_alarm() {
    let mut alarm = SigSet::empty();
    alarm.add(Signal::SIGALRM);
    while sigalrm_pending() {
        if alarm.wait().is_err() {
            break;
        }
    }
}

/// Read-lock waiter over an open PID file.
#[derive(Debug)]
pub struct PidLock {
    pidfile: PidFile,
    wait_mask: SigSet,
}

impl PidLock {
    /// Wraps `pidfile`. While waiting, every signal except those in `handled`
    /// is blocked; `handled` should be the mask passed to
    /// [`init_lock_subsystem`].
    pub fn new(pidfile: PidFile, handled: &SigSet) -> Self {
        let mut wait_mask = SigSet::all();
        for signal in Signal::iterator() {
            if handled.contains(signal) {
                wait_mask.remove(signal);
            }
        }

        Self { pidfile, wait_mask }
    }

    /// Returns the underlying PID file.
    pub fn pidfile(&self) -> &PidFile {
        &self.pidfile
    }

    /// Returns the mask applied while waiting.
    pub fn wait_mask(&self) -> &SigSet {
        &self.wait_mask
    }

    /// Waits for a read lock on the PID file for at most `timeout`.
    ///
    /// A zero `timeout` waits without a deadline. `hook` sees every wake and
    /// may cancel the wait; it runs before the result is interpreted, so a
    /// cancellation wins over a lock that was just granted.
    ///
    /// Returns `Ok(())` once the lock is granted, [`LockError::TimedOut`] after
    /// the deadline, [`LockError::Cancelled`] when the hook cancels, or the OS
    /// error of the lock call.
    pub fn acquire_read_lock(
        &self,
        timeout: Duration,
        mut hook: Option<&mut dyn LockWaitHook>,
    ) -> Result<(), LockError> {
        let state = signals::state();
        state.set_timer_fired(false);

        let deadline = (!timeout.is_zero()).then(|| Instant::now() + timeout);
        signals::set_alarm(timeout)?;

        let request = lock_request(libc::F_RDLCK as libc::c_short);
        let fd = self.pidfile.as_raw_fd();

        let result = loop {
            let mut previous = SigSet::empty();
            state.set_waiting(true);
            if let Err(errno) = signal::pthread_sigmask(
                SigmaskHow::SIG_SETMASK,
                Some(&self.wait_mask),
                Some(&mut previous),
            ) {
                state.set_waiting(false);
                break Err(LockError::Other(errno));
            }

            let rc = fcntl(fd, FcntlArg::F_SETLKW(&request)).map(drop);

            let restored = signal::pthread_sigmask(SigmaskHow::SIG_SETMASK, Some(&previous), None);
            state.set_waiting(false);
            if let Err(errno) = restored {
                break Err(LockError::Other(errno));
            }

            if let Some(hook) = hook.as_deref_mut()
                && hook.on_wake(&rc) == WakeAction::Cancel
            {
                break Err(LockError::Cancelled);
            }

            match rc {
                Ok(()) => break Ok(()),
                Err(Errno::EINTR) => {}
                Err(errno) => break Err(errno.into()),
            }

            if state.timer_fired() {
                state.set_timer_fired(false);
                if let Some(deadline) = deadline {
                    let now = Instant::now();
                    if now >= deadline {
                        break Err(LockError::TimedOut);
                    }

                    // A nudge replaced the interval timer; restore the remainder.
                    let remaining = (deadline - now).max(NUDGE_ALARM);
                    trace!("Re-arming lock timer for {remaining:?}");
                    if let Err(errno) = signals::set_alarm(remaining) {
                        break Err(LockError::Other(errno));
                    }
                }
            }
        };

        let disarmed = signals::set_alarm(Duration::ZERO);
        drain_pending_alarm();
        debug_assert!(!sigalrm_pending(), "SIGALRM leaked out of the lock wait");

        settle(result, disarmed)
    }
}

/// Combines the wait outcome with the result of disarming the timer. A
/// failed disarm replaces a success and is logged otherwise.
fn settle(result: Result<(), LockError>, disarmed: Result<(), Errno>) -> Result<(), LockError> {
    match (result, disarmed) {
        (result, Ok(())) => result,
        (Ok(()), Err(errno)) => Err(LockError::Other(errno)),
        (result, Err(errno)) => {
            warn!("Failed to disarm the lock timer: {errno}");
            result
        }
    }
}
