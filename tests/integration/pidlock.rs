//! Lock-wait behaviour against real writer processes.
//!
//! Runs without the libtest harness so every wait happens on the main thread,
//! where the process-directed SIGALRM is delivered.

#[path = "common/mod.rs"]
mod common;

use std::{
    fs,
    path::Path,
    thread,
    time::{Duration, Instant},
};

use common::{fork_child, reap, wait_for_owner};
use nix::{
    errno::Errno,
    sys::signal::{self, SigSet, Signal},
    unistd::{Pid, getppid, pause},
};
use pfc_monitor::{
    error::{LockError, PidFileError},
    pidfile::PidFile,
    pidlock::{self, PidLock, WakeAction, sigalrm_pending},
    signals,
};
use tempfile::tempdir;

fn hold_lock(path: &Path) -> Pid {
    let child_path = path.to_path_buf();
    let pid = fork_child(move || {
        let _pidfile = PidFile::install(&child_path).expect("writer failed to install PID file");
        loop {
            pause();
        }
    });
    assert_eq!(wait_for_owner(path), pid);
    pid
}

fn times_out_while_writer_holds_lock(mask: &SigSet) {
    for seconds in [1, 2] {
        let temp = tempdir().unwrap();
        let path = temp.path().join("pfcd.pid");
        let writer = hold_lock(&path);

        let lock = PidLock::new(PidFile::open_read_only(&path).unwrap(), mask);
        let timeout = Duration::from_secs(seconds);
        let started = Instant::now();
        assert_eq!(lock.acquire_read_lock(timeout, None), Err(LockError::TimedOut));
        let elapsed = started.elapsed();

        assert!(elapsed >= timeout, "returned after {elapsed:?}, before {timeout:?}");
        assert!(elapsed < timeout + Duration::from_secs(1), "returned late: {elapsed:?}");
        assert!(!sigalrm_pending());
        reap(writer);
    }
}

fn returns_when_writer_exits(mask: &SigSet) {
    let temp = tempdir().unwrap();
    let path = temp.path().join("pfcd.pid");
    let child_path = path.clone();
    let writer = fork_child(move || {
        let _pidfile = PidFile::install(&child_path).expect("writer failed to install PID file");
        thread::sleep(Duration::from_millis(500));
    });
    wait_for_owner(&path);

    let lock = PidLock::new(PidFile::open_read_only(&path).unwrap(), mask);
    let started = Instant::now();
    assert_eq!(lock.acquire_read_lock(Duration::from_secs(5), None), Ok(()));
    assert!(started.elapsed() < Duration::from_secs(3));
    assert!(!sigalrm_pending());
    reap(writer);
}

fn reload_signal_does_not_shorten_timeout(mask: &SigSet) {
    let temp = tempdir().unwrap();
    let path = temp.path().join("pfcd.pid");
    let writer = hold_lock(&path);
    let signaller = fork_child(|| {
        thread::sleep(Duration::from_millis(200));
        signal::kill(getppid(), Signal::SIGUSR1).expect("failed to signal parent");
    });

    let lock = PidLock::new(PidFile::open_read_only(&path).unwrap(), mask);
    let mut interruptions = 0;
    let mut hook = |result: &Result<(), Errno>| {
        if *result == Err(Errno::EINTR) {
            interruptions += 1;
        }
        WakeAction::Continue
    };

    let timeout = Duration::from_secs(1);
    let started = Instant::now();
    assert_eq!(
        lock.acquire_read_lock(timeout, Some(&mut hook)),
        Err(LockError::TimedOut)
    );
    assert!(started.elapsed() >= timeout);
    assert!(interruptions >= 2, "saw {interruptions} interruptions");
    assert!(signals::state().take_reload_request());
    assert!(!sigalrm_pending());

    reap(signaller);
    reap(writer);
}

fn cancellation_wins_over_free_lock(mask: &SigSet) {
    let temp = tempdir().unwrap();
    let path = temp.path().join("pfcd.pid");
    fs::write(&path, "1\n").unwrap();

    let lock = PidLock::new(PidFile::open_read_only(&path).unwrap(), mask);
    let mut calls = 0;
    let mut hook = |_: &Result<(), Errno>| {
        calls += 1;
        WakeAction::Cancel
    };
    assert_eq!(
        lock.acquire_read_lock(Duration::from_secs(5), Some(&mut hook)),
        Err(LockError::Cancelled)
    );
    assert_eq!(calls, 1);
    assert!(!sigalrm_pending());
}

fn install_reports_the_owner(_mask: &SigSet) {
    let temp = tempdir().unwrap();
    let path = temp.path().join("pfcd.pid");
    let writer = hold_lock(&path);

    let pidfile = PidFile::open_read_only(&path).unwrap();
    assert_eq!(pidfile.owner().unwrap(), Some(writer));
    assert_eq!(
        fs::read_to_string(&path).unwrap().trim(),
        writer.as_raw().to_string()
    );

    match PidFile::install(&path) {
        Err(PidFileError::Locked { pid, .. }) => assert_eq!(pid, writer.as_raw()),
        other => panic!("expected a lock conflict, got {other:?}"),
    }
    reap(writer);
}

fn main() {
    let mut mask = signals::handled_set();
    pidlock::init_lock_subsystem(&mut mask).expect("failed to initialise lock subsystem");
    signals::install_handlers(&mask).expect("failed to install signal handlers");

    let tests: [(&str, fn(&SigSet)); 5] = [
        ("times_out_while_writer_holds_lock", times_out_while_writer_holds_lock),
        ("returns_when_writer_exits", returns_when_writer_exits),
        ("reload_signal_does_not_shorten_timeout", reload_signal_does_not_shorten_timeout),
        ("cancellation_wins_over_free_lock", cancellation_wins_over_free_lock),
        ("install_reports_the_owner", install_reports_the_owner),
    ];

    println!("running {} tests", tests.len());
    for (name, test) in tests {
        println!("test {name} ...");
        test(&mask);
        println!("test {name} ... ok");
    }
    println!("test result: ok. {} passed", tests.len());
}
