//! End-to-end runs of the monitor binary against a forked fake daemon.
//!
//! Runs without the libtest harness because the fake daemon is forked from
//! the test process.

#[path = "common/mod.rs"]
mod common;

use std::{
    fs::{self, File, OpenOptions},
    io::Write,
    os::unix::fs::PermissionsExt,
    path::Path,
    process::Stdio,
    thread,
    time::{Duration, Instant},
};

use common::{
    DaemonMode, FakeDaemon, fork_child, is_process_alive, monitor_command, reap, send_signal,
    wait_for_exit, wait_for_lines, wait_for_owner, wait_for_text, write_configs,
};
use nix::{
    sys::{
        signal::{self, SigHandler, Signal},
        wait::{WaitStatus, waitpid},
    },
    unistd::{Pid, User, getuid, pause},
};
use pfc_monitor::pidfile::PidFile;
use tempfile::tempdir;

const EXIT_WAIT: Duration = Duration::from_secs(10);

fn survives_cycles_and_stops_on_sigterm() {
    let temp = tempdir().unwrap();
    let dir = temp.path();
    write_configs(dir, 1, 1);
    let daemon = FakeDaemon::spawn(dir, DaemonMode::Respond);

    let mut monitor = monitor_command(dir)
        .stderr(Stdio::null())
        .spawn()
        .expect("failed to start monitor");

    wait_for_lines(&daemon.pings_log(), 3);
    assert!(monitor.try_wait().unwrap().is_none(), "monitor exited early");
    assert!(is_process_alive(monitor.id()));
    assert!(dir.join("pfc_monitor.pid").exists());

    send_signal(&monitor, Signal::SIGTERM);
    let status = wait_for_exit(&mut monitor, EXIT_WAIT);
    assert_eq!(status.code(), Some(0));
    assert!(
        !dir.join("pfc_monitor.pid").exists(),
        "monitor PID file should be removed on exit"
    );
}

fn daemon_exit_is_reported() {
    let temp = tempdir().unwrap();
    let dir = temp.path();
    write_configs(dir, 30, 1);
    let mut daemon = FakeDaemon::spawn(dir, DaemonMode::Respond);

    let log = dir.join("monitor.log");
    let mut monitor = monitor_command(dir)
        .stderr(File::create(&log).unwrap())
        .spawn()
        .expect("failed to start monitor");

    wait_for_lines(&daemon.pings_log(), 1);
    daemon.stop();

    let status = wait_for_exit(&mut monitor, EXIT_WAIT);
    assert_eq!(status.code(), Some(1));
    assert!(fs::read_to_string(&log).unwrap().contains("pfcd is not running"));
}

fn silent_daemon_is_reported_stalled() {
    let temp = tempdir().unwrap();
    let dir = temp.path();
    write_configs(dir, 30, 1);
    let _daemon = FakeDaemon::spawn(dir, DaemonMode::Silent);

    let log = dir.join("monitor.log");
    let mut monitor = monitor_command(dir)
        .stderr(File::create(&log).unwrap())
        .spawn()
        .expect("failed to start monitor");

    let status = wait_for_exit(&mut monitor, EXIT_WAIT);
    assert_eq!(status.code(), Some(2));
    assert!(fs::read_to_string(&log).unwrap().contains("did not respond"));
}

fn kill_mode_stops_running_monitor() {
    let temp = tempdir().unwrap();
    let dir = temp.path();
    write_configs(dir, 30, 1);
    let daemon = FakeDaemon::spawn(dir, DaemonMode::Respond);

    let mut monitor = monitor_command(dir)
        .stderr(Stdio::null())
        .spawn()
        .expect("failed to start monitor");
    wait_for_lines(&daemon.pings_log(), 1);

    let output = monitor_command(dir)
        .args(["-K", "5"])
        .output()
        .expect("failed to run kill mode");
    assert_eq!(output.status.code(), Some(0), "{output:?}");

    let status = wait_for_exit(&mut monitor, EXIT_WAIT);
    assert_eq!(status.code(), Some(0));
    assert!(!dir.join("pfc_monitor.pid").exists());
}

/// Forks a process that owns `path` the way a monitor does but ignores SIGTERM.
fn hold_ignoring_sigterm(path: &Path) -> Pid {
    let child_path = path.to_path_buf();
    let pid = fork_child(move || {
        unsafe { signal::signal(Signal::SIGTERM, SigHandler::SigIgn) }
            .expect("failed to ignore SIGTERM");
        let _pidfile = PidFile::install(&child_path).expect("failed to install PID file");
        loop {
            pause();
        }
    });
    assert_eq!(wait_for_owner(path), pid);
    pid
}

fn kill_mode_escalates_to_sigkill() {
    let temp = tempdir().unwrap();
    let dir = temp.path();
    write_configs(dir, 30, 1);
    let holder = hold_ignoring_sigterm(&dir.join("pfc_monitor.pid"));

    let started = Instant::now();
    let output = monitor_command(dir)
        .args(["-K", "1"])
        .output()
        .expect("failed to run kill mode");
    assert_eq!(output.status.code(), Some(0), "{output:?}");
    assert!(started.elapsed() >= Duration::from_secs(1));

    match waitpid(holder, None).unwrap() {
        WaitStatus::Signaled(pid, Signal::SIGKILL, _) => assert_eq!(pid, holder),
        other => panic!("holder ended with {other:?}"),
    }
}

fn kill_mode_reports_unsignalable_monitor() {
    if !getuid().is_root() {
        println!("skipped: switching to an unprivileged account needs root");
        return;
    }
    let Ok(Some(nobody)) = User::from_name("nobody") else {
        println!("skipped: no 'nobody' account");
        return;
    };

    let temp = tempdir().unwrap();
    let dir = temp.path();
    fs::set_permissions(dir, fs::Permissions::from_mode(0o755)).unwrap();
    write_configs(dir, 30, 1);
    let mut conf = OpenOptions::new()
        .append(true)
        .open(dir.join("pfcd.conf"))
        .unwrap();
    writeln!(conf, "  admin_user: {}", nobody.name).unwrap();

    let holder = hold_ignoring_sigterm(&dir.join("pfc_monitor.pid"));

    let output = monitor_command(dir)
        .args(["-K", "1"])
        .output()
        .expect("failed to run kill mode");
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert_eq!(output.status.code(), Some(3), "unexpected stderr: {stderr}");
    assert!(
        stderr.contains(&format!("still running: pid = {holder}")),
        "unexpected stderr: {stderr}"
    );
    assert!(is_process_alive(holder.as_raw() as u32));
    reap(holder);
}

fn saturated_daemon_is_reported_stalled() {
    let temp = tempdir().unwrap();
    let dir = temp.path();
    write_configs(dir, 30, 1);
    let _daemon = FakeDaemon::spawn(dir, DaemonMode::Saturated);

    let log = dir.join("monitor.log");
    let mut monitor = monitor_command(dir)
        .stderr(File::create(&log).unwrap())
        .spawn()
        .expect("failed to start monitor");

    let status = wait_for_exit(&mut monitor, EXIT_WAIT);
    assert_eq!(status.code(), Some(2));
    assert!(fs::read_to_string(&log).unwrap().contains("did not respond"));
}

fn sigterm_stops_monitor_waiting_to_connect() {
    let temp = tempdir().unwrap();
    let dir = temp.path();
    write_configs(dir, 30, 60);
    let _daemon = FakeDaemon::spawn(dir, DaemonMode::Saturated);

    let mut monitor = monitor_command(dir)
        .stderr(Stdio::null())
        .spawn()
        .expect("failed to start monitor");
    wait_for_owner(&dir.join("pfc_monitor.pid"));
    thread::sleep(Duration::from_millis(500));

    let started = Instant::now();
    send_signal(&monitor, Signal::SIGTERM);
    let status = wait_for_exit(&mut monitor, EXIT_WAIT);
    assert_eq!(status.code(), Some(0));
    assert!(started.elapsed() < Duration::from_secs(5));
}

fn reload_signal_rereads_configuration() {
    let temp = tempdir().unwrap();
    let dir = temp.path();
    write_configs(dir, 30, 1);
    let daemon = FakeDaemon::spawn(dir, DaemonMode::Respond);

    let log = dir.join("monitor.log");
    let mut monitor = monitor_command(dir)
        .arg("-d")
        .stderr(File::create(&log).unwrap())
        .spawn()
        .expect("failed to start monitor");
    wait_for_lines(&daemon.pings_log(), 1);

    write_configs(dir, 1, 1);
    send_signal(&monitor, Signal::SIGUSR1);
    wait_for_text(&log, "Reloading");

    // The shorter interval takes effect without waiting out the old one.
    wait_for_lines(&daemon.pings_log(), 3);
    assert!(monitor.try_wait().unwrap().is_none(), "monitor exited early");

    send_signal(&monitor, Signal::SIGINT);
    let status = wait_for_exit(&mut monitor, EXIT_WAIT);
    assert_eq!(status.code(), Some(0));
}

fn second_monitor_is_refused() {
    let temp = tempdir().unwrap();
    let dir = temp.path();
    write_configs(dir, 30, 1);
    let _daemon = FakeDaemon::spawn(dir, DaemonMode::Respond);

    let mut first = monitor_command(dir)
        .stderr(Stdio::null())
        .spawn()
        .expect("failed to start monitor");
    let owner = wait_for_owner(&dir.join("pfc_monitor.pid"));
    assert_eq!(owner.as_raw() as u32, first.id());

    let output = monitor_command(dir).output().expect("failed to run second monitor");
    assert_eq!(output.status.code(), Some(3));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(
        stderr.contains(&format!("already running: pid = {}", first.id())),
        "unexpected stderr: {stderr}"
    );

    send_signal(&first, Signal::SIGTERM);
    assert_eq!(wait_for_exit(&mut first, EXIT_WAIT).code(), Some(0));
}

fn main() {
    let tests: [(&str, fn()); 10] = [
        ("survives_cycles_and_stops_on_sigterm", survives_cycles_and_stops_on_sigterm),
        ("daemon_exit_is_reported", daemon_exit_is_reported),
        ("silent_daemon_is_reported_stalled", silent_daemon_is_reported_stalled),
        ("kill_mode_stops_running_monitor", kill_mode_stops_running_monitor),
        ("kill_mode_escalates_to_sigkill", kill_mode_escalates_to_sigkill),
        ("kill_mode_reports_unsignalable_monitor", kill_mode_reports_unsignalable_monitor),
        ("saturated_daemon_is_reported_stalled", saturated_daemon_is_reported_stalled),
        ("sigterm_stops_monitor_waiting_to_connect", sigterm_stops_monitor_waiting_to_connect),
        ("reload_signal_rereads_configuration", reload_signal_rereads_configuration),
        ("second_monitor_is_refused", second_monitor_is_refused),
    ];

    println!("running {} tests", tests.len());
    for (name, test) in tests {
        println!("test {name} ...");
        test();
        println!("test {name} ... ok");
    }
    println!("test result: ok. {} passed", tests.len());
}
