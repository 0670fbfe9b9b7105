//! The monitor context and its ping/sleep control loop.
//!
//! The monitor proves the daemon alive two ways. A ping over the control socket
//! shows that it still answers requests. A wait for a read lock on its PID file
//! shows that it has not exited, because the daemon holds the write lock for its
//! whole life and a granted read lock means the writer is gone.
use std::{
    cell::RefCell,
    convert::Infallible,
    path::{Path, PathBuf},
    rc::Rc,
    time::Duration,
};

use nix::{
    errno::Errno,
    sys::signal::{self, SigSet, SigmaskHow, Signal},
    unistd::Pid,
};
use tracing::{debug, info, warn};

use crate::{
    conf::{ConfFile, ErrorCallback, MonitorConf},
    constants::{CONTROL_DEFAULT_TIMEOUT, DAEMON_NAME, DEFAULT_INTERVAL, DEFAULT_TIMEOUT},
    error::{ConfError, ErrorMessage, LockError, MonitorError, PidFileError},
    ipc::{ControlClient, ControlCommand, ControlError, IoWaitPolicy},
    pidfile::PidFile,
    pidlock::{self, PidLock, WakeAction},
    signals,
};

/// Builds a callback that stores every reported message in `sink`.
fn error_sink(sink: &Rc<RefCell<ErrorMessage>>) -> ErrorCallback {
    let sink = Rc::clone(sink);
    Box::new(move |message: &str| sink.borrow_mut().set(message))
}

/// Reloadable `interval` and `timeout` settings.
#[derive(Debug)]
pub struct MonitorConfig {
    path: PathBuf,
    handle: Option<ConfFile<MonitorConf>>,
    interval: u32,
    timeout: u32,
    last_error: Rc<RefCell<ErrorMessage>>,
}

impl MonitorConfig {
    /// Creates the settings with default values. Nothing is read yet.
    pub fn new(path: impl Into<PathBuf>, last_error: Rc<RefCell<ErrorMessage>>) -> Self {
        Self {
            path: path.into(),
            handle: None,
            interval: DEFAULT_INTERVAL,
            timeout: DEFAULT_TIMEOUT,
            last_error,
        }
    }

    /// Seconds between pings.
    pub fn interval(&self) -> u32 {
        self.interval
    }

    /// Seconds to wait for a ping response; `0` defers to the client default.
    pub fn timeout(&self) -> u32 {
        self.timeout
    }

    /// Returns the configuration file path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Opens the file on the first call and reloads it afterwards.
    ///
    /// A missing file is silent. Any other failure is logged and keeps the
    /// current values, which are the defaults until a load succeeds.
    pub fn load_or_reload(&mut self) {
        self.last_error.borrow_mut().clear();

        match self.read().map(|conf| (conf.interval(), conf.timeout())) {
            Ok((interval, timeout)) => {
                self.interval = interval;
                self.timeout = timeout;
                debug!(
                    "Loaded {}: interval = {interval}s, timeout = {timeout}s",
                    self.path.display()
                );
            }
            Err(ConfError::NotFound(_)) => {
                debug!("{} not found, keeping current settings", self.path.display());
            }
            Err(err) => {
                let detail = self.last_error.borrow();
                if detail.is_empty() {
                    warn!("Failed to load monitor configuration: {err}");
                } else {
                    warn!("Failed to load monitor configuration: {}", detail.as_str());
                }
            }
        }
    }

    fn read(&mut self) -> Result<&MonitorConf, ConfError> {
        match self.handle {
            Some(ref mut handle) => {
                handle.reload()?;
                Ok(handle.document())
            }
            None => {
                let handle = ConfFile::open(&self.path, Some(error_sink(&self.last_error)))?;
                Ok(self.handle.insert(handle).document())
            }
        }
    }
}

/// Paths and switches needed to start the monitor.
#[derive(Debug, Clone)]
pub struct MonitorOptions {
    /// This monitor's own PID file.
    pub pid_file: PathBuf,
    /// The monitor configuration file.
    pub monitor_conf: PathBuf,
    /// The daemon's working directory, home of its control socket.
    pub work_dir: PathBuf,
    /// The daemon's PID file.
    pub daemon_pid_file: PathBuf,
    /// Whether logs go to syslog.
    pub use_syslog: bool,
}

/// A running monitor.
#[derive(Debug)]
pub struct Monitor {
    options: MonitorOptions,
    config: MonitorConfig,
    pidfile: PidFile,
    pidlock: PidLock,
    target_pid: Pid,
    client: ControlClient,
    last_error: Rc<RefCell<ErrorMessage>>,
}

impl Monitor {
    /// Claims the monitor PID file, sets up signal handling and opens the
    /// daemon's PID file and control socket.
    pub fn initialize(options: MonitorOptions) -> Result<Self, MonitorError> {
        let mut mask = signals::handled_set();
        signal::pthread_sigmask(SigmaskHow::SIG_BLOCK, Some(&mask), None)
            .map_err(MonitorError::Signal)?;

        let pidfile = match PidFile::install(&options.pid_file) {
            Ok(pidfile) => pidfile,
            Err(PidFileError::Locked { pid, .. }) => {
                return Err(MonitorError::AlreadyRunning { pid });
            }
            Err(err) => return Err(err.into()),
        };
        pidfile.unlink_on_exit()?;

        signals::ignore_sigpipe().map_err(MonitorError::Signal)?;
        pidlock::init_lock_subsystem(&mut mask).map_err(MonitorError::Signal)?;
        signals::install_handlers(&mask).map_err(MonitorError::Signal)?;

        let last_error = Rc::new(RefCell::new(ErrorMessage::default()));
        let client = ControlClient::new(&options.work_dir, Some(error_sink(&last_error)));

        let daemon_pidfile = match PidFile::open_read_only(&options.daemon_pid_file) {
            Ok(daemon_pidfile) => daemon_pidfile,
            Err(PidFileError::NotFound(path)) => {
                debug!("{} does not exist", path.display());
                return Err(MonitorError::DaemonNotRunning);
            }
            Err(err) => return Err(err.into()),
        };
        let target_pid = daemon_pidfile
            .owner()?
            .ok_or(MonitorError::DaemonNotRunning)?;

        match client.check_permission() {
            Ok(()) => {}
            Err(ControlError::NotRunning(_)) => return Err(MonitorError::DaemonNotRunning),
            Err(ControlError::PermissionDenied(_)) => return Err(MonitorError::PermissionDenied),
            Err(err) => return Err(err.into()),
        }

        let pidlock = PidLock::new(daemon_pidfile, &mask);
        signal::pthread_sigmask(SigmaskHow::SIG_SETMASK, Some(&mask), None)
            .map_err(MonitorError::Signal)?;

        let mut config = MonitorConfig::new(&options.monitor_conf, Rc::clone(&last_error));
        config.load_or_reload();

        info!(
            "Monitoring {DAEMON_NAME} (pid {target_pid}) every {}s",
            config.interval()
        );

        Ok(Self {
            options,
            config,
            pidfile,
            pidlock,
            target_pid,
            client,
            last_error,
        })
    }

    /// PID of the monitored daemon.
    pub fn target_pid(&self) -> Pid {
        self.target_pid
    }

    /// Current settings.
    pub fn config(&self) -> &MonitorConfig {
        &self.config
    }

    /// This monitor's own PID file.
    pub fn pid_file(&self) -> &Path {
        self.pidfile.path()
    }

    /// Whether logs go to syslog.
    pub fn use_syslog(&self) -> bool {
        self.options.use_syslog
    }

    /// Sends a no-op request to the daemon and waits for its answer.
    pub fn ping(&mut self) -> Result<(), MonitorError> {
        self.last_error.borrow_mut().clear();

        let timeout = effective_timeout(self.config.timeout());
        let policy = IoWaitPolicy::new(
            *self.pidlock.wait_mask(),
            Box::new(|| signals::state().is_terminated()),
        );

        let result = self
            .client
            .create_session(timeout, policy)
            .and_then(|mut session| session.execute(&ControlCommand::Nop));

        match result {
            Ok(_) => {
                debug!("{DAEMON_NAME} answered ping");
                Ok(())
            }
            Err(ControlError::NotRunning(_)) => Err(MonitorError::DaemonNotRunning),
            Err(ControlError::TimedOut(timeout)) => Err(MonitorError::DaemonStalled { timeout }),
            Err(ControlError::Interrupted) => Err(MonitorError::Terminated),
            Err(err) => Err(err.into()),
        }
    }

    /// Waits `interval` seconds for the daemon to exit.
    ///
    /// Returns `Ok(())` when the daemon is still alive at the end of the wait or
    /// when a reload cut the wait short.
    pub fn sleep(&mut self) -> Result<(), MonitorError> {
        let state = signals::state();
        if state.is_terminated() {
            return Err(MonitorError::Terminated);
        }
        if state.take_reload_request() {
            info!("Reloading {}", self.config.path().display());
            self.config.load_or_reload();
        }

        let interval = Duration::from_secs(self.config.interval().into());
        let Self {
            config, pidlock, ..
        } = self;

        let mut exit = None;
        let result = {
            let mut hook = |result: &Result<(), Errno>| {
                if state.is_terminated() {
                    exit = Some(MonitorError::Terminated);
                    return WakeAction::Cancel;
                }

                if state.take_reload_request() {
                    info!("Reloading {}", config.path().display());
                    config.load_or_reload();
                    return WakeAction::Cancel;
                }

                match result {
                    Ok(()) | Err(Errno::EINTR) => WakeAction::Continue,
                    Err(errno) => {
                        exit = Some(match pidlock.pidfile().owner() {
                            Ok(None) => MonitorError::DaemonNotRunning,
                            _ => MonitorError::Lock(LockError::from(*errno)),
                        });
                        WakeAction::Cancel
                    }
                }
            };
            pidlock.acquire_read_lock(interval, Some(&mut hook))
        };

        match result {
            Ok(()) => Err(MonitorError::DaemonNotRunning),
            Err(LockError::TimedOut) => Ok(()),
            Err(LockError::Cancelled) => exit.map_or(Ok(()), Err),
            Err(err) => Err(err.into()),
        }
    }

    /// Pings and sleeps until a terminal outcome.
    pub fn run(&mut self) -> Result<Infallible, MonitorError> {
        loop {
            self.ping()?;
            self.sleep()?;
        }
    }
}

/// Effective ping timeout for a configured value.
pub fn effective_timeout(seconds: u32) -> Duration {
    if seconds == 0 {
        CONTROL_DEFAULT_TIMEOUT
    } else {
        Duration::from_secs(seconds.into())
    }
}

fn send_signal(pid: Pid, signal: Signal) -> Result<(), Errno> {
    match signal::kill(pid, signal) {
        Err(Errno::ESRCH) => Ok(()),
        other => other,
    }
}

/// Stops the monitor that owns `pid_file`: SIGTERM first, SIGKILL if it does
/// not let go of the PID file within `timeout`.
///
/// A missing or unowned PID file means nothing is running.
pub fn kill_monitor(pid_file: &Path, timeout: Duration) -> Result<(), MonitorError> {
    let pidfile = match PidFile::open_read_only(pid_file) {
        Ok(pidfile) => pidfile,
        Err(PidFileError::NotFound(path)) => {
            debug!("{} does not exist, nothing to stop", path.display());
            return Ok(());
        }
        Err(err) => return Err(err.into()),
    };

    let Some(pid) = pidfile.owner()? else {
        debug!("{} has no owner, nothing to stop", pid_file.display());
        return Ok(());
    };

    let mut mask = SigSet::empty();
    mask.add(Signal::SIGINT);
    mask.add(Signal::SIGTERM);
    pidlock::init_lock_subsystem(&mut mask).map_err(MonitorError::Signal)?;
    let lock = PidLock::new(pidfile, &mask);

    for signal in [Signal::SIGTERM, Signal::SIGKILL] {
        debug!("Sending {signal} to monitor (pid {pid})");
        if let Err(errno) = send_signal(pid, signal) {
            warn!("Failed to send {signal} to monitor (pid {pid}): {errno}");
            continue;
        }

        match lock.acquire_read_lock(timeout, None) {
            Ok(()) => {
                info!("Monitor (pid {pid}) stopped");
                return Ok(());
            }
            Err(err) => warn!("Monitor (pid {pid}) still holds its PID file after {signal}: {err}"),
        }
    }

    Err(MonitorError::StillRunning { pid: pid.as_raw() })
}
