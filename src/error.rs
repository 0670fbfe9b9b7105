//! Error handling for the PFC daemon monitor.
use std::{io, path::PathBuf, time::Duration};

use nix::errno::Errno;
use thiserror::Error;

use crate::{
    constants::{DAEMON_NAME, ERROR_MESSAGE_CAPACITY},
    ipc::ControlError,
};

/// Process exit status reported by the monitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum Status {
    /// Normal termination, including a stop requested by signal.
    Ok = 0,
    /// The daemon was confirmed stopped.
    NotRunning = 1,
    /// The daemon did not answer within the timeout.
    Stalled = 2,
    /// Fatal or unexpected error.
    Fatal = 3,
}

impl Status {
    /// Returns the numeric process exit code.
    pub const fn code(self) -> i32 {
        self as i32
    }
}

/// Outcome of a lock or process operation that did not succeed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum LockError {
    /// The deadline elapsed before the lock was granted.
    #[error("timed out")]
    TimedOut,

    /// The wait was cut short by the lock-wait hook.
    #[error("operation cancelled")]
    Cancelled,

    /// The target process does not exist.
    #[error("process not running")]
    NotRunning,

    /// The caller may not access the target.
    #[error("permission denied")]
    PermissionDenied,

    /// The target file does not exist.
    #[error("no such file or directory")]
    NoSuchEntry,

    /// A signal interrupted the call. Retry loops absorb this.
    #[error("interrupted system call")]
    Interrupted,

    /// Any other OS error.
    #[error("{0}")]
    Other(Errno),
}

impl LockError {
    /// Returns the errno value equivalent to this error.
    pub fn errno(&self) -> Errno {
        match self {
            LockError::TimedOut => Errno::ETIMEDOUT,
            LockError::Cancelled => Errno::ECANCELED,
            LockError::NotRunning => Errno::ESRCH,
            LockError::PermissionDenied => Errno::EACCES,
            LockError::NoSuchEntry => Errno::ENOENT,
            LockError::Interrupted => Errno::EINTR,
            LockError::Other(errno) => *errno,
        }
    }
}

impl From<Errno> for LockError {
    fn from(errno: Errno) -> Self {
        match errno {
            Errno::ETIMEDOUT => LockError::TimedOut,
            Errno::ECANCELED => LockError::Cancelled,
            Errno::ESRCH => LockError::NotRunning,
            Errno::EACCES | Errno::EPERM => LockError::PermissionDenied,
            Errno::ENOENT => LockError::NoSuchEntry,
            Errno::EINTR => LockError::Interrupted,
            other => LockError::Other(other),
        }
    }
}

/// Error type for PID file operations.
#[derive(Debug, Error)]
pub enum PidFileError {
    /// The PID file does not exist.
    #[error("PID file {0} does not exist")]
    NotFound(PathBuf),

    /// Another live process holds the PID file lock.
    #[error("PID file {path} is locked by process {pid}")]
    Locked {
        /// Path of the contested PID file.
        path: PathBuf,
        /// Process holding the lock, `0` when it could not be determined.
        pid: i32,
    },

    /// Error reading or writing the PID file.
    #[error("PID file {path}: {source}")]
    Io {
        /// Path of the PID file.
        path: PathBuf,
        /// The underlying error that occurred.
        #[source]
        source: io::Error,
    },

    /// Error returned by a lock operation on the PID file.
    #[error("PID file {path}: {source}")]
    Lock {
        /// Path of the PID file.
        path: PathBuf,
        /// The underlying lock error.
        #[source]
        source: LockError,
    },
}

/// Error type for configuration files.
#[derive(Debug, Error)]
pub enum ConfError {
    /// The configuration file does not exist.
    #[error("configuration file {0} does not exist")]
    NotFound(PathBuf),

    /// Error reading the configuration file.
    #[error("failed to read configuration file {path}: {source}")]
    Read {
        /// Path of the configuration file.
        path: PathBuf,
        /// The underlying error that occurred.
        #[source]
        source: io::Error,
    },

    /// The configuration file is not valid.
    #[error("invalid configuration file {path}: {source}")]
    Parse {
        /// Path of the configuration file.
        path: PathBuf,
        /// The underlying parse error.
        #[source]
        source: serde_yaml::Error,
    },

    /// A `${VAR}` reference names an unset environment variable.
    #[error("configuration file {path} references unset environment variable '{name}'")]
    MissingVariable {
        /// Path of the configuration file.
        path: PathBuf,
        /// Name of the missing variable.
        name: String,
    },
}

/// Terminal outcomes of the monitor. Each maps onto one exit [`Status`].
#[derive(Debug, Error)]
pub enum MonitorError {
    /// A SIGINT or SIGTERM asked the monitor to stop.
    #[error("terminated by signal")]
    Terminated,

    /// The daemon process is gone.
    #[error("{} is not running", DAEMON_NAME)]
    DaemonNotRunning,

    /// The daemon is alive but did not answer a ping in time.
    #[error("{} did not respond within {timeout:?}", DAEMON_NAME)]
    DaemonStalled {
        /// Timeout that elapsed.
        timeout: Duration,
    },

    /// This process may not query the daemon.
    #[error("permission denied to access {}", DAEMON_NAME)]
    PermissionDenied,

    /// Another monitor instance owns the monitor PID file.
    #[error("another monitor is already running: pid = {pid}")]
    AlreadyRunning {
        /// PID of the running monitor, `0` when unknown.
        pid: i32,
    },

    /// The monitor targeted by kill mode survived SIGTERM and SIGKILL.
    #[error("monitor is still running: pid = {pid}")]
    StillRunning {
        /// PID of the surviving monitor.
        pid: i32,
    },

    /// Installing signal handlers or masks failed.
    #[error("failed to set up signal handling: {0}")]
    Signal(Errno),

    /// Unexpected failure of the PID file lock wait.
    #[error("failed to wait on the {} PID file lock: {0}", DAEMON_NAME)]
    Lock(#[from] LockError),

    /// Error for PID file.
    #[error("PID file error: {0}")]
    PidFile(#[from] PidFileError),

    /// Error for configuration file.
    #[error(transparent)]
    Conf(#[from] ConfError),

    /// Error reported by the control protocol.
    #[error("control protocol error: {0}")]
    Control(#[from] ControlError),

    /// Any other I/O failure.
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl MonitorError {
    /// Maps this outcome to the process exit status.
    pub fn status(&self) -> Status {
        match self {
            MonitorError::Terminated => Status::Ok,
            MonitorError::DaemonNotRunning => Status::NotRunning,
            MonitorError::DaemonStalled { .. } => Status::Stalled,
            _ => Status::Fatal,
        }
    }
}

/// Bounded holder for the most recent error reported by a collaborator.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ErrorMessage(String);

impl ErrorMessage {
    /// Replaces the stored message, truncating it to the buffer capacity on a
    /// character boundary.
    pub fn set(&mut self, message: &str) {
        let mut end = message.len().min(ERROR_MESSAGE_CAPACITY - 1);
        while !message.is_char_boundary(end) {
            end -= 1;
        }
        self.0.clear();
        self.0.push_str(&message[..end]);
    }

    /// Forgets the stored message.
    pub fn clear(&mut self) {
        self.0.clear();
    }

    /// Returns the stored message.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns `true` if no message is stored.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}
