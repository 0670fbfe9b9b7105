//! Control-protocol client used to ping the daemon, plus the server-side
//! helpers for the same newline-delimited JSON wire format.
use serde::{Deserialize, Serialize};
use std::{
    fmt,
    io::{self, BufRead, BufReader, Read, Write},
    os::{
        fd::{AsFd, AsRawFd},
        unix::net::UnixStream,
    },
    path::{Path, PathBuf},
    time::{Duration, Instant},
};

use nix::{
    errno::Errno,
    poll::{PollFd, PollFlags, ppoll},
    sys::{
        signal::SigSet,
        socket::{AddressFamily, SockFlag, SockType, UnixAddr, connect, getsockopt, socket, sockopt},
        time::TimeSpec,
    },
    unistd::{AccessFlags, access},
};
use thiserror::Error;
use tracing::trace;

use crate::{
    conf::ErrorCallback,
    constants::{CONTROL_CONNECT_RETRY, CONTROL_DEFAULT_TIMEOUT, CONTROL_SOCKET_NAME},
};

/// Returns the control socket path inside the daemon's working directory.
pub fn socket_path(work_dir: &Path) -> PathBuf {
    work_dir.join(CONTROL_SOCKET_NAME)
}

/// Message sent from the monitor to the daemon.
#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
pub enum ControlCommand {
    /// "Are you alive" request with no side effects.
    Nop,
}

/// Response sent by the daemon.
#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
pub enum ControlResponse {
    Ok,
    Error(String),
}

/// Errors raised by the control channel helpers.
#[derive(Debug, Error)]
pub enum ControlError {
    #[error("control endpoint {} is not available", .0.display())]
    NotRunning(PathBuf),
    #[error("permission denied on control endpoint {}", .0.display())]
    PermissionDenied(PathBuf),
    #[error("no response within {0:?}")]
    TimedOut(Duration),
    #[error("wait for the daemon was interrupted")]
    Interrupted,
    #[error("connection closed before a response arrived")]
    Closed,
    #[error("daemon reported error: {0}")]
    Server(String),
    #[error("control socket I/O failed: {0}")]
    Io(#[from] io::Error),
    #[error("failed to serialise control message: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("control socket wait failed: {0}")]
    Wait(#[from] Errno),
}

/// Governs how a session waits for socket readiness.
pub struct IoWaitPolicy {
    mask: SigSet,
    interrupted: Box<dyn Fn() -> bool>,
}

impl IoWaitPolicy {
    /// Waits with `mask` as the signal mask. After every signal that
    /// interrupts a wait, `interrupted` decides whether to give up.
    pub fn new(mask: SigSet, interrupted: Box<dyn Fn() -> bool>) -> Self {
        Self { mask, interrupted }
    }
}

impl Default for IoWaitPolicy {
    fn default() -> Self {
        let mask = SigSet::thread_get_mask().unwrap_or_else(|_| SigSet::empty());
        Self::new(mask, Box::new(|| false))
    }
}

impl fmt::Debug for IoWaitPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IoWaitPolicy")
            .field("mask", &self.mask)
            .finish_non_exhaustive()
    }
}

impl IoWaitPolicy {
    /// Runs one `ppoll` on `fds` for at most `limit` with the policy mask.
    ///
    /// Returns `true` when a descriptor is ready and `false` when `limit`
    /// elapsed or a signal the policy ignores interrupted the wait.
    fn poll_once(&self, fds: &mut [PollFd<'_>], limit: Duration) -> Result<bool, ControlError> {
        match ppoll(fds, Some(TimeSpec::from_duration(limit)), Some(self.mask)) {
            Ok(0) => Ok(false),
            Ok(_) => Ok(true),
            Err(Errno::EINTR) if (self.interrupted)() => Err(ControlError::Interrupted),
            Err(Errno::EINTR) => Ok(false),
            Err(errno) => Err(errno.into()),
        }
    }
}

/// Time left before `deadline`, or `TimedOut` once it has passed.
fn remaining(deadline: Instant, timeout: Duration) -> Result<Duration, ControlError> {
    let now = Instant::now();
    if now >= deadline {
        return Err(ControlError::TimedOut(timeout));
    }
    Ok(deadline - now)
}

/// Client bound to one daemon working directory.
pub struct ControlClient {
    socket: PathBuf,
    on_error: Option<ErrorCallback>,
}

impl fmt::Debug for ControlClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ControlClient")
            .field("socket", &self.socket)
            .finish_non_exhaustive()
    }
}

impl ControlClient {
    /// Creates a client for the daemon running in `work_dir`. `on_error`
    /// receives the description of every failed request.
    pub fn new(work_dir: impl AsRef<Path>, on_error: Option<ErrorCallback>) -> Self {
        Self {
            socket: socket_path(work_dir.as_ref()),
            on_error,
        }
    }

    /// Returns the control socket path.
    pub fn socket_path(&self) -> &Path {
        &self.socket
    }

    /// Verifies that this process may talk to the daemon.
    pub fn check_permission(&self) -> Result<(), ControlError> {
        match access(&self.socket, AccessFlags::R_OK | AccessFlags::W_OK) {
            Ok(()) => Ok(()),
            Err(Errno::ENOENT) => Err(ControlError::NotRunning(self.socket.clone())),
            Err(Errno::EACCES | Errno::EPERM) => {
                Err(ControlError::PermissionDenied(self.socket.clone()))
            }
            Err(errno) => Err(self.report(ControlError::Io(errno.into()))),
        }
    }

    /// Connects to the daemon. Every exchange on the returned session must
    /// complete within `timeout`; zero selects the client default.
    pub fn create_session(
        &self,
        timeout: Duration,
        policy: IoWaitPolicy,
    ) -> Result<Session<'_>, ControlError> {
        let timeout = if timeout.is_zero() {
            CONTROL_DEFAULT_TIMEOUT
        } else {
            timeout
        };

        let deadline = Instant::now() + timeout;
        let stream = self
            .connect(deadline, timeout, &policy)
            .map_err(|err| self.report(err))?;

        trace!("Opened control session on {}", self.socket.display());
        Ok(Session {
            client: self,
            stream,
            timeout,
            deadline,
            policy,
        })
    }

    /// Opens a non-blocking connection to the daemon before `deadline`.
    ///
    /// A full accept queue is retried until the deadline passes.
    fn connect(
        &self,
        deadline: Instant,
        timeout: Duration,
        policy: &IoWaitPolicy,
    ) -> Result<UnixStream, ControlError> {
        let address =
            UnixAddr::new(self.socket.as_path()).map_err(|errno| self.connect_error(errno))?;
        let fd = socket(
            AddressFamily::Unix,
            SockType::Stream,
            SockFlag::SOCK_NONBLOCK | SockFlag::SOCK_CLOEXEC,
            None,
        )
        .map_err(|errno| self.connect_error(errno))?;

        loop {
            match connect(fd.as_raw_fd(), &address) {
                Ok(()) | Err(Errno::EISCONN) => break,
                Err(Errno::EAGAIN) => {
                    let pause = remaining(deadline, timeout)?.min(CONTROL_CONNECT_RETRY);
                    trace!("Control socket backlog is full, retrying in {pause:?}");
                    policy.poll_once(&mut [], pause)?;
                }
                Err(Errno::EINPROGRESS | Errno::EALREADY | Errno::EINTR) => {
                    let mut fds = [PollFd::new(fd.as_fd(), PollFlags::POLLOUT)];
                    while !policy.poll_once(&mut fds, remaining(deadline, timeout)?)? {}
                    match getsockopt(&fd, sockopt::SocketError)? {
                        0 => break,
                        code => return Err(self.connect_error(Errno::from_raw(code))),
                    }
                }
                Err(errno) => return Err(self.connect_error(errno)),
            }
        }

        Ok(UnixStream::from(fd))
    }

    fn connect_error(&self, errno: Errno) -> ControlError {
        match errno {
            Errno::ENOENT | Errno::ECONNREFUSED => ControlError::NotRunning(self.socket.clone()),
            Errno::EACCES | Errno::EPERM => ControlError::PermissionDenied(self.socket.clone()),
            errno => ControlError::Io(errno.into()),
        }
    }

    fn report(&self, err: ControlError) -> ControlError {
        if let Some(callback) = &self.on_error {
            callback(&err.to_string());
        }
        err
    }
}

/// One connection to the daemon.
pub struct Session<'a> {
    client: &'a ControlClient,
    stream: UnixStream,
    timeout: Duration,
    deadline: Instant,
    policy: IoWaitPolicy,
}

impl Session<'_> {
    /// Sends `command` and waits for the daemon's answer.
    ///
    /// An `Error` response is returned as [`ControlError::Server`].
    pub fn execute(&mut self, command: &ControlCommand) -> Result<ControlResponse, ControlError> {
        let result = self.exchange(command);
        result.map_err(|err| self.client.report(err))
    }

    fn exchange(&mut self, command: &ControlCommand) -> Result<ControlResponse, ControlError> {
        let mut payload = serde_json::to_vec(command)?;
        payload.push(b'\n');
        self.send(&payload)?;

        let line = self.receive_line()?;
        let response: ControlResponse = serde_json::from_str(line.trim())?;
        match response {
            ControlResponse::Error(message) => Err(ControlError::Server(message)),
            response => Ok(response),
        }
    }

    fn send(&mut self, bytes: &[u8]) -> Result<(), ControlError> {
        let mut written = 0;
        while written < bytes.len() {
            match self.stream.write(&bytes[written..]) {
                Ok(0) => return Err(ControlError::Closed),
                Ok(count) => written += count,
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                    self.wait(PollFlags::POLLOUT)?
                }
                Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
                Err(err) => return Err(err.into()),
            }
        }
        Ok(())
    }

    fn receive_line(&mut self) -> Result<String, ControlError> {
        let mut buffer = Vec::new();
        let mut chunk = [0u8; 512];

        loop {
            if let Some(end) = buffer.iter().position(|byte| *byte == b'\n') {
                buffer.truncate(end);
                return String::from_utf8(buffer)
                    .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err).into());
            }

            match self.stream.read(&mut chunk) {
                Ok(0) => return Err(ControlError::Closed),
                Ok(count) => buffer.extend_from_slice(&chunk[..count]),
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                    self.wait(PollFlags::POLLIN)?
                }
                Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
                Err(err) => return Err(err.into()),
            }
        }
    }

    /// Blocks until the socket is ready for `events`, the deadline passes, or
    /// the wait policy gives up after a signal.
    fn wait(&self, events: PollFlags) -> Result<(), ControlError> {
        let mut fds = [PollFd::new(self.stream.as_fd(), events)];
        loop {
            let limit = remaining(self.deadline, self.timeout)?;
            if self.policy.poll_once(&mut fds, limit)? {
                return Ok(());
            }
        }
    }
}

/// Reads one command from a connected client. Used by daemon-side code.
pub fn read_command(stream: &mut UnixStream) -> Result<ControlCommand, ControlError> {
    let mut reader = BufReader::new(stream);
    let mut line = String::new();
    reader.read_line(&mut line)?;

    if line.trim().is_empty() {
        return Err(ControlError::Io(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "empty control command",
        )));
    }

    Ok(serde_json::from_str(line.trim())?)
}

/// Writes a response to the connected client.
pub fn write_response(
    stream: &mut UnixStream,
    response: &ControlResponse,
) -> Result<(), ControlError> {
    let payload = serde_json::to_vec(response)?;
    stream.write_all(&payload)?;
    stream.write_all(b"\n")?;
    stream.flush()?;
    Ok(())
}
