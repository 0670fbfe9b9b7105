//! PID files guarded by POSIX advisory record locks.
//!
//! A process that owns a PID file holds a write lock over the whole file for its
//! entire lifetime. Other processes learn the owner with an `F_GETLK` probe and
//! learn that the owner exited when a read lock is finally granted.
use std::{
    fs::{self, File, OpenOptions},
    io::{self, Write},
    mem,
    os::{
        fd::{AsFd, AsRawFd, BorrowedFd, RawFd},
        unix::fs::OpenOptionsExt,
    },
    path::{Path, PathBuf},
    sync::OnceLock,
};

use nix::{
    errno::Errno,
    fcntl::{FcntlArg, fcntl},
    unistd::Pid,
};
use tracing::debug;

use crate::error::PidFileError;

/// Path unlinked by the process-exit hook.
static EXIT_UNLINK: OnceLock<PathBuf> = OnceLock::new();

extern "C" fn unlink_registered_pidfile() {
    if let Some(path) = EXIT_UNLINK.get() {
        let _ = fs::remove_file(path);
    }
}

/// Builds a whole-file lock request of the given type.
pub(crate) fn lock_request(kind: libc::c_short) -> libc::flock {
    // SAFETY: `flock` is a plain C struct for which all-zero is a valid value.
    let mut request: libc::flock = unsafe { mem::zeroed() };
    request.l_type = kind;
    request.l_whence = libc::SEEK_SET as libc::c_short;
    request.l_start = 0;
    request.l_len = 0;
    request
}

/// An open PID file.
#[derive(Debug)]
pub struct PidFile {
    path: PathBuf,
    file: File,
    installed: bool,
}

impl PidFile {
    /// Creates the PID file, takes its write lock, and records the current PID.
    ///
    /// Fails with [`PidFileError::Locked`] naming the owner when another live
    /// process already holds the file.
    pub fn install(path: impl AsRef<Path>) -> Result<Self, PidFileError> {
        let path = path.as_ref().to_path_buf();
        let io_error = |source: io::Error| PidFileError::Io {
            path: path.clone(),
            source,
        };

        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent).map_err(io_error)?;
        }

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .mode(0o644)
            .open(&path)
            .map_err(io_error)?;

        let request = lock_request(libc::F_WRLCK as libc::c_short);
        match fcntl(file.as_raw_fd(), FcntlArg::F_SETLK(&request)) {
            Ok(_) => {}
            Err(Errno::EAGAIN | Errno::EACCES) => {
                let pid = query_owner(file.as_raw_fd())
                    .ok()
                    .flatten()
                    .map(Pid::as_raw)
                    .unwrap_or(0);
                return Err(PidFileError::Locked { path, pid });
            }
            Err(errno) => {
                return Err(PidFileError::Lock {
                    path,
                    source: errno.into(),
                });
            }
        }

        file.set_len(0).map_err(io_error)?;
        writeln!(file, "{}", std::process::id()).map_err(io_error)?;
        file.sync_all().map_err(io_error)?;

        debug!("Installed PID file {}", path.display());
        Ok(Self {
            path,
            file,
            installed: true,
        })
    }

    /// Opens an existing PID file read-only without taking any lock.
    pub fn open_read_only(path: impl AsRef<Path>) -> Result<Self, PidFileError> {
        let path = path.as_ref().to_path_buf();
        let file = match OpenOptions::new()
            .read(true)
            .custom_flags(libc::O_CLOEXEC)
            .open(&path)
        {
            Ok(file) => file,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                return Err(PidFileError::NotFound(path));
            }
            Err(source) => return Err(PidFileError::Io { path, source }),
        };

        Ok(Self {
            path,
            file,
            installed: false,
        })
    }

    /// Returns the process holding the write lock, or `None` if nobody does.
    pub fn owner(&self) -> Result<Option<Pid>, PidFileError> {
        query_owner(self.file.as_raw_fd()).map_err(|errno| PidFileError::Lock {
            path: self.path.clone(),
            source: errno.into(),
        })
    }

    /// Returns the file path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Registers a process-exit hook that unlinks this PID file.
    ///
    /// Only the first registration in a process takes effect.
    pub fn unlink_on_exit(&self) -> Result<(), PidFileError> {
        if EXIT_UNLINK.set(self.path.clone()).is_err() {
            return Ok(());
        }

        // SAFETY: the hook only reads a static and unlinks a file.
        let rc = unsafe { libc::atexit(unlink_registered_pidfile) };
        if rc != 0 {
            return Err(PidFileError::Io {
                path: self.path.clone(),
                source: io::Error::other("failed to register exit hook"),
            });
        }

        Ok(())
    }
}

impl AsRawFd for PidFile {
    fn as_raw_fd(&self) -> RawFd {
        self.file.as_raw_fd()
    }
}

impl AsFd for PidFile {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.file.as_fd()
    }
}

impl Drop for PidFile {
    fn drop(&mut self) {
        if self.installed {
            let _ = fs::remove_file(&self.path);
        }
    }
}

fn query_owner(fd: RawFd) -> Result<Option<Pid>, Errno> {
    let mut request = lock_request(libc::F_RDLCK as libc::c_short);
    fcntl(fd, FcntlArg::F_GETLK(&mut request))?;
    if request.l_type == libc::F_UNLCK as libc::c_short {
        Ok(None)
    } else {
        Ok(Some(Pid::from_raw(request.l_pid)))
    }
}
