//! Log bring-up: stderr by default, syslog on request.
use std::{
    ffi::CString,
    io::{self, Write},
    sync::OnceLock,
};

use tracing::{Level, Metadata};
use tracing_subscriber::{EnvFilter, fmt::MakeWriter};

use crate::constants::PROGRAM_NAME;

/// Identity string handed to `openlog(3)`; it must outlive every syslog call.
static SYSLOG_IDENT: OnceLock<CString> = OnceLock::new();

/// How the process should log.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LogOptions {
    /// Number of `-d` flags given.
    pub verbosity: u8,
    /// Whether `-s` was given.
    pub syslog: bool,
}

impl LogOptions {
    /// Syslog is used only when requested and not debugging.
    pub fn use_syslog(&self) -> bool {
        self.syslog && self.verbosity == 0
    }
}

/// Maps the `-d` count onto a filter directive.
pub fn filter_directive(verbosity: u8) -> &'static str {
    match verbosity {
        0 => "info",
        1 => "debug",
        _ => "trace",
    }
}

/// Installs the global subscriber. Later calls are ignored.
pub fn init_logging(options: &LogOptions) {
    let filter = if options.verbosity == 0 {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    } else {
        EnvFilter::new(filter_directive(options.verbosity))
    };

    if options.use_syslog() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(SyslogWriter::open(PROGRAM_NAME))
            .with_ansi(false)
            .without_time()
            .with_target(false)
            .try_init();
    } else {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(io::stderr)
            .try_init();
    }
}

/// Maps a tracing level onto a syslog priority.
pub fn syslog_priority(level: &Level) -> libc::c_int {
    match *level {
        Level::ERROR => libc::LOG_ERR,
        Level::WARN => libc::LOG_WARNING,
        Level::INFO => libc::LOG_INFO,
        Level::DEBUG | Level::TRACE => libc::LOG_DEBUG,
    }
}

/// `MakeWriter` that sends each formatted event to syslog.
#[derive(Debug, Clone, Copy)]
pub struct SyslogWriter;

impl SyslogWriter {
    /// Opens the syslog connection with facility `LOG_DAEMON`.
    pub fn open(ident: &str) -> Self {
        let ident = SYSLOG_IDENT.get_or_init(|| {
            CString::new(ident.replace('\0', "")).unwrap_or_default()
        });
        // SAFETY: `ident` lives in a static for the rest of the process.
        unsafe { libc::openlog(ident.as_ptr(), libc::LOG_PID, libc::LOG_DAEMON) };
        SyslogWriter
    }
}

impl<'a> MakeWriter<'a> for SyslogWriter {
    type Writer = SyslogLine;

    fn make_writer(&'a self) -> Self::Writer {
        SyslogLine::new(libc::LOG_INFO)
    }

    fn make_writer_for(&'a self, meta: &Metadata<'_>) -> Self::Writer {
        SyslogLine::new(syslog_priority(meta.level()))
    }
}

/// One buffered log record, emitted when dropped.
#[derive(Debug)]
pub struct SyslogLine {
    priority: libc::c_int,
    buffer: Vec<u8>,
}

impl SyslogLine {
    fn new(priority: libc::c_int) -> Self {
        Self {
            priority,
            buffer: Vec::new(),
        }
    }

    fn message(&self) -> Option<CString> {
        let text: Vec<u8> = self
            .buffer
            .iter()
            .copied()
            .filter(|byte| *byte != 0)
            .collect();
        let trimmed = text.trim_ascii_end();
        if trimmed.is_empty() {
            return None;
        }
        CString::new(trimmed).ok()
    }
}

impl Write for SyslogLine {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.buffer.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Drop for SyslogLine {
    fn drop(&mut self) {
        if let Some(message) = self.message() {
            // SAFETY: both strings are NUL-terminated and "%s" consumes one argument.
            unsafe { libc::syslog(self.priority, c"%s".as_ptr(), message.as_ptr()) };
        }
    }
}
