//! pfc_monitor watches the PFC daemon (`pfcd`) and exits as soon as the daemon
//! stops or stops answering. It pings the daemon over its control socket, then
//! waits on the daemon's PID file lock until the next ping is due. Being granted
//! that lock means the daemon has exited. The exit status tells a service
//! manager what happened.

/// CLI interface.
pub mod cli;

/// Configuration files.
pub mod conf;

/// Constants and default values.
pub mod constants;

/// Error handling.
pub mod error;

/// Control-protocol client for the daemon.
pub mod ipc;

/// Log bring-up.
pub mod logging;

/// Monitor context and control loop.
pub mod monitor;

/// PID file service.
pub mod pidfile;

/// Alarm-interruptible PID file lock.
pub mod pidlock;

/// Credential switching.
pub mod privilege;

/// Signal latches and handlers.
pub mod signals;
