//! Constants and default values for the PFC daemon monitor.
//!
//! This module centralizes the names, paths, and timing values shared by the
//! monitor loop, the lock primitive, and the command-line front end.

use std::time::Duration;

// ============================================================================
// Names
// ============================================================================

/// Program name used for defaults, syslog ident, and early error messages.
pub const PROGRAM_NAME: &str = "pfc_monitor";

/// Name of the monitored daemon.
pub const DAEMON_NAME: &str = "pfcd";

// ============================================================================
// File System Constants
// ============================================================================

/// Directory holding system configuration files.
pub const SYSCONF_DIR: &str = "/etc/pfc";

/// Directory holding runtime artifacts such as PID files.
pub const RUN_DIR: &str = "/run/pfc";

/// Working directory of the daemon when its configuration does not set one.
pub const DEFAULT_WORK_DIR: &str = "/var/lib/pfc/pfcd";

/// File name of the daemon's control socket inside its working directory.
pub const CONTROL_SOCKET_NAME: &str = "pfcd.sock";

/// Extension appended to program names to build PID file names.
pub const PID_FILE_SUFFIX: &str = ".pid";

/// Extension appended to program names to build configuration file names.
pub const CONF_FILE_SUFFIX: &str = ".conf";

// ============================================================================
// Monitor Timing
// ============================================================================

/// Seconds between two pings when the configuration does not say otherwise.
pub const DEFAULT_INTERVAL: u32 = 60;

/// Seconds to wait for a ping response when the configuration does not say otherwise.
pub const DEFAULT_TIMEOUT: u32 = 5;

/// Timeout used by the control-protocol client when the monitor passes zero.
pub const CONTROL_DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Pause between connect attempts while the daemon's accept queue is full.
pub const CONTROL_CONNECT_RETRY: Duration = Duration::from_millis(10);

/// Period of the one-shot alarm armed by a signal handler that lands while the
/// main flow is blocked on the PID file lock.
pub const NUDGE_ALARM: Duration = Duration::from_millis(1);

// ============================================================================
// Kill Mode
// ============================================================================

/// Lock-wait timeout, in seconds, for each step of the stop sequence.
pub const DEFAULT_KILL_TIMEOUT: u32 = 10;

/// Smallest accepted `--kill-timeout` value.
pub const MIN_KILL_TIMEOUT: u32 = 1;

/// Largest accepted `--kill-timeout` value.
pub const MAX_KILL_TIMEOUT: u32 = 3600;

// ============================================================================
// Error Reporting
// ============================================================================

/// Capacity of the buffer holding the most recent collaborator error, in bytes.
/// One byte is reserved, so at most `ERROR_MESSAGE_CAPACITY - 1` bytes are kept.
pub const ERROR_MESSAGE_CAPACITY: usize = 256;
