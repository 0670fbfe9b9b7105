//! Command-line interface for the PFC daemon monitor.
use std::{path::PathBuf, process, time::Duration};

use clap::{ArgAction, Parser, error::ErrorKind};

use crate::{
    conf::conf_path,
    constants::{
        DAEMON_NAME, DEFAULT_KILL_TIMEOUT, MAX_KILL_TIMEOUT, MIN_KILL_TIMEOUT, PID_FILE_SUFFIX,
        PROGRAM_NAME, RUN_DIR, SYSCONF_DIR,
    },
    error::Status,
    logging::LogOptions,
};

/// Watchdog for the PFC daemon.
#[derive(Parser, Debug)]
#[command(name = "pfc_monitor", version)]
#[command(about = "Watches pfcd and exits when it stops or stalls", long_about = None)]
pub struct Cli {
    /// The daemon's configuration file.
    #[arg(short = 'C', long = "conf-file", value_name = "PATH")]
    pub conf_file: Option<PathBuf>,

    /// The monitor's configuration file.
    #[arg(short = 'c', long = "monitor-conf", value_name = "PATH")]
    pub monitor_conf: Option<PathBuf>,

    /// The monitor's PID file.
    #[arg(short = 'P', long = "pidfile", value_name = "PATH")]
    pub pidfile: Option<PathBuf>,

    /// Send logs to syslog.
    #[arg(short = 's', long = "syslog")]
    pub syslog: bool,

    /// Stop the running monitor and exit.
    #[arg(short = 'k', long = "kill")]
    pub kill: bool,

    /// Seconds to wait for the monitor to stop. Implies --kill.
    #[arg(
        short = 'K',
        long = "kill-timeout",
        value_name = "SECONDS",
        value_parser = clap::value_parser!(u32).range(MIN_KILL_TIMEOUT as i64..=MAX_KILL_TIMEOUT as i64)
    )]
    pub kill_timeout: Option<u32>,

    /// Log debug output to stderr. Repeat for more detail.
    #[arg(short = 'd', long = "debug", action = ArgAction::Count)]
    pub debug: u8,
}

impl Cli {
    /// Path of the daemon's configuration file.
    pub fn conf_file(&self) -> PathBuf {
        self.conf_file
            .clone()
            .unwrap_or_else(|| conf_path(SYSCONF_DIR, DAEMON_NAME))
    }

    /// Path of the monitor's configuration file.
    pub fn monitor_conf(&self) -> PathBuf {
        self.monitor_conf
            .clone()
            .unwrap_or_else(|| conf_path(SYSCONF_DIR, PROGRAM_NAME))
    }

    /// Path of the monitor's PID file.
    pub fn pidfile(&self) -> PathBuf {
        self.pidfile
            .clone()
            .unwrap_or_else(|| PathBuf::from(RUN_DIR).join(format!("{PROGRAM_NAME}{PID_FILE_SUFFIX}")))
    }

    /// Whether to stop a running monitor instead of monitoring.
    pub fn kill_mode(&self) -> bool {
        self.kill || self.kill_timeout.is_some()
    }

    /// Lock-wait timeout for each step of the stop sequence.
    pub fn kill_timeout(&self) -> Duration {
        Duration::from_secs(self.kill_timeout.unwrap_or(DEFAULT_KILL_TIMEOUT).into())
    }

    /// Logging settings implied by `-d` and `-s`.
    pub fn log_options(&self) -> LogOptions {
        LogOptions {
            verbosity: self.debug,
            syslog: self.syslog,
        }
    }
}

/// Parses command-line arguments and returns a `Cli` struct.
///
/// Help and version requests exit with status 0; usage errors exit with the
/// fatal status.
pub fn parse_args() -> Cli {
    match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => {
            let _ = err.print();
            let status = match err.kind() {
                ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => Status::Ok,
                _ => Status::Fatal,
            };
            process::exit(status.code());
        }
    }
}
