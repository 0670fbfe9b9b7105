use std::process;

use tracing::{debug, error, info};

use pfc_monitor::{
    cli::{Cli, parse_args},
    conf::SystemConfig,
    constants::PROGRAM_NAME,
    error::{MonitorError, Status},
    logging::init_logging,
    monitor::{Monitor, MonitorOptions, kill_monitor},
    privilege::AccountPlan,
};

fn main() {
    let args = parse_args();

    let system = match prepare(&args) {
        Ok(system) => system,
        Err(message) => {
            eprintln!("{PROGRAM_NAME}: {message}");
            process::exit(Status::Fatal.code());
        }
    };

    let log_options = args.log_options();
    init_logging(&log_options);

    let outcome = if args.kill_mode() {
        kill_monitor(&args.pidfile(), args.kill_timeout())
    } else {
        monitor(&args, &system, log_options.use_syslog())
    };

    let status = match outcome {
        Ok(()) => Status::Ok,
        Err(MonitorError::Terminated) => {
            info!("Terminated by signal");
            Status::Ok
        }
        Err(err) => {
            error!("{err}");
            err.status()
        }
    };

    process::exit(status.code());
}

/// Loads the daemon configuration and switches to its admin account.
fn prepare(args: &Cli) -> Result<SystemConfig, String> {
    let system = SystemConfig::load(args.conf_file()).map_err(|err| err.to_string())?;

    let plan = AccountPlan::resolve(
        system.options.admin_user.as_deref(),
        system.options.admin_group.as_deref(),
    )
    .map_err(|err| err.to_string())?;
    plan.apply().map_err(|err| err.to_string())?;

    Ok(system)
}

fn monitor(args: &Cli, system: &SystemConfig, use_syslog: bool) -> Result<(), MonitorError> {
    let options = MonitorOptions {
        pid_file: args.pidfile(),
        monitor_conf: args.monitor_conf(),
        work_dir: system.work_dir(),
        daemon_pid_file: system.pid_file(),
        use_syslog,
    };
    debug!("Starting with {options:?}");

    let mut monitor = Monitor::initialize(options)?;
    debug!(
        "Holding {} for pid {}, timeout {}s, syslog {}",
        monitor.pid_file().display(),
        monitor.target_pid(),
        monitor.config().timeout(),
        monitor.use_syslog()
    );

    match monitor.run() {
        Ok(never) => match never {},
        Err(err) => Err(err),
    }
}
