//! Configuration files for the monitor and the monitored daemon.
use std::{
    fmt, fs, io,
    path::{Path, PathBuf},
    sync::LazyLock,
};

use regex::Regex;
use serde::{Deserialize, de::DeserializeOwned};

use crate::{
    constants::{
        CONF_FILE_SUFFIX, DAEMON_NAME, DEFAULT_INTERVAL, DEFAULT_TIMEOUT, DEFAULT_WORK_DIR,
        PID_FILE_SUFFIX,
    },
    error::ConfError,
};

/// Receives a human-readable description of every parse failure.
pub type ErrorCallback = Box<dyn Fn(&str)>;

static ENV_REFERENCE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("environment reference pattern")
});

/// Contents of the monitor configuration file.
#[derive(Debug, Default, Deserialize, Clone, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct MonitorConf {
    /// The `monitor` block.
    pub monitor: Option<MonitorBlock>,
}

/// Keys of the `monitor` block.
#[derive(Debug, Default, Deserialize, Clone, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct MonitorBlock {
    /// Seconds between pings.
    pub interval: Option<u32>,
    /// Seconds to wait for a ping response; `0` defers to the client default.
    pub timeout: Option<u32>,
}

impl MonitorConf {
    /// Returns `monitor.interval`, or the default.
    pub fn interval(&self) -> u32 {
        self.monitor
            .as_ref()
            .and_then(|block| block.interval)
            .unwrap_or(DEFAULT_INTERVAL)
    }

    /// Returns `monitor.timeout`, or the default.
    pub fn timeout(&self) -> u32 {
        self.monitor
            .as_ref()
            .and_then(|block| block.timeout)
            .unwrap_or(DEFAULT_TIMEOUT)
    }
}

/// An open configuration file whose schema is the type `T`.
pub struct ConfFile<T> {
    path: PathBuf,
    document: T,
    on_error: Option<ErrorCallback>,
}

impl<T: fmt::Debug> fmt::Debug for ConfFile<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConfFile")
            .field("path", &self.path)
            .field("document", &self.document)
            .finish_non_exhaustive()
    }
}

impl<T> ConfFile<T>
where
    T: DeserializeOwned + Default,
{
    /// Opens and parses `path`.
    pub fn open(path: impl AsRef<Path>, on_error: Option<ErrorCallback>) -> Result<Self, ConfError> {
        let path = path.as_ref().to_path_buf();
        let document = parse_file(&path, on_error.as_deref())?;
        Ok(Self {
            path,
            document,
            on_error,
        })
    }

    /// Parses the file again. On failure the previous contents are kept.
    pub fn reload(&mut self) -> Result<(), ConfError> {
        self.document = parse_file(&self.path, self.on_error.as_deref())?;
        Ok(())
    }

    /// Returns the parsed contents.
    pub fn document(&self) -> &T {
        &self.document
    }

    /// Returns the file path.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn read_file(path: &Path) -> Result<String, ConfError> {
    fs::read_to_string(path).map_err(|err| {
        if err.kind() == io::ErrorKind::NotFound {
            ConfError::NotFound(path.to_path_buf())
        } else {
            ConfError::Read {
                path: path.to_path_buf(),
                source: err,
            }
        }
    })
}

fn parse_document<T>(
    path: &Path,
    content: &str,
    on_error: Option<&dyn Fn(&str)>,
) -> Result<T, ConfError>
where
    T: DeserializeOwned + Default,
{
    if content.trim().is_empty() {
        return Ok(T::default());
    }

    serde_yaml::from_str(content).map_err(|source| {
        if let Some(callback) = on_error {
            callback(&format!("{}: {source}", path.display()));
        }
        ConfError::Parse {
            path: path.to_path_buf(),
            source,
        }
    })
}

fn parse_file<T>(path: &Path, on_error: Option<&dyn Fn(&str)>) -> Result<T, ConfError>
where
    T: DeserializeOwned + Default,
{
    let content = read_file(path)?;
    parse_document(path, &content, on_error)
}

/// Expands `${VAR}` references from the environment.
fn expand_env_vars(input: &str, path: &Path) -> Result<String, ConfError> {
    let mut output = String::with_capacity(input.len());
    let mut last = 0;

    for captures in ENV_REFERENCE.captures_iter(input) {
        let (Some(whole), Some(name)) = (captures.get(0), captures.get(1)) else {
            continue;
        };
        let value = std::env::var(name.as_str()).map_err(|_| ConfError::MissingVariable {
            path: path.to_path_buf(),
            name: name.as_str().to_string(),
        })?;
        output.push_str(&input[last..whole.start()]);
        output.push_str(&value);
        last = whole.end();
    }

    output.push_str(&input[last..]);
    Ok(output)
}

/// The daemon's own configuration file, read to locate its working directory
/// and PID file and to pick the account the monitor runs as.
#[derive(Debug, Default, Deserialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct SystemConfig {
    /// The `options` block.
    #[serde(default)]
    pub options: SystemOptions,
}

/// Keys of the daemon's `options` block.
#[derive(Debug, Default, Deserialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct SystemOptions {
    /// Working directory of the daemon; holds its control socket.
    pub work_dir: Option<PathBuf>,
    /// PID file of the daemon.
    pub pid_file: Option<PathBuf>,
    /// Account the monitor switches to when started as root.
    pub admin_user: Option<String>,
    /// Group the monitor switches to when started as root.
    pub admin_group: Option<String>,
}

impl SystemConfig {
    /// Loads the daemon configuration. A missing file yields the defaults.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfError> {
        let path = path.as_ref();
        let content = match read_file(path) {
            Ok(content) => content,
            Err(ConfError::NotFound(_)) => return Ok(Self::default()),
            Err(err) => return Err(err),
        };

        let expanded = expand_env_vars(&content, path)?;
        parse_document(path, &expanded, None)
    }

    /// Returns the daemon's working directory.
    pub fn work_dir(&self) -> PathBuf {
        self.options
            .work_dir
            .clone()
            .unwrap_or_else(|| PathBuf::from(DEFAULT_WORK_DIR))
    }

    /// Returns the daemon's PID file path.
    pub fn pid_file(&self) -> PathBuf {
        self.options.pid_file.clone().unwrap_or_else(|| {
            self.work_dir()
                .join(format!("{DAEMON_NAME}{PID_FILE_SUFFIX}"))
        })
    }
}

/// Builds `<dir>/<name>.conf`.
pub fn conf_path(dir: impl AsRef<Path>, name: &str) -> PathBuf {
    dir.as_ref().join(format!("{name}{CONF_FILE_SUFFIX}"))
}
