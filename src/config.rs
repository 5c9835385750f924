//! Daemon configuration.
//!
//! Values are layered, lowest precedence first: built-in defaults, an optional
//! TOML file, `PDFLATEXD_*` environment variables (a `.env` file is honoured),
//! then command-line flags applied by the caller.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::daemon::workspace::SourceDelivery;

/// Errors raised while loading configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {}: {source}", .path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("invalid value {value:?} for {key}")]
    Invalid { key: &'static str, value: String },
}

/// Receive/send timeout on accepted connections unless configured.
pub const DEFAULT_RECV_TIMEOUT: Duration = Duration::from_millis(500);

/// Largest permission value accepted for `socket_mode`.
const MAX_SOCKET_MODE: u64 = 0o7777;

/// Default socket path, unique per user.
pub fn default_socket_path() -> PathBuf {
    let user = std::env::var("USER").unwrap_or_else(|_| "unknown".into());
    // Keep only characters that are safe in a file name.
    let safe_user: String = user
        .chars()
        .filter(|c| c.is_alphanumeric() || *c == '-' || *c == '_')
        .take(64)
        .collect();
    let safe_user = if safe_user.is_empty() {
        "unknown".to_string()
    } else {
        safe_user
    };
    std::env::temp_dir().join(format!("pdflatexd-{safe_user}.sock"))
}

/// Location of the config file used when none is given explicitly.
pub fn default_config_path() -> Option<PathBuf> {
    directories::ProjectDirs::from("org", "pdflatexd", "pdflatexd")
        .map(|dirs| dirs.config_dir().join("config.toml"))
}

/// Runtime configuration for the daemon.
#[derive(Debug, Clone, PartialEq)]
pub struct DaemonConfig {
    /// Path of the listening Unix socket.
    pub socket_path: PathBuf,
    /// Typesetting binary.
    pub pdflatex: PathBuf,
    /// Directory in which job workspaces are created.
    pub scratch_dir: PathBuf,
    /// Log file; `None` logs to stderr.
    pub log_file: Option<PathBuf>,
    /// Log level or filter directive.
    pub log_level: String,
    /// Receive/send timeout on accepted connections.
    pub recv_timeout: Duration,
    /// Upper bound on one compilation (`None` = unbounded).
    pub compile_timeout: Option<Duration>,
    /// Mode applied to the socket after binding. `None` keeps the permissive
    /// mode it was created with.
    pub socket_mode: Option<u32>,
    pub source_delivery: SourceDelivery,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            socket_path: default_socket_path(),
            pdflatex: PathBuf::from("pdflatex"),
            scratch_dir: std::env::temp_dir(),
            log_file: None,
            log_level: "info".to_string(),
            recv_timeout: DEFAULT_RECV_TIMEOUT,
            compile_timeout: None,
            socket_mode: None,
            source_delivery: SourceDelivery::Argument,
        }
    }
}

/// On-disk form of [`DaemonConfig`]; every key is optional.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileConfig {
    socket_path: Option<PathBuf>,
    pdflatex: Option<PathBuf>,
    scratch_dir: Option<PathBuf>,
    log_file: Option<PathBuf>,
    log_level: Option<String>,
    recv_timeout_ms: Option<u64>,
    compile_timeout_secs: Option<u64>,
    socket_mode: Option<u32>,
    source_delivery: Option<SourceDelivery>,
}

impl DaemonConfig {
    /// Load defaults, then `path` (or the default config file if it exists),
    /// then the environment.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut cfg = Self::default();
        match path {
            Some(path) => cfg.apply_file(path)?,
            None => {
                if let Some(path) = default_config_path()
                    && path.is_file()
                {
                    cfg.apply_file(&path)?;
                }
            }
        }
        cfg.apply_env()?;
        Ok(cfg)
    }

    /// Merge a TOML config file into this config.
    pub fn apply_file(&mut self, path: &Path) -> Result<(), ConfigError> {
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let file: FileConfig = toml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        self.apply_file_config(file)
    }

    fn apply_file_config(&mut self, file: FileConfig) -> Result<(), ConfigError> {
        if let Some(v) = file.socket_path {
            self.socket_path = v;
        }
        if let Some(v) = file.pdflatex {
            self.pdflatex = v;
        }
        if let Some(v) = file.scratch_dir {
            self.scratch_dir = v;
        }
        if let Some(v) = file.log_file {
            self.log_file = Some(v);
        }
        if let Some(v) = file.log_level {
            self.log_level = v;
        }
        if let Some(ms) = file.recv_timeout_ms {
            self.recv_timeout = recv_timeout_from_ms("recv_timeout_ms", ms)?;
        }
        if let Some(secs) = file.compile_timeout_secs {
            self.compile_timeout = timeout_from_secs(secs);
        }
        if let Some(mode) = file.socket_mode {
            self.socket_mode = Some(checked_socket_mode("socket_mode", u64::from(mode))?);
        }
        if let Some(v) = file.source_delivery {
            self.source_delivery = v;
        }
        Ok(())
    }

    /// Apply `PDFLATEXD_*` overrides from the process environment.
    pub fn apply_env(&mut self) -> Result<(), ConfigError> {
        self.apply_env_with(|key| dotenvy::var(key).ok())
    }

    /// Apply overrides using `lookup` to resolve variable names.
    pub fn apply_env_with<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(path) = lookup("PDFLATEXD_SOCKET") {
            self.socket_path = PathBuf::from(path);
        }
        if let Some(path) = lookup("PDFLATEXD_PDFLATEX") {
            self.pdflatex = PathBuf::from(path);
        }
        if let Some(path) = lookup("PDFLATEXD_SCRATCH_DIR") {
            self.scratch_dir = PathBuf::from(path);
        }
        if let Some(path) = lookup("PDFLATEXD_LOG_FILE") {
            self.log_file = Some(PathBuf::from(path));
        }
        if let Some(level) = lookup("PDFLATEXD_LOG_LEVEL") {
            self.log_level = level;
        }
        if let Some(val) = lookup("PDFLATEXD_RECV_TIMEOUT_MS") {
            let ms = parse_num("PDFLATEXD_RECV_TIMEOUT_MS", &val, 10)?;
            self.recv_timeout = recv_timeout_from_ms("PDFLATEXD_RECV_TIMEOUT_MS", ms)?;
        }
        if let Some(val) = lookup("PDFLATEXD_COMPILE_TIMEOUT_SECS") {
            let secs = parse_num("PDFLATEXD_COMPILE_TIMEOUT_SECS", &val, 10)?;
            self.compile_timeout = timeout_from_secs(secs);
        }
        if let Some(val) = lookup("PDFLATEXD_SOCKET_MODE") {
            let mode = parse_num("PDFLATEXD_SOCKET_MODE", &val, 8)?;
            self.socket_mode = Some(checked_socket_mode("PDFLATEXD_SOCKET_MODE", mode)?);
        }
        if let Some(val) = lookup("PDFLATEXD_SOURCE_DELIVERY") {
            self.source_delivery = val.parse().map_err(|_| ConfigError::Invalid {
                key: "PDFLATEXD_SOURCE_DELIVERY",
                value: val.clone(),
            })?;
        }
        Ok(())
    }

    /// Path of the advisory lock file guarding the socket.
    pub fn lock_path(&self) -> PathBuf {
        crate::daemon::lifecycle::lock_path_for(&self.socket_path)
    }
}

fn timeout_from_secs(secs: u64) -> Option<Duration> {
    (secs > 0).then(|| Duration::from_secs(secs))
}

/// A zero receive timeout cannot be set on a socket, so it is refused.
fn recv_timeout_from_ms(key: &'static str, ms: u64) -> Result<Duration, ConfigError> {
    if ms == 0 {
        return Err(ConfigError::Invalid {
            key,
            value: ms.to_string(),
        });
    }
    Ok(Duration::from_millis(ms))
}

fn checked_socket_mode(key: &'static str, mode: u64) -> Result<u32, ConfigError> {
    if mode > MAX_SOCKET_MODE {
        return Err(ConfigError::Invalid {
            key,
            value: format!("{mode:o}"),
        });
    }
    Ok(mode as u32)
}

fn parse_num(key: &'static str, value: &str, radix: u32) -> Result<u64, ConfigError> {
    u64::from_str_radix(value.trim(), radix).map_err(|_| ConfigError::Invalid {
        key,
        value: value.to_string(),
    })
}
